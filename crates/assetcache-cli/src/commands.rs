//! Subcommand implementations.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use assetcache_core::{
    AppConfig, CacheWorker, DiskCacheStorage, HttpFetcher, LifecycleHandler, Method, Registration,
    Request, ResponseSource, WorkerHost,
};
use tracing::{debug, info};

use crate::cli::{Cli, FetchArgs, ServeArgs};
use crate::proxy;

/// The worker plus the host that drives it
pub struct Runtime {
    pub worker: Arc<CacheWorker>,
    pub host: Arc<WorkerHost>,
}

impl Runtime {
    /// Load config, apply command-line overrides and wire up disk storage
    /// with an HTTP fetcher for the configured origin.
    pub fn build(cli: &Cli) -> Result<Self> {
        let mut app = match &cli.config {
            Some(path) => AppConfig::load_from(path),
            None => AppConfig::load(),
        }
        .context("Failed to load config")?;

        if let Some(origin) = &cli.origin {
            app = app.with_origin(origin.clone());
        }
        if let Some(dir) = &cli.cache_dir {
            app = app.with_cache_dir(dir.clone());
        }

        let config = app.cache_config()?;
        let cache_dir = app.cache_dir()?;
        debug!(cache_dir = %cache_dir.display(), origin = %config.origin(), "Runtime config");

        let storage = Arc::new(
            DiskCacheStorage::new(cache_dir.clone())
                .with_context(|| format!("Failed to open cache directory {}", cache_dir.display()))?,
        );
        let fetcher = Arc::new(HttpFetcher::new(config.origin().clone())?);
        let worker = Arc::new(CacheWorker::new(config, storage, fetcher));
        let host = Arc::new(WorkerHost::new(worker.clone()));

        Ok(Self { worker, host })
    }

    async fn register(&self) -> Result<Registration> {
        let registration = self
            .host
            .register()
            .await
            .context("Worker registration failed")?;
        if let Some(err) = &registration.setup.error {
            eprintln!("Warning: precache incomplete: {}", err);
        }
        Ok(registration)
    }
}

pub async fn install(rt: &Runtime) -> Result<()> {
    let registration = rt.register().await?;

    println!("Cache:      {}", registration.setup.cache_name);
    println!("Precached:  {} assets", registration.setup.stored);
    match &registration.activation {
        Some(report) if report.deleted.is_empty() => println!("Removed:    none"),
        Some(report) => println!("Removed:    {}", report.deleted.join(", ")),
        None => println!("Worker installed and waiting"),
    }
    Ok(())
}

pub async fn activate(rt: &Runtime) -> Result<()> {
    let report = rt.worker.on_activate().await?;
    if report.deleted.is_empty() {
        println!("No stale caches");
    }
    for name in &report.deleted {
        println!("Deleted {}", name);
    }
    Ok(())
}

pub async fn fetch(rt: &Runtime, args: &FetchArgs) -> Result<()> {
    let request = build_request(rt, args)?;
    rt.register().await?;

    let intercepted = rt.host.handle_fetch(request).await?;
    let response = &intercepted.response;
    let source = match intercepted.source {
        ResponseSource::Cache => "cache",
        ResponseSource::Network => "network",
    };
    eprintln!("{} {} ({})", response.status, response.status_text, source);

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response.body)?;
    stdout.flush()?;

    rt.worker.settle().await;
    Ok(())
}

pub async fn status(rt: &Runtime) -> Result<()> {
    let config = rt.worker.config();
    let storage = rt.worker.storage();
    println!("Origin: {}", config.origin());

    let names = storage.keys().await?;
    if names.is_empty() {
        println!("No caches (run `assetcache install`)");
        return Ok(());
    }

    for name in names {
        let marker = if config.is_current(&name) { " (current)" } else { "" };
        let Some(bucket) = storage.get(&name).await? else {
            continue;
        };
        let entries = bucket.keys().await?;
        println!("\n{}{} - {} entries", name, marker, entries.len());
        for entry in entries {
            println!(
                "  {:>3}  {:>9}  {:>8}  {}",
                entry.status,
                format_size(entry.size_bytes),
                entry.age_display(),
                entry.url
            );
        }
    }
    Ok(())
}

pub async fn serve(rt: &Runtime, args: &ServeArgs) -> Result<()> {
    rt.register().await?;
    info!(listen = %args.listen, "Starting proxy");
    proxy::serve(rt.host.clone(), rt.worker.clone(), args.listen).await?;

    let stats = rt.worker.stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        stored = stats.stored,
        bytes_saved = stats.bytes_saved,
        "Proxy stopped"
    );
    Ok(())
}

fn build_request(rt: &Runtime, args: &FetchArgs) -> Result<Request> {
    let url = rt.worker.config().resolve(&args.target)?;
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid method: {}", args.method))?;

    let mut request = Request::new(method, url);
    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        request = request.with_header(name, value);
    }
    Ok(request)
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => bail!("Header must look like \"Name: value\", got {:?}", raw),
    }
}

fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
