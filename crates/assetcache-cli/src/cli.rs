use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "assetcache",
    version = env!("CARGO_PKG_VERSION"),
    about = "Offline-first asset cache for the MailCraft web app",
    long_about = None
)]
pub struct Cli {
    /// Config file (defaults to ~/.config/assetcache/config.json)
    #[arg(long, global = true, env = "ASSETCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding cache buckets
    #[arg(long, global = true, env = "ASSETCACHE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Application origin, e.g. http://127.0.0.1:5000
    #[arg(long, global = true, env = "ASSETCACHE_ORIGIN")]
    pub origin: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "warn", value_enum)]
    pub log_level: LogLevel,

    /// Also write logs to a daily rolling file with this path prefix
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Precache the asset list and remove caches from older versions
    Install,
    /// Remove every cache that isn't the current version
    Activate,
    /// Request one URL through the cache
    Fetch(FetchArgs),
    /// List caches and their entries
    Status,
    /// Run a cache-first reverse proxy in front of the origin
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Path on the origin or absolute URL
    pub target: String,

    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Extra request header as "Name: value"; repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(short, long, default_value = "127.0.0.1:8081")]
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
