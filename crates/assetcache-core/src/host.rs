//! Host adapter: dispatches lifecycle signals to a `LifecycleHandler`.
//!
//! The host owns the worker's phase. Each phase transition waits for the
//! handler's work to finish before moving on, and the directives returned
//! by the handler (skip waiting, claim clients) decide whether activation
//! follows setup immediately and whether requests get routed through it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::{CacheError, Error};
use crate::models::Request;
use crate::worker::{ActivateReport, Intercepted, LifecycleHandler, SetupReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Setup done, waiting to activate
    Installed,
    Activating,
    Activated,
    /// Setup failed; this worker will never activate
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Outcome of `WorkerHost::register`
#[derive(Debug, Clone)]
pub struct Registration {
    pub setup: SetupReport,
    /// None when the worker is left waiting
    pub activation: Option<ActivateReport>,
}

pub struct WorkerHost {
    handler: Arc<dyn LifecycleHandler>,
    state: RwLock<WorkerState>,
    controlling: AtomicBool,
}

impl WorkerHost {
    pub fn new(handler: Arc<dyn LifecycleHandler>) -> Self {
        Self {
            handler,
            state: RwLock::new(WorkerState::Parsed),
            controlling: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn is_controlling(&self) -> bool {
        self.controlling.load(Ordering::Acquire)
    }

    /// Move from `from` to `to`, or fail without changing anything.
    async fn transition(
        &self,
        action: &'static str,
        from: WorkerState,
        to: WorkerState,
    ) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(Error::InvalidTransition {
                action,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    async fn set_state(&self, to: WorkerState) {
        *self.state.write().await = to;
    }

    /// Dispatch setup. A failed setup leaves the worker redundant.
    pub async fn install(&self) -> Result<SetupReport, Error> {
        self.transition("install", WorkerState::Parsed, WorkerState::Installing)
            .await?;

        match self.handler.on_setup().await {
            Ok(report) => {
                self.set_state(WorkerState::Installed).await;
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Setup failed, worker is redundant");
                self.set_state(WorkerState::Redundant).await;
                Err(e.into())
            }
        }
    }

    /// Dispatch activation. The worker is activated even when the
    /// handler's cleanup fails; the failure is logged and returned.
    pub async fn activate(&self) -> Result<ActivateReport, Error> {
        self.transition("activate", WorkerState::Installed, WorkerState::Activating)
            .await?;

        let result: Result<ActivateReport, CacheError> = self.handler.on_activate().await;
        self.set_state(WorkerState::Activated).await;

        match result {
            Ok(report) => {
                if report.claim_clients {
                    self.controlling.store(true, Ordering::Release);
                    info!("Worker activated and controlling clients");
                } else {
                    info!("Worker activated");
                }
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Activation cleanup failed");
                self.controlling.store(true, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Install, then activate straight away if the handler asked to skip waiting.
    pub async fn register(&self) -> Result<Registration, Error> {
        let setup = self.install().await?;
        let activation = if setup.skip_waiting {
            Some(self.activate().await?)
        } else {
            info!("Worker installed and waiting");
            None
        };
        Ok(Registration { setup, activation })
    }

    /// Route an intercepted request through the handler.
    pub async fn handle_fetch(&self, request: Request) -> Result<Intercepted, Error> {
        if !self.is_controlling() {
            return Err(Error::NotControlling(self.state().await));
        }
        self.handler.on_intercept(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Response;
    use crate::worker::ResponseSource;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use url::Url;

    /// Handler with scripted outcomes that records what was called
    struct ScriptedHandler {
        skip_waiting: bool,
        fail_setup: bool,
        fail_activate: bool,
        intercepts: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new() -> Self {
            Self {
                skip_waiting: true,
                fail_setup: false,
                fail_activate: false,
                intercepts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LifecycleHandler for ScriptedHandler {
        async fn on_setup(&self) -> Result<SetupReport, CacheError> {
            if self.fail_setup {
                return Err(CacheError::Io(std::io::Error::other("disk full")));
            }
            Ok(SetupReport {
                cache_name: "mailcraft-cache-v1".to_string(),
                stored: 0,
                error: None,
                skip_waiting: self.skip_waiting,
            })
        }

        async fn on_intercept(&self, _request: Request) -> Result<Intercepted, Error> {
            self.intercepts.fetch_add(1, Ordering::SeqCst);
            Ok(Intercepted {
                response: Response::new(200, "ok"),
                source: ResponseSource::Network,
            })
        }

        async fn on_activate(&self) -> Result<ActivateReport, CacheError> {
            if self.fail_activate {
                return Err(CacheError::Io(std::io::Error::other("permission denied")));
            }
            Ok(ActivateReport {
                deleted: vec!["mailcraft-cache-old".to_string()],
                claim_clients: true,
            })
        }
    }

    fn request() -> Request {
        Request::get(Url::parse("http://app.test/").unwrap())
    }

    #[tokio::test]
    async fn test_register_skips_waiting() {
        let host = WorkerHost::new(Arc::new(ScriptedHandler::new()));

        let registration = host.register().await.unwrap();
        let activation = registration.activation.expect("activated");
        assert_eq!(activation.deleted, vec!["mailcraft-cache-old"]);
        assert_eq!(host.state().await, WorkerState::Activated);
        assert!(host.is_controlling());

        let intercepted = host.handle_fetch(request()).await.unwrap();
        assert_eq!(intercepted.response.body, "ok");
    }

    #[tokio::test]
    async fn test_register_waits_without_skip_waiting() {
        let mut handler = ScriptedHandler::new();
        handler.skip_waiting = false;
        let host = WorkerHost::new(Arc::new(handler));

        let registration = host.register().await.unwrap();
        assert!(registration.activation.is_none());
        assert_eq!(host.state().await, WorkerState::Installed);

        let err = host.handle_fetch(request()).await.unwrap_err();
        assert!(matches!(err, Error::NotControlling(WorkerState::Installed)));

        host.activate().await.unwrap();
        assert!(host.handle_fetch(request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_setup_is_redundant() {
        let mut handler = ScriptedHandler::new();
        handler.fail_setup = true;
        let host = WorkerHost::new(Arc::new(handler));

        assert!(host.register().await.is_err());
        assert_eq!(host.state().await, WorkerState::Redundant);
        assert!(!host.is_controlling());

        let err = host.activate().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                action: "activate",
                state: WorkerState::Redundant
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_activation_still_activates() {
        let mut handler = ScriptedHandler::new();
        handler.fail_activate = true;
        let host = WorkerHost::new(Arc::new(handler));

        assert!(host.register().await.is_err());
        assert_eq!(host.state().await, WorkerState::Activated);
        assert!(host.is_controlling());
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let host = WorkerHost::new(Arc::new(ScriptedHandler::new()));
        host.install().await.unwrap();

        let err = host.install().await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { action: "install", .. }));
    }

    #[tokio::test]
    async fn test_fetch_before_install_is_rejected() {
        let handler = Arc::new(ScriptedHandler::new());
        let host = WorkerHost::new(handler.clone());

        let err = host.handle_fetch(request()).await.unwrap_err();
        assert!(matches!(err, Error::NotControlling(WorkerState::Parsed)));
        assert_eq!(handler.intercepts.load(Ordering::SeqCst), 0);
    }
}
