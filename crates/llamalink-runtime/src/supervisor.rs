//! Supervisor for the proxy server lifecycle.
//!
//! The supervisor owns the service state machine:
//!
//! ```text
//! Stopped --start()--> Starting --bind ok--> Running
//! Starting --bind failed--> Failed
//! Running --stop()--> Stopping --drain--> Stopped
//! Running --reconfigure(cfg)--> Stopping --> Starting(cfg) --> Running
//! Failed --start()--> Starting
//! ```
//!
//! Key design decisions:
//! - **Bind-then-report**: the `TcpListener` binds FIRST, then the real
//!   address is reported; a bind failure never leaves a half-started task.
//! - **Serialized transitions**: commands take the internal mutex with
//!   `try_lock`; a command arriving mid-transition is rejected with
//!   [`SupervisorError::Busy`], never queued.
//! - **Internal state ownership**: adapters (tray, CLI) call methods on the
//!   supervisor and watch the published [`ServiceState`]; none of them hold
//!   server handles themselves.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result as AnyResult;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use llamalink_core::{Config, ConfigError, ServiceState};

/// How long `stop` waits for in-flight requests to drain before the server
/// task is aborted. Streaming connections past this grace period are closed
/// forcibly so shutdown always completes.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Listen host. The proxy fronts a local developer tool; it is not meant to
/// be reachable from other machines.
const BIND_HOST: &str = "127.0.0.1";

/// Handle to a running proxy server.
struct ServerHandle {
    /// Cancellation token for graceful shutdown.
    cancel_token: CancellationToken,
    /// Join handle for the server task (returns Result for error propagation).
    join_handle: JoinHandle<AnyResult<()>>,
    /// Address the server is bound to.
    bound_addr: SocketAddr,
}

/// State behind the transition mutex.
struct Inner {
    config: Config,
    handle: Option<ServerHandle>,
}

/// Error from supervisor commands.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Another lifecycle transition holds the state machine.
    #[error("Another lifecycle transition is in progress")]
    Busy,

    /// `start` was issued while the server is running.
    #[error("Proxy is already running on {0}")]
    AlreadyRunning(SocketAddr),

    /// `stop` was issued with no server running.
    #[error("Proxy is not running")]
    NotRunning,

    /// Binding the listener failed (typically: port in use). Drives the
    /// state to [`ServiceState::Failed`] for the caller to surface.
    #[error("Failed to bind to {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// `reconfigure` was handed an invalid config.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Supervisor owning the proxy server lifecycle.
///
/// # Example
///
/// ```ignore
/// let supervisor = ServiceSupervisor::new(config);
/// let addr = supervisor.start().await?;
/// println!("Status: {}", supervisor.status().await);
/// supervisor.stop().await?;
/// ```
pub struct ServiceSupervisor {
    /// Transition lock; held for the full duration of every transition.
    inner: Mutex<Inner>,
    /// Published service state, readable without the lock.
    state_tx: watch::Sender<ServiceState>,
}

impl ServiceSupervisor {
    /// Create a supervisor in the `Stopped` state with the given config.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::Stopped);
        Self {
            inner: Mutex::new(Inner {
                config,
                handle: None,
            }),
            state_tx,
        }
    }

    /// Subscribe to service state changes. Handlers and the tray indicator
    /// read this channel; it never blocks on the transition lock.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    /// Start the proxy server with the current config.
    ///
    /// # Errors
    ///
    /// `Busy` if a transition is in progress, `AlreadyRunning` if the server
    /// is up, `BindFailed` if the listener cannot bind (state goes to
    /// `Failed`; a later `start` retries).
    pub async fn start(&self) -> Result<SocketAddr, SupervisorError> {
        let mut guard = self.inner.try_lock().map_err(|_| SupervisorError::Busy)?;
        self.start_locked(&mut guard).await
    }

    /// Stop the proxy server, draining in-flight requests.
    ///
    /// Waits up to [`STOP_GRACE`] for the server task to finish after
    /// cancellation, then aborts it — long-lived streaming connections must
    /// not be able to wedge shutdown.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut guard = self.inner.try_lock().map_err(|_| SupervisorError::Busy)?;
        self.stop_locked(&mut guard).await
    }

    /// Replace the configuration.
    ///
    /// While stopped this just swaps the config (no transition). While
    /// running it performs stop-then-start under one lock, so no connection
    /// is ever accepted against the stale config. Returns the new bound
    /// address when a restart happened.
    pub async fn reconfigure(
        &self,
        new_config: Config,
    ) -> Result<Option<SocketAddr>, SupervisorError> {
        new_config.validate()?;
        let mut guard = self.inner.try_lock().map_err(|_| SupervisorError::Busy)?;

        if guard.handle.is_none() {
            debug!("Reconfigure while stopped: swapping config only");
            guard.config = new_config;
            return Ok(None);
        }

        info!("Reconfiguring: restarting proxy with new config");
        if let Err(e) = self.stop_locked(&mut guard).await {
            // The old server is gone either way; carry on with the restart.
            warn!("Stop during reconfigure reported: {e}");
        }
        guard.config = new_config;
        let addr = self.start_locked(&mut guard).await?;
        Ok(Some(addr))
    }

    /// Current service state.
    ///
    /// Also detects a crashed server task (finished without cancellation)
    /// and folds it into [`ServiceState::Failed`].
    pub async fn status(&self) -> ServiceState {
        let mut guard = self.inner.lock().await;

        let Some(handle) = guard.handle.as_ref() else {
            return *self.state_tx.borrow();
        };

        if handle.join_handle.is_finished() {
            let was_cancelled = handle.cancel_token.is_cancelled();
            guard.handle = None;

            if was_cancelled {
                self.set_state(ServiceState::Stopped);
                ServiceState::Stopped
            } else {
                warn!("Detected crashed proxy task, cleaning up handle");
                self.set_state(ServiceState::Failed);
                ServiceState::Failed
            }
        } else {
            ServiceState::Running
        }
    }

    /// The bound address, if the server is running.
    pub async fn bound_address(&self) -> Option<SocketAddr> {
        let guard = self.inner.lock().await;
        guard.handle.as_ref().and_then(|h| {
            if h.join_handle.is_finished() {
                None
            } else {
                Some(h.bound_addr)
            }
        })
    }

    /// A copy of the active configuration.
    pub async fn current_config(&self) -> Config {
        self.inner.lock().await.config.clone()
    }

    async fn start_locked(
        &self,
        guard: &mut MutexGuard<'_, Inner>,
    ) -> Result<SocketAddr, SupervisorError> {
        // Reap a finished handle, or refuse if the server is still up.
        if let Some(old) = guard.handle.take() {
            if !old.join_handle.is_finished() {
                let addr = old.bound_addr;
                guard.handle = Some(old);
                return Err(SupervisorError::AlreadyRunning(addr));
            }
            match old.join_handle.await {
                Ok(Ok(())) => debug!("Previous proxy task completed normally"),
                Ok(Err(e)) => warn!("Previous proxy task ended with error: {e}"),
                Err(e) => warn!("Previous proxy task panicked: {e}"),
            }
        }

        self.set_state(ServiceState::Starting);

        // Bind FIRST - the real address is known before the task spawns.
        let bind_addr = format!("{}:{}", BIND_HOST, guard.config.port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind {bind_addr}: {e}");
                self.set_state(ServiceState::Failed);
                return Err(SupervisorError::BindFailed {
                    address: bind_addr,
                    reason: e.to_string(),
                });
            }
        };

        let bound_addr = listener
            .local_addr()
            .map_err(|e| SupervisorError::Internal(format!("Failed to get local address: {e}")))?;

        info!("Proxy bound to {bound_addr}");

        let cancel_token = CancellationToken::new();
        let cancel_clone = cancel_token.clone();
        let state_rx = self.state_tx.subscribe();
        let config = guard.config.clone();

        let join_handle: JoinHandle<AnyResult<()>> = tokio::spawn(async move {
            debug!(addr = %bound_addr, "Proxy task starting");
            llamalink_proxy::serve(listener, &config, state_rx, cancel_clone).await
        });

        guard.handle = Some(ServerHandle {
            cancel_token,
            join_handle,
            bound_addr,
        });

        self.set_state(ServiceState::Running);
        Ok(bound_addr)
    }

    async fn stop_locked(
        &self,
        guard: &mut MutexGuard<'_, Inner>,
    ) -> Result<(), SupervisorError> {
        let handle = match guard.handle.take() {
            Some(h) => h,
            None => return Err(SupervisorError::NotRunning),
        };

        info!("Stopping proxy on {}", handle.bound_addr);
        self.set_state(ServiceState::Stopping);

        // Signal cancellation; graceful shutdown drains in-flight requests.
        handle.cancel_token.cancel();

        // Keep ownership of join_handle so we can abort on timeout.
        let mut join = handle.join_handle;

        let result = match tokio::time::timeout(STOP_GRACE, &mut join).await {
            Ok(Ok(Ok(()))) => {
                info!("Proxy stopped cleanly");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!("Proxy task ended with error: {e}");
                Err(SupervisorError::Internal(format!("Proxy error: {e}")))
            }
            Ok(Err(join_err)) => {
                error!("Proxy task panicked: {join_err}");
                Err(SupervisorError::Internal(format!(
                    "Task panicked: {join_err}"
                )))
            }
            Err(_) => {
                // Streaming connections can outlive the drain; force them.
                warn!("Proxy stop exceeded grace period; aborting task");
                join.abort();
                Ok(())
            }
        };

        // Whatever happened to the task, the server is gone.
        self.set_state(ServiceState::Stopped);
        result
    }

    fn set_state(&self, state: ServiceState) {
        self.state_tx.send_replace(state);
    }
}

impl std::fmt::Debug for ServiceSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSupervisor")
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ephemeral-port config pointing at an upstream that is never called.
    fn test_config(port: u16) -> Config {
        Config {
            port,
            ..Default::default()
        }
    }

    /// Reserve a currently-free port by binding and dropping a listener.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_supervisor_lifecycle() {
        let supervisor = ServiceSupervisor::new(test_config(0));

        // Initially stopped
        assert_eq!(supervisor.status().await, ServiceState::Stopped);

        // Start on an ephemeral port
        let addr = supervisor.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(supervisor.status().await, ServiceState::Running);
        assert_eq!(supervisor.bound_address().await, Some(addr));

        // Can't start again
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::AlreadyRunning(running)) if running == addr
        ));

        // Stop
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.status().await, ServiceState::Stopped);

        // Stopping twice reports NotRunning and the state stays Stopped.
        assert!(matches!(
            supervisor.stop().await,
            Err(SupervisorError::NotRunning)
        ));
        assert_eq!(supervisor.status().await, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let supervisor = ServiceSupervisor::new(test_config(0));

        let addr1 = supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();

        let addr2 = supervisor.start().await.unwrap();
        assert_ne!(addr1.port(), 0);
        assert_ne!(addr2.port(), 0);
        assert_eq!(supervisor.status().await, ServiceState::Running);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_drives_failed_then_recovers() {
        // Hold the port so the supervisor's bind must fail.
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = blocker.local_addr().unwrap().port();

        let supervisor = ServiceSupervisor::new(test_config(taken_port));
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::BindFailed { .. })
        ));
        assert_eq!(supervisor.status().await, ServiceState::Failed);

        // Failed --start()--> Starting is a legal retry.
        drop(blocker);
        let addr = supervisor.start().await.unwrap();
        assert_eq!(addr.port(), taken_port);
        assert_eq!(supervisor.status().await, ServiceState::Running);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_rejected_while_transition_in_progress() {
        let supervisor = ServiceSupervisor::new(test_config(0));

        // Simulate an in-flight transition by holding the transition lock.
        let guard = supervisor.inner.try_lock().unwrap();

        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::Busy)
        ));
        assert!(matches!(supervisor.stop().await, Err(SupervisorError::Busy)));
        assert!(matches!(
            supervisor.reconfigure(test_config(18080)).await,
            Err(SupervisorError::Busy)
        ));

        drop(guard);
        // The rejected commands left no mark; the machine still works.
        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_while_stopped_swaps_config_without_transition() {
        let supervisor = ServiceSupervisor::new(test_config(0));
        let mut state_rx = supervisor.state_receiver();

        let new_port = free_port().await;
        let result = supervisor.reconfigure(test_config(new_port)).await.unwrap();

        assert_eq!(result, None);
        assert_eq!(supervisor.status().await, ServiceState::Stopped);
        assert_eq!(supervisor.current_config().await.port, new_port);
        // No transition was published.
        assert!(!state_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_reconfigure_while_running_rebinds() {
        let supervisor = ServiceSupervisor::new(test_config(0));
        let addr1 = supervisor.start().await.unwrap();

        let new_port = free_port().await;
        let addr2 = supervisor
            .reconfigure(test_config(new_port))
            .await
            .unwrap()
            .expect("running reconfigure restarts the server");

        assert_eq!(addr2.port(), new_port);
        assert_ne!(addr2, addr1);
        assert_eq!(supervisor.status().await, ServiceState::Running);
        assert_eq!(supervisor.bound_address().await, Some(addr2));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_invalid_config() {
        let supervisor = ServiceSupervisor::new(test_config(0));
        let bad = Config {
            timeout: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            supervisor.reconfigure(bad).await,
            Err(SupervisorError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_state_watch_observes_transitions() {
        let supervisor = ServiceSupervisor::new(test_config(0));
        let mut rx = supervisor.state_receiver();
        assert_eq!(*rx.borrow(), ServiceState::Stopped);

        supervisor.start().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ServiceState::Running);

        supervisor.stop().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ServiceState::Stopped);
    }
}
