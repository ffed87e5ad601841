//! Lifecycle of a single supervised OS process.
//!
//! A [`Process`] is single-use: it is created for one launch (or one
//! attachment), observes that process until exit and is then discarded. The
//! restart policy lives above it, in the manager.

use crate::config::StopOptions;
use crate::container::{Container, ProcessTransport};
use shepherd_common::{Error, ExitStatus, Result, Signal};
use shepherd_process::ProcessHandle;
use shepherd_store::AppConfig;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Default)]
struct ProcState {
    handle: Option<Arc<dyn ProcessHandle>>,
    container: Option<Arc<dyn Container>>,
    /// Launch (or attach) completed.
    started: bool,
    /// This process was re-attached rather than spawned here.
    restored: bool,
    exited: bool,
    exit: Option<ExitStatus>,
}

struct Shared {
    config: AppConfig,
    transport: Arc<dyn ProcessTransport>,
    state: Mutex<ProcState>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One spawned-or-attached application process plus its container channel.
pub struct Process {
    shared: Arc<Shared>,
}

impl Process {
    pub fn new(config: AppConfig, transport: Arc<dyn ProcessTransport>) -> Self {
        let (exit_tx, _exit_rx) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state: Mutex::new(ProcState::default()),
                exit_tx,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().handle.as_ref().map(|h| h.pid())
    }

    pub fn alive(&self) -> bool {
        let st = self.shared.lock();
        !st.exited && st.handle.as_ref().map(|h| h.alive()).unwrap_or(false)
    }

    pub fn exited(&self) -> bool {
        self.shared.lock().exited
    }

    pub fn restored(&self) -> bool {
        self.shared.lock().restored
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.lock().exit.clone()
    }

    pub fn container(&self) -> Option<Arc<dyn Container>> {
        self.shared.lock().container.clone()
    }

    /// Spawn the process, connect its container and run the application.
    ///
    /// A dropped connection during the container `start` call means the
    /// process exited synchronously: the launch is treated as successful and
    /// the exit pump reports the real outcome. Any other failure force-kills
    /// the fresh process before returning.
    pub async fn start(&self) -> Result<()> {
        {
            let st = self.shared.lock();
            if st.started {
                return Err(Error::illegal_state("Has been already started"));
            }
        }

        let handle = self.shared.transport.spawn(&self.shared.config).await?;
        let pid = handle.pid();
        debug!(app = %self.shared.config.name, pid, "process spawned");
        {
            let mut st = self.shared.lock();
            st.handle = Some(handle.clone());
        }
        self.pump_exit(handle.clone());

        let container = match self.shared.transport.connect(&self.shared.config, pid).await {
            Ok(container) => container,
            Err(err) => {
                let _ = handle.kill(Signal::Kill);
                return Err(Error::connect_failed(
                    &self.shared.config.name,
                    err.to_string(),
                ));
            }
        };

        if let Err(err) = container.start().await {
            if err.is_disconnect() {
                // The process exited in the middle of the handshake. The
                // launch still counts as started; the exit pump reports the
                // real outcome.
                debug!(app = %self.shared.config.name, pid, error = %err,
                       "peer dropped during start, deferring to the exit");
                let mut st = self.shared.lock();
                st.container = Some(container);
                st.started = true;
                return Ok(());
            }
            let _ = handle.kill(Signal::Kill);
            return Err(Error::start_failed(
                &self.shared.config.name,
                err.to_string(),
            ));
        }

        {
            let mut st = self.shared.lock();
            st.container = Some(container.clone());
            st.started = true;
        }
        self.guard_disconnect(container.closed(), handle);
        Ok(())
    }

    /// Take over a process that outlived a previous supervisor run.
    pub async fn attach(&self, pid: u32) -> Result<()> {
        {
            let st = self.shared.lock();
            if st.started {
                return Err(Error::illegal_state("Has been already started"));
            }
        }

        let container = self
            .shared
            .transport
            .connect(&self.shared.config, pid)
            .await
            .map_err(|err| {
                Error::connect_failed(&self.shared.config.name, err.to_string())
            })?;
        container.ping().await?;

        let handle = self.shared.transport.attach(pid, Some(container.closed()));
        {
            let mut st = self.shared.lock();
            st.handle = Some(handle.clone());
            st.container = Some(container);
            st.started = true;
            st.restored = true;
        }
        self.pump_exit(handle);
        debug!(app = %self.shared.config.name, pid, "process attached");
        Ok(())
    }

    pub fn kill(&self, signal: Signal) -> Result<()> {
        let st = self.shared.lock();
        if st.exited {
            return Err(Error::illegal_state("Has already exited"));
        }
        match &st.handle {
            Some(handle) => handle.kill(signal),
            None => Err(Error::illegal_state("Has not been started")),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let container = self
            .container()
            .ok_or_else(|| Error::illegal_state("No connection with the peer"))?;
        container.ping().await
    }

    /// Resolve with the exit status; errors when the exit already happened.
    pub async fn wait_for_exit(&self) -> Result<ExitStatus> {
        if self.exited() {
            return Err(Error::illegal_state("Has already exited"));
        }
        Ok(self.await_exit().await)
    }

    /// Watch that fires exactly once with the exit status.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.shared.exit_tx.subscribe()
    }

    /// Bring the process down. Graceful stops hand the container a chance to
    /// wind down and fall back to SIGKILL after the timeout; non-graceful
    /// stops go straight to SIGKILL. Resolves once the exit is confirmed.
    pub async fn exit(&self, options: StopOptions) -> Result<()> {
        let (handle, container) = {
            let st = self.shared.lock();
            if st.exited {
                return Ok(());
            }
            (st.handle.clone(), st.container.clone())
        };
        let handle = handle.ok_or_else(|| Error::illegal_state("Has not been started"))?;

        if options.graceful {
            if let Some(container) = container {
                tokio::spawn(async move {
                    if let Err(err) = container.initiate_graceful_shutdown().await {
                        debug!(error = %err, "graceful shutdown request failed");
                    }
                });
            }
            tokio::select! {
                _ = self.await_exit() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(options.timeout_ms)) => {
                    warn!(app = %self.shared.config.name, "graceful stop timed out, killing");
                }
            }
        }

        // The process may beat the signal to the exit; losing that race is
        // fine, await_exit resolves either way.
        let _ = handle.kill(Signal::Kill);
        self.await_exit().await;
        Ok(())
    }

    async fn await_exit(&self) -> ExitStatus {
        let mut rx = self.shared.exit_tx.subscribe();
        loop {
            if let Some(status) = rx.borrow_and_update().clone() {
                return status;
            }
            if rx.changed().await.is_err() {
                return ExitStatus::unknown();
            }
        }
    }

    fn pump_exit(&self, handle: Arc<dyn ProcessHandle>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let status = handle.wait().await;
            {
                let mut st = shared.lock();
                st.exited = true;
                st.exit = Some(status.clone());
            }
            debug!(app = %shared.config.name, pid = handle.pid(), %status, "process exited");
            let _ = shared.exit_tx.send(Some(status));
        });
    }

    /// Kill the process if its control channel drops while it still runs, so
    /// a torn connection never leaves an unreachable process behind.
    fn guard_disconnect(&self, mut closed: watch::Receiver<bool>, handle: Arc<dyn ProcessHandle>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                if *closed.borrow_and_update() {
                    break;
                }
                if closed.changed().await.is_err() {
                    return;
                }
            }
            if !shared.lock().exited {
                warn!(app = %shared.config.name, "peer disconnected, killing the process");
                let _ = handle.kill(Signal::Kill);
            }
        });
    }
}
