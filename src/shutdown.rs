// ABOUTME: Graceful shutdown: drain the broker, persist the checkpoint, report an exit code once
// ABOUTME: Also hosts signal handling, the relay supervisor and periodic checkpoints

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::checkpoint::{CheckpointStore, PositionHandle, ResumePosition};
use crate::error::{RelayError, EXIT_OK, EXIT_RELAY_FAILURE};
use crate::relay::RelayExit;

/// Extra time granted to the blocking flush before it is abandoned.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Persisting,
    Terminated,
}

/// Termination signals handled by the relay. All of them shut down the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Terminate,
    Interrupt,
    Quit,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalKind::Terminate => "SIGTERM",
            SignalKind::Interrupt => "SIGINT",
            SignalKind::Quit => "SIGQUIT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(SignalKind),
    SourceExhausted,
    RelayFailed(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(kind) => write!(f, "received {}", kind),
            ShutdownReason::SourceExhausted => f.write_str("source exhausted"),
            ShutdownReason::RelayFailed(message) => write!(f, "relay failed: {}", message),
        }
    }
}

/// Outcome of the one shutdown sequence that actually ran.
#[derive(Debug)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// Position captured before the broker was drained; this is what was saved.
    pub position: ResumePosition,
    pub flush: Result<(), RelayError>,
    pub checkpoint: Result<(), RelayError>,
}

impl ShutdownReport {
    /// A failed checkpoint save wins over everything else.
    pub fn exit_code(&self) -> u8 {
        if let Err(err) = &self.checkpoint {
            return err.exit_code();
        }
        match self.reason {
            ShutdownReason::RelayFailed(_) => EXIT_RELAY_FAILURE,
            ShutdownReason::Signal(_) | ShutdownReason::SourceExhausted => EXIT_OK,
        }
    }
}

/// Runs the drain-and-persist sequence exactly once per process.
///
/// Periodic checkpoints go through the same coordinator so they never race
/// the final save.
pub struct ShutdownCoordinator<B, C> {
    broker: Arc<B>,
    store: Arc<C>,
    position: PositionHandle,
    flush_timeout: Duration,
    state: Mutex<ShutdownState>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl<B, C> ShutdownCoordinator<B, C>
where
    B: Broker,
    C: CheckpointStore,
{
    pub fn new(
        broker: Arc<B>,
        store: Arc<C>,
        position: PositionHandle,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            position,
            flush_timeout,
            state: Mutex::new(ShutdownState::Running),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: ShutdownState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(from = ?*state, to = ?to, "shutdown state transition");
        *state = to;
    }

    /// Leave `Running`. Only the first caller wins.
    fn begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ShutdownState::Running {
            return false;
        }
        *state = ShutdownState::Draining;
        true
    }

    /// Flush the broker and persist the current position.
    ///
    /// Returns `None` when a shutdown is already in progress or finished;
    /// such calls have no effect.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Option<ShutdownReport> {
        if !self.begin() {
            tracing::info!(reason = %reason, "Shutdown already in progress, ignoring");
            return None;
        }
        tracing::info!(reason = %reason, "Shutting down, draining broker");

        let _persist = self.persist_lock.lock().await;

        // Captured before the flush: everything up to here was handed to the broker.
        let position = self.position.current();
        let flush = self.drain().await;
        match &flush {
            Ok(()) => tracing::info!("Broker drained"),
            Err(err) => tracing::warn!(
                "Broker drain failed, persisting position anyway: {}",
                err
            ),
        }

        self.transition(ShutdownState::Persisting);
        let checkpoint = self.persist(&position);
        match &checkpoint {
            Ok(()) => tracing::info!(position = %position, "Checkpoint persisted"),
            Err(err) => tracing::error!(
                "Checkpoint NOT persisted, the next run may reprocess or skip events: {}",
                err
            ),
        }

        self.transition(ShutdownState::Terminated);
        Some(ShutdownReport {
            reason,
            position,
            flush,
            checkpoint,
        })
    }

    /// Save a checkpoint while running.
    ///
    /// The position is saved only if the broker drains first, so a periodic
    /// checkpoint never gets ahead of acknowledged deliveries. Returns
    /// `Ok(false)` when skipped because shutdown has begun or nothing has
    /// been relayed yet.
    pub async fn checkpoint(&self) -> Result<bool, RelayError> {
        let _persist = self.persist_lock.lock().await;
        if self.state() != ShutdownState::Running {
            return Ok(false);
        }
        let position = self.position.current();
        if position.is_fresh() {
            return Ok(false);
        }
        self.drain().await?;
        self.store.save(&position)?;
        tracing::debug!(position = %position, "periodic checkpoint saved");
        Ok(true)
    }

    fn persist(&self, position: &ResumePosition) -> Result<(), RelayError> {
        if position.is_fresh() {
            tracing::info!("No position reached yet, leaving checkpoint untouched");
            return Ok(());
        }
        self.store.save(position)
    }

    async fn drain(&self) -> Result<(), RelayError> {
        let broker = Arc::clone(&self.broker);
        let timeout = self.flush_timeout;
        let flush = tokio::task::spawn_blocking(move || broker.flush(timeout));
        match tokio::time::timeout(timeout + FLUSH_GRACE, flush).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(RelayError::BrokerFlush(format!("flush task failed: {}", err))),
            Err(_) => Err(RelayError::BrokerFlush(format!(
                "flush did not return within {:?}",
                timeout + FLUSH_GRACE
            ))),
        }
    }
}

/// Listens for SIGTERM, SIGINT and SIGQUIT (Ctrl-C only off unix).
pub struct SignalListener {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    quit: tokio::signal::unix::Signal,
}

impl SignalListener {
    /// Install the handlers. Must run before the relay starts so no signal
    /// falls through to the default disposition.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind as UnixSignal};
        Ok(Self {
            terminate: signal(UnixSignal::terminate())?,
            interrupt: signal(UnixSignal::interrupt())?,
            quit: signal(UnixSignal::quit())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    pub async fn recv(&mut self) -> SignalKind {
        tokio::select! {
            Some(()) = self.terminate.recv() => SignalKind::Terminate,
            Some(()) = self.interrupt.recv() => SignalKind::Interrupt,
            Some(()) = self.quit.recv() => SignalKind::Quit,
            else => std::future::pending::<SignalKind>().await,
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> SignalKind {
        match tokio::signal::ctrl_c().await {
            Ok(()) => SignalKind::Interrupt,
            Err(_) => std::future::pending::<SignalKind>().await,
        }
    }

    /// Deliver every received signal, including repeats, on a channel.
    pub fn forward(mut self) -> mpsc::UnboundedReceiver<SignalKind> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let kind = self.recv().await;
                if tx.send(kind).is_err() {
                    break;
                }
            }
        });
        rx
    }
}

/// Run `relay` until it ends or a signal arrives, then shut down.
///
/// The relay future is dropped before the shutdown sequence starts. Signals
/// that arrive while shutting down are handed to the coordinator, which
/// ignores them.
pub async fn supervise<F, B, C>(
    relay: F,
    coordinator: &ShutdownCoordinator<B, C>,
    signals: &mut mpsc::UnboundedReceiver<SignalKind>,
) -> Option<ShutdownReport>
where
    F: Future<Output = Result<RelayExit, RelayError>>,
    B: Broker,
    C: CheckpointStore,
{
    let reason = tokio::select! {
        result = relay => match result {
            Ok(RelayExit::SourceExhausted) => ShutdownReason::SourceExhausted,
            Err(err) => {
                tracing::error!("Relay stopped: {}", err);
                ShutdownReason::RelayFailed(err.to_string())
            }
        },
        Some(kind) = signals.recv() => {
            tracing::info!("Received {}", kind);
            ShutdownReason::Signal(kind)
        }
    };

    let shutdown = coordinator.shutdown(reason);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            report = &mut shutdown => return report,
            Some(kind) = signals.recv() => {
                coordinator.shutdown(ShutdownReason::Signal(kind)).await;
            }
        }
    }
}

/// Checkpoint every `interval` until shutdown begins.
pub fn spawn_periodic_checkpoints<B, C>(
    coordinator: Arc<ShutdownCoordinator<B, C>>,
    interval: Duration,
) -> JoinHandle<()>
where
    B: Broker,
    C: CheckpointStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if coordinator.state() != ShutdownState::Running {
                break;
            }
            if let Err(err) = coordinator.checkpoint().await {
                tracing::warn!("Periodic checkpoint skipped: {}", err);
            }
        }
    })
}
