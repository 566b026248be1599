/// Termination state machine: Idle -> Terminating -> (Prolonged) -> Exiting.
///
/// A termination signal or an internal request cancels the process context,
/// then the process gets a fixed grace period, extendable once, before it is
/// forcibly exited with [`EXIT_CODE_TERMINATED`].
use crate::backend::SignalBackend;
use crate::context::ProcessContext;
use crate::signal::Signal;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Time between cancelling the process context and the forced exit.
pub const GRACE_PERIOD: Duration = Duration::from_millis(1500);

/// Extra time granted by a successful [`TerminationCoordinator::request_prolongation`].
pub const PROLONGATION: Duration = Duration::from_secs(10);

/// Exit status of every coordinated termination.
pub const EXIT_CODE_TERMINATED: i32 = 100;

/// Terminates the process with the given status. Swapped out in tests.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// The real process exit.
pub fn process_exit() -> ExitFn {
    Arc::new(|code: i32| std::process::exit(code))
}

pub type StrategyFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type StrategyFn = dyn Fn(ProcessContext, Option<Signal>) -> StrategyFuture + Send + Sync;

/// How a termination request is carried out.
#[derive(Clone, Default)]
pub enum TerminationStrategy {
    /// Cancel the context, wait out the grace period, exit with status 100.
    #[default]
    Graceful,
    /// Caller-supplied; decides itself when or whether to cancel and exit.
    /// The signal is `None` for internal requests.
    Custom(Arc<StrategyFn>),
    /// No coordinated shutdown: termination signals get the platform default.
    Disabled,
}

impl TerminationStrategy {
    pub fn custom<F, Fut>(strategy: F) -> Self
    where
        F: Fn(ProcessContext, Option<Signal>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        TerminationStrategy::Custom(Arc::new(move |ctx, signal| {
            Box::pin(strategy(ctx, signal)) as StrategyFuture
        }))
    }
}

impl std::fmt::Debug for TerminationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationStrategy::Graceful => write!(f, "Graceful"),
            TerminationStrategy::Custom(_) => write!(f, "Custom"),
            TerminationStrategy::Disabled => write!(f, "Disabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPhase {
    #[default]
    Idle,
    Terminating,
    Prolonged,
    Exiting,
}

/// Errors returned by [`TerminationCoordinator::request_prolongation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProlongationError {
    /// The reason was empty.
    NeedsReason,
    /// No graceful termination is in progress.
    WithoutTermination,
    /// This termination was already prolonged once.
    AlreadyRequested,
    /// The grace period is over and the process is exiting.
    TooLate,
}

impl std::fmt::Display for ProlongationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProlongationError::NeedsReason => {
                write!(f, "a reason is required to prolong shutdown")
            }
            ProlongationError::WithoutTermination => {
                write!(f, "shutdown can only be prolonged during termination")
            }
            ProlongationError::AlreadyRequested => {
                write!(f, "shutdown prolongation has already been requested")
            }
            ProlongationError::TooLate => {
                write!(f, "grace period is over, the process is exiting")
            }
        }
    }
}

impl std::error::Error for ProlongationError {}

/// Serializable snapshot of the termination state.
#[derive(Debug, Clone, Serialize)]
pub struct TerminationStatus {
    pub phase: TerminationPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub prolonged: bool,
    /// Milliseconds left before the forced exit.
    pub remaining_ms: Option<u64>,
}

// `deadline` is None until started; it only ever moves forward.
#[derive(Debug, Default)]
struct TerminationState {
    phase: TerminationPhase,
    started: bool,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    prolonged: bool,
    deadline: Option<Instant>,
}

pub struct TerminationCoordinator {
    context: ProcessContext,
    backend: Arc<dyn SignalBackend>,
    strategy: Mutex<TerminationStrategy>,
    state: RwLock<TerminationState>,
    triggered: AtomicBool,
    exit: ExitFn,
}

impl TerminationCoordinator {
    pub fn new(context: ProcessContext, backend: Arc<dyn SignalBackend>, exit: ExitFn) -> Self {
        Self {
            context,
            backend,
            strategy: Mutex::new(TerminationStrategy::default()),
            state: RwLock::new(TerminationState::default()),
            triggered: AtomicBool::new(false),
            exit,
        }
    }

    /// Replace the strategy used by the next trigger. A termination already
    /// in progress keeps the strategy it started with.
    pub fn set_strategy(&self, strategy: TerminationStrategy) {
        tracing::debug!(?strategy, "termination strategy set");
        *self.strategy.lock() = strategy;
    }

    pub fn enable_default_strategy(&self) {
        self.set_strategy(TerminationStrategy::Graceful);
    }

    pub fn disable(&self) {
        self.set_strategy(TerminationStrategy::Disabled);
    }

    /// Start termination. Only the first call has any effect.
    ///
    /// With the graceful strategy this does not return in production: it
    /// ends with the process exiting.
    pub async fn trigger(&self, signal: Option<Signal>) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(signal = ?signal, "termination already in progress");
            return;
        }

        let strategy = self.strategy.lock().clone();
        match strategy {
            TerminationStrategy::Graceful => {
                self.state.write().phase = TerminationPhase::Terminating;
                self.graceful().await;
            }
            TerminationStrategy::Custom(strategy) => {
                self.state.write().phase = TerminationPhase::Terminating;
                tracing::debug!(signal = ?signal, "running custom termination strategy");
                strategy(self.context.clone(), signal).await;
            }
            TerminationStrategy::Disabled => match signal {
                Some(signal) => {
                    self.state.write().phase = TerminationPhase::Terminating;
                    tracing::warn!(signal = %signal, "termination handling disabled, using default disposition");
                    if let Err(e) = self.backend.raise_default(signal) {
                        tracing::error!(signal = %signal, error = %e, "failed to restore default signal disposition");
                    }
                }
                None => {
                    // Nothing happened; leave the coordinator idle.
                    self.triggered.store(false, Ordering::SeqCst);
                    tracing::warn!("termination requested but termination handling is disabled");
                }
            },
        }
    }

    async fn graceful(&self) {
        let deadline = {
            let mut state = self.state.write();
            let now = Instant::now();
            state.started = true;
            state.started_at = Some(now);
            state.started_wall = Some(Utc::now());
            state.prolonged = false;
            state.deadline = Some(now + GRACE_PERIOD);
            now + GRACE_PERIOD
        };
        tracing::info!(
            grace_ms = GRACE_PERIOD.as_millis() as u64,
            "graceful shutdown started"
        );

        self.context.cancel();
        tokio::time::sleep_until(deadline).await;

        // Decide under the lock so a prolongation cannot slip in unnoticed.
        let extended = {
            let mut state = self.state.write();
            if state.prolonged {
                state.deadline
            } else {
                state.phase = TerminationPhase::Exiting;
                None
            }
        };
        if let Some(deadline) = extended {
            tokio::time::sleep_until(deadline).await;
            self.state.write().phase = TerminationPhase::Exiting;
        }

        let elapsed_ms = self
            .state
            .read()
            .started_at
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or_default();
        tracing::warn!(
            elapsed_ms,
            code = EXIT_CODE_TERMINATED,
            "grace period over, exiting"
        );
        (self.exit)(EXIT_CODE_TERMINATED);
    }

    /// Ask once for [`PROLONGATION`] more time before the forced exit.
    pub fn request_prolongation(&self, reason: &str) -> Result<(), ProlongationError> {
        if reason.is_empty() {
            return Err(ProlongationError::NeedsReason);
        }

        let mut state = self.state.write();
        if !state.started {
            return Err(ProlongationError::WithoutTermination);
        }
        if state.prolonged {
            return Err(ProlongationError::AlreadyRequested);
        }
        if state.phase == TerminationPhase::Exiting {
            return Err(ProlongationError::TooLate);
        }

        state.prolonged = true;
        state.phase = TerminationPhase::Prolonged;
        state.deadline = state.deadline.map(|d| d + PROLONGATION);
        tracing::warn!(
            reason,
            extra_secs = PROLONGATION.as_secs(),
            "slow shutdown requested"
        );
        Ok(())
    }

    /// When the process will be killed. `None` until graceful termination starts.
    pub fn deadline(&self) -> Option<Instant> {
        let state = self.state.read();
        if !state.started {
            return None;
        }
        state.deadline
    }

    pub fn phase(&self) -> TerminationPhase {
        self.state.read().phase
    }

    pub fn status(&self) -> TerminationStatus {
        let state = self.state.read();
        TerminationStatus {
            phase: state.phase,
            started_at: state.started_wall,
            prolonged: state.prolonged,
            remaining_ms: state
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64),
        }
    }
}
