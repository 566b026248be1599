//! Process lifecycle coordination.
//!
//! A [`Lifecycle`] owns everything a long-running process needs to shut down
//! in order:
//!
//! - a [`ProcessContext`], the single cancellation cue every task observes;
//! - a [`SignalRegistry`] of async handlers per OS signal, dispatched last
//!   registered first under a shared 100ms budget;
//! - a [`TerminationCoordinator`] turning SIGINT/SIGTERM (or an internal
//!   request) into: cancel the context, wait a grace period that may be
//!   prolonged once, exit with status 100;
//! - a [`FinalizerRegistry`] of cleanup callbacks run once, in reverse
//!   order, after cancellation.
//!
//! ```no_run
//! use lifeguard::{HandlerToken, Lifecycle, Signal};
//!
//! #[tokio::main]
//! async fn main() {
//!     let lifecycle = Lifecycle::new();
//!     lifecycle.start_watcher();
//!
//!     let reload = HandlerToken::new("reload", |_event| async {
//!         tracing::info!("reloading");
//!         Ok(())
//!     });
//!     lifecycle.register(&reload, &[Signal::SIGHUP]);
//!     lifecycle.register_finalizer(|| tracing::info!("bye"));
//!
//!     lifecycle.context().cancelled().await;
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod signal;
pub mod status;
pub mod termination;

pub use backend::{SignalBackend, TokioSignalBackend};
pub use config::Config;
pub use context::{FinalizerRegistry, ProcessContext};
pub use dispatch::{DispatchDeadline, DispatchReport, SignalDispatcher, SignalEvent};
pub use error::{AppError, ConfigError, LoggingError, RunError};
pub use lifecycle::{Application, Lifecycle, LifecycleBuilder};
pub use registry::{HandlerError, HandlerToken, SignalRegistry};
pub use signal::Signal;
pub use status::{LifecycleStatus, StatusFile};
pub use termination::{
    ProlongationError, TerminationCoordinator, TerminationPhase, TerminationStrategy,
    EXIT_CODE_TERMINATED,
};
