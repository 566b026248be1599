/// Delivery of one signal occurrence to its handlers, and the loop that
/// feeds occurrences through it.
use crate::context::ProcessContext;
use crate::registry::{HandlerError, SignalRegistry};
use crate::signal::{is_termination, Signal};
use crate::termination::TerminationCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Time budget shared by all handlers of one occurrence.
pub const DISPATCH_BUDGET: Duration = Duration::from_millis(100);

/// Deadline shared by every handler invoked for one occurrence.
///
/// It is a cooperative hint: nothing interrupts a handler that ignores it,
/// but once it has passed the dispatcher skips the handlers not yet invoked.
/// It also counts as expired as soon as the process context is cancelled.
#[derive(Debug, Clone)]
pub struct DispatchDeadline {
    at: Instant,
    context: ProcessContext,
}

impl DispatchDeadline {
    pub fn new(at: Instant, context: ProcessContext) -> Self {
        Self { at, context }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.context.is_cancelled() || Instant::now() >= self.at
    }

    /// Resolves when the deadline passes or the process context is cancelled.
    pub async fn expired(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.at) => {}
            _ = self.context.cancelled() => {}
        }
    }
}

/// What a handler receives for one signal occurrence.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    /// Process-wide context. Once cancelled the whole process is shutting down.
    pub context: ProcessContext,
    /// Budget shared with the other handlers of this occurrence.
    pub deadline: DispatchDeadline,
    pub signal: Signal,
}

/// Outcome of delivering one occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers actually invoked.
    pub invoked: usize,
    /// Handlers skipped because of stop propagation or an overrun.
    pub skipped: usize,
    /// A handler asked to stop propagation.
    pub stopped: bool,
    /// The shared deadline passed while handlers were still pending.
    pub overran: bool,
}

pub struct SignalDispatcher {
    registry: Arc<SignalRegistry>,
    context: ProcessContext,
}

impl SignalDispatcher {
    pub fn new(registry: Arc<SignalRegistry>, context: ProcessContext) -> Self {
        Self { registry, context }
    }

    /// Deliver one occurrence of `signal`, received at `received`.
    ///
    /// Handlers run one at a time, last registered first. Dispatch stops at a
    /// handler returning [`HandlerError::StopPropagation`], or after any
    /// handler returns once the shared deadline has passed. Other handler
    /// errors are logged and ignored.
    pub async fn dispatch(&self, signal: Signal, received: Instant) -> DispatchReport {
        let handlers = self.registry.handlers(signal);
        let mut report = DispatchReport::default();
        if handlers.is_empty() {
            return report;
        }

        let deadline = DispatchDeadline::new(received + DISPATCH_BUDGET, self.context.clone());
        let total = handlers.len();

        for handler in handlers.iter().rev() {
            let event = SignalEvent {
                context: self.context.clone(),
                deadline: deadline.clone(),
                signal,
            };
            let result = handler.call(event).await;
            report.invoked += 1;

            match result {
                Ok(()) => {}
                Err(HandlerError::StopPropagation) => {
                    tracing::debug!(signal = %signal, handler = handler.name(), "signal propagation stopped");
                    report.stopped = true;
                    break;
                }
                Err(HandlerError::Failed(e)) => {
                    tracing::warn!(signal = %signal, handler = handler.name(), error = %e, "signal handler failed");
                }
            }

            if deadline.is_expired() {
                if report.invoked < total {
                    report.overran = true;
                    tracing::warn!(
                        signal = %signal,
                        handler = handler.name(),
                        skipped = total - report.invoked,
                        budget_ms = DISPATCH_BUDGET.as_millis() as u64,
                        "signal handlers overran their budget, skipping the rest"
                    );
                }
                break;
            }
        }

        report.skipped = total - report.invoked;
        report
    }
}

/// Read occurrences from `signals` until the channel closes, the context is
/// cancelled while idle, or a termination signal has been handed off.
///
/// After the first termination-class occurrence the coordinator is
/// triggered and every later occurrence is dropped.
///
/// Returning drops `signals`. From then on the backend can no longer forward
/// anything and every subscribed signal, SIGINT and SIGTERM included, takes
/// its platform-default action.
pub(crate) async fn run_dispatch_loop(
    dispatcher: SignalDispatcher,
    mut signals: mpsc::Receiver<Signal>,
    coordinator: Arc<TerminationCoordinator>,
) {
    let context = dispatcher.context.clone();
    let mut terminating = false;

    loop {
        let signal = tokio::select! {
            biased;
            received = signals.recv() => match received {
                Some(signal) => signal,
                None => break,
            },
            _ = context.cancelled() => break,
        };

        if terminating {
            tracing::debug!(signal = %signal, "terminating, ignoring signal");
            continue;
        }

        let report = dispatcher.dispatch(signal, Instant::now()).await;
        tracing::trace!(signal = %signal, ?report, "signal dispatched");

        if is_termination(signal) {
            terminating = true;
            tracing::info!(signal = %signal, "shutdown requested by signal");
            coordinator.trigger(Some(signal)).await;
        }
    }

    tracing::debug!("signal dispatch loop stopped, signals fall back to their default action");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;
    use crate::registry::HandlerToken;
    use parking_lot::Mutex;

    fn setup() -> (Arc<SignalRegistry>, SignalDispatcher, ProcessContext) {
        let backend = Arc::new(RecordingBackend::default());
        let (tx, _rx) = mpsc::channel(4);
        let registry = Arc::new(SignalRegistry::new(backend, tx));
        let context = ProcessContext::new();
        let dispatcher = SignalDispatcher::new(registry.clone(), context.clone());
        (registry, dispatcher, context)
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        outcome: fn() -> Result<(), HandlerError>,
    ) -> HandlerToken {
        let log = log.clone();
        HandlerToken::new(name, move |_event| {
            let log = log.clone();
            async move {
                log.lock().push(name);
                outcome()
            }
        })
    }

    fn sleeper(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, ms: u64) -> HandlerToken {
        let log = log.clone();
        HandlerToken::new(name, move |_event| {
            let log = log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                log.lock().push(name);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_handlers_run_in_reverse_registration_order() {
        let (registry, dispatcher, _ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["h1", "h2", "h3"] {
            registry.register(&recorder(name, &log, || Ok(())), &[Signal::SIGUSR1]);
        }

        let report = dispatcher.dispatch(Signal::SIGUSR1, Instant::now()).await;

        assert_eq!(*log.lock(), vec!["h3", "h2", "h1"]);
        assert_eq!(report.invoked, 3);
        assert_eq!(report.skipped, 0);
        assert!(!report.stopped);
    }

    #[tokio::test]
    async fn test_stop_propagation_skips_earlier_handlers() {
        let (registry, dispatcher, _ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(&recorder("h1", &log, || Ok(())), &[Signal::SIGUSR1]);
        registry.register(
            &recorder("h2", &log, || Err(HandlerError::StopPropagation)),
            &[Signal::SIGUSR1],
        );
        registry.register(&recorder("h3", &log, || Ok(())), &[Signal::SIGUSR1]);

        let report = dispatcher.dispatch(Signal::SIGUSR1, Instant::now()).await;

        assert_eq!(*log.lock(), vec!["h3", "h2"]);
        assert!(report.stopped);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_propagation() {
        let (registry, dispatcher, _ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(&recorder("h1", &log, || Ok(())), &[Signal::SIGHUP]);
        registry.register(
            &recorder("h2", &log, || Err(HandlerError::failed("boom"))),
            &[Signal::SIGHUP],
        );

        let report = dispatcher.dispatch(Signal::SIGHUP, Instant::now()).await;

        assert_eq!(*log.lock(), vec!["h2", "h1"]);
        assert_eq!(report.invoked, 2);
        assert!(!report.stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_skips_remaining_handlers() {
        let (registry, dispatcher, _ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(&sleeper("first", &log, 10), &[Signal::SIGUSR2]);
        registry.register(&sleeper("slow", &log, 150), &[Signal::SIGUSR2]);
        registry.register(&sleeper("quick", &log, 10), &[Signal::SIGUSR2]);

        let report = dispatcher.dispatch(Signal::SIGUSR2, Instant::now()).await;

        assert_eq!(*log.lock(), vec!["quick", "slow"]);
        assert!(report.overran);
        assert_eq!(report.invoked, 2);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_is_not_interrupted() {
        let (registry, dispatcher, _ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(&sleeper("slow", &log, 500), &[Signal::SIGUSR2]);

        let start = Instant::now();
        let report = dispatcher.dispatch(Signal::SIGUSR2, start).await;

        assert_eq!(*log.lock(), vec!["slow"]);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(!report.overran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_can_wait_on_shared_deadline() {
        let (registry, dispatcher, _ctx) = setup();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let token = HandlerToken::new("waiter", move |event: SignalEvent| {
            let seen = seen_clone.clone();
            async move {
                event.deadline.expired().await;
                *seen.lock() = Some(event.deadline.is_expired());
                Ok(())
            }
        });
        registry.register(&token, &[Signal::SIGUSR1]);

        let start = Instant::now();
        dispatcher.dispatch(Signal::SIGUSR1, start).await;

        assert_eq!(*seen.lock(), Some(true));
        assert!(start.elapsed() >= DISPATCH_BUDGET);
    }

    #[tokio::test]
    async fn test_cancelled_context_expires_deadline() {
        let ctx = ProcessContext::new();
        let deadline = DispatchDeadline::new(Instant::now() + Duration::from_secs(60), ctx.clone());
        assert!(!deadline.is_expired());
        ctx.cancel();
        assert!(deadline.is_expired());
        deadline.expired().await;
    }

    #[tokio::test]
    async fn test_signal_without_handlers_is_a_noop() {
        let (_registry, dispatcher, _ctx) = setup();
        let report = dispatcher.dispatch(Signal::SIGWINCH, Instant::now()).await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_handler_may_unregister_itself_during_dispatch() {
        let (registry, dispatcher, _ctx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(&recorder("h1", &log, || Ok(())), &[Signal::SIGHUP]);

        let slot: Arc<Mutex<Option<HandlerToken>>> = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();
        let registry_clone = registry.clone();
        let once = HandlerToken::new("once", move |event: SignalEvent| {
            let slot = slot_clone.clone();
            let registry = registry_clone.clone();
            async move {
                if let Some(me) = slot.lock().take() {
                    registry.unregister(&me, &[event.signal]);
                }
                Ok(())
            }
        });
        *slot.lock() = Some(once.clone());
        registry.register(&once, &[Signal::SIGHUP]);

        let report = dispatcher.dispatch(Signal::SIGHUP, Instant::now()).await;
        assert_eq!(report.invoked, 2);
        assert_eq!(*log.lock(), vec!["h1"]);
        assert!(!registry.is_registered(&once, Signal::SIGHUP));
    }
}
