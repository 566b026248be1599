/// The process lifecycle root: owns the signal registry, the termination
/// coordinator, the process context and the finalizers, and runs an
/// application through its init, main and down phases.
use crate::backend::{SignalBackend, SignalSink, TokioSignalBackend, SIGNAL_QUEUE};
use crate::context::{FinalizerRegistry, ProcessContext};
use crate::dispatch::{run_dispatch_loop, SignalDispatcher};
use crate::error::{AppError, RunError};
use crate::registry::{HandlerToken, SignalRegistry};
use crate::signal::{Signal, TERMINATION_SIGNALS};
use crate::status::LifecycleStatus;
use crate::termination::{
    process_exit, ExitFn, ProlongationError, TerminationCoordinator, TerminationStrategy,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Exit status when the init phase fails.
pub const EXIT_CODE_INIT_FAILED: i32 = 1;

/// An application driven by [`Lifecycle::run`].
///
/// `init` runs before the signal watcher is active and any error there is
/// fatal. `main` should select on the process context everywhere it waits:
/// once it is cancelled only the grace period is left.
pub trait Application: Send {
    fn init(&mut self, _lifecycle: &Lifecycle) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }

    fn main(&mut self, lifecycle: &Lifecycle) -> impl Future<Output = Result<(), AppError>> + Send;

    fn down(&mut self, _lifecycle: &Lifecycle) -> impl Future<Output = ()> + Send {
        async {}
    }
}

pub struct LifecycleBuilder {
    backend: Option<Arc<dyn SignalBackend>>,
    exit: Option<ExitFn>,
}

impl LifecycleBuilder {
    /// Use `backend` instead of the Tokio OS signal backend.
    pub fn backend(mut self, backend: Arc<dyn SignalBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use `exit` instead of `std::process::exit`.
    pub fn exit(mut self, exit: ExitFn) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Build the lifecycle and spawn its finalizer task.
    ///
    /// Must be called from within a Tokio runtime. The default backend binds
    /// its signal listeners to that runtime, so handlers can afterwards be
    /// registered from any thread.
    pub fn build(self) -> Lifecycle {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(TokioSignalBackend::new()) as Arc<dyn SignalBackend>);
        let exit = self.exit.unwrap_or_else(process_exit);
        let (sink, receiver) = mpsc::channel(SIGNAL_QUEUE);

        let context = ProcessContext::new();
        let finalizers = FinalizerRegistry::spawn(&context);
        let registry = Arc::new(SignalRegistry::new(backend.clone(), sink.clone()));
        let coordinator = Arc::new(TerminationCoordinator::new(
            context.clone(),
            backend,
            exit.clone(),
        ));

        Lifecycle {
            context,
            finalizers,
            registry,
            coordinator,
            sink,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            exit,
        }
    }
}

/// Cheap to clone; every clone drives the same process lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
    context: ProcessContext,
    finalizers: FinalizerRegistry,
    registry: Arc<SignalRegistry>,
    coordinator: Arc<TerminationCoordinator>,
    sink: SignalSink,
    // Taken by the watcher when it starts.
    receiver: Arc<Mutex<Option<mpsc::Receiver<Signal>>>>,
    exit: ExitFn,
}

impl Lifecycle {
    /// A lifecycle on real OS signals that exits the process on termination.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> LifecycleBuilder {
        LifecycleBuilder {
            backend: None,
            exit: None,
        }
    }

    pub fn context(&self) -> &ProcessContext {
        &self.context
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &TerminationCoordinator {
        &self.coordinator
    }

    pub fn finalizers(&self) -> &FinalizerRegistry {
        &self.finalizers
    }

    pub fn register(&self, token: &HandlerToken, signals: &[Signal]) {
        self.registry.register(token, signals);
    }

    pub fn unregister(&self, token: &HandlerToken, signals: &[Signal]) {
        self.registry.unregister(token, signals);
    }

    /// See [`FinalizerRegistry::register`].
    pub fn register_finalizer<F>(&self, finalizer: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.finalizers.register(finalizer)
    }

    pub fn request_prolongation(&self, reason: &str) -> Result<(), ProlongationError> {
        self.coordinator.request_prolongation(reason)
    }

    /// When the process will be killed; `None` while no termination runs.
    pub fn deadline(&self) -> Option<Instant> {
        self.coordinator.deadline()
    }

    pub fn set_termination_strategy(&self, strategy: TerminationStrategy) {
        self.coordinator.set_strategy(strategy);
    }

    pub fn enable_default_termination(&self) {
        self.coordinator.enable_default_strategy();
    }

    pub fn disable_termination(&self) {
        self.coordinator.disable();
    }

    /// Subscribe SIGINT/SIGTERM and spawn the dispatch loop.
    ///
    /// Returns `false` if the watcher was already started.
    pub fn start_watcher(&self) -> bool {
        let Some(receiver) = self.receiver.lock().take() else {
            return false;
        };

        self.registry.subscribe_termination(&TERMINATION_SIGNALS);
        let dispatcher = SignalDispatcher::new(self.registry.clone(), self.context.clone());
        tokio::spawn(run_dispatch_loop(
            dispatcher,
            receiver,
            self.coordinator.clone(),
        ));
        tracing::debug!(pid = nix::unistd::getpid().as_raw(), "signal watcher started");
        true
    }

    pub fn watcher_started(&self) -> bool {
        self.receiver.lock().is_none()
    }

    /// Feed an occurrence of `signal` to the dispatcher as if the OS had
    /// delivered it.
    pub async fn raise(&self, signal: Signal) {
        if self.sink.send(signal).await.is_err() {
            tracing::debug!(signal = %signal, "signal dispatcher is gone, dropping signal");
        }
    }

    /// Start termination without a signal.
    pub async fn terminate(&self) {
        tracing::info!("internal shutdown requested");
        self.coordinator.trigger(None).await;
    }

    pub fn status(&self) -> LifecycleStatus {
        let signals = self
            .registry
            .signals()
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        LifecycleStatus::new(
            self.coordinator.status(),
            signals,
            self.finalizers.pending(),
        )
    }

    /// Run `app` through init, watcher start, main and down.
    ///
    /// A failing init is fatal: it is logged and the process exits with
    /// [`EXIT_CODE_INIT_FAILED`] before the watcher starts. After down the
    /// process context is cancelled and the finalizers are drained.
    pub async fn run<A: Application>(&self, mut app: A) -> Result<(), RunError> {
        if let Err(e) = app.init(self).await {
            tracing::error!(error = %e, "initialization failed");
            (self.exit)(EXIT_CODE_INIT_FAILED);
            return Err(RunError::Init(e));
        }

        self.start_watcher();
        tracing::debug!("initialization done");

        let result = app.main(self).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "application main returned an error");
        }

        app.down(self).await;

        self.context.cancel();
        self.finalizers.wait_drained().await;
        result.map_err(RunError::Main)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("cancelled", &self.context.is_cancelled())
            .field("phase", &self.coordinator.phase())
            .field("signals", &self.registry.signals())
            .field("finalizers", &self.finalizers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{self, RecordingBackend};
    use crate::termination::{TerminationPhase, EXIT_CODE_TERMINATED, GRACE_PERIOD, PROLONGATION};
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;

    fn lifecycle() -> (Lifecycle, Arc<RecordingBackend>, Arc<Mutex<Vec<i32>>>) {
        let backend = Arc::new(RecordingBackend::default());
        let exits = Arc::new(Mutex::new(Vec::new()));
        let exits_clone = exits.clone();
        let lifecycle = Lifecycle::builder()
            .backend(backend.clone())
            .exit(Arc::new(move |code: i32| exits_clone.lock().push(code)))
            .build();
        (lifecycle, backend, exits)
    }

    struct FailingInit;

    impl Application for FailingInit {
        async fn init(&mut self, _lifecycle: &Lifecycle) -> Result<(), AppError> {
            Err("missing credentials".into())
        }

        async fn main(&mut self, _lifecycle: &Lifecycle) -> Result<(), AppError> {
            panic!("main must not run after a failed init");
        }
    }

    struct Recorder {
        phases: Arc<Mutex<Vec<&'static str>>>,
        fail_main: bool,
    }

    impl Application for Recorder {
        async fn init(&mut self, lifecycle: &Lifecycle) -> Result<(), AppError> {
            assert!(!lifecycle.watcher_started());
            self.phases.lock().push("init");
            Ok(())
        }

        async fn main(&mut self, lifecycle: &Lifecycle) -> Result<(), AppError> {
            assert!(lifecycle.watcher_started());
            self.phases.lock().push("main");
            let phases = self.phases.clone();
            lifecycle.register_finalizer(move || phases.lock().push("finalizer"));
            if self.fail_main {
                return Err("main failed".into());
            }
            Ok(())
        }

        async fn down(&mut self, lifecycle: &Lifecycle) {
            assert!(!lifecycle.context().is_cancelled());
            self.phases.lock().push("down");
        }
    }

    #[tokio::test]
    async fn test_failed_init_exits_before_watcher() {
        let (lifecycle, backend, exits) = lifecycle();

        let err = lifecycle.run(FailingInit).await.unwrap_err();

        assert!(matches!(err, RunError::Init(_)));
        assert_eq!(*exits.lock(), vec![EXIT_CODE_INIT_FAILED]);
        assert!(!lifecycle.watcher_started());
        assert!(backend.subscribed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_phases_in_order_then_finalizers() {
        let (lifecycle, backend, exits) = lifecycle();
        let phases = Arc::new(Mutex::new(Vec::new()));

        lifecycle
            .run(Recorder {
                phases: phases.clone(),
                fail_main: false,
            })
            .await
            .unwrap();

        assert_eq!(*phases.lock(), vec!["init", "main", "down", "finalizer"]);
        assert!(lifecycle.context().is_cancelled());
        assert!(exits.lock().is_empty());
        assert!(backend.is_subscribed(Signal::SIGINT));
        assert!(backend.is_subscribed(Signal::SIGTERM));
    }

    #[tokio::test]
    async fn test_main_error_still_runs_down() {
        let (lifecycle, _backend, _exits) = lifecycle();
        let phases = Arc::new(Mutex::new(Vec::new()));

        let err = lifecycle
            .run(Recorder {
                phases: phases.clone(),
                fail_main: true,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Main(_)));
        assert_eq!(*phases.lock(), vec!["init", "main", "down", "finalizer"]);
    }

    #[tokio::test]
    async fn test_watcher_starts_once() {
        let (lifecycle, _backend, _exits) = lifecycle();
        assert!(lifecycle.start_watcher());
        assert!(!lifecycle.start_watcher());
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_terminate_exits_with_code_100() {
        let (lifecycle, _backend, exits) = lifecycle();
        lifecycle.start_watcher();

        lifecycle.terminate().await;

        assert!(lifecycle.context().is_cancelled());
        assert_eq!(*exits.lock(), vec![EXIT_CODE_TERMINATED]);
        assert_eq!(lifecycle.coordinator().phase(), TerminationPhase::Exiting);
    }

    #[tokio::test]
    async fn test_status_lists_signals_and_finalizers() {
        let (lifecycle, _backend, _exits) = lifecycle();
        let token = HandlerToken::new("noop", |_event| async { Ok(()) });
        lifecycle.register(&token, &[Signal::SIGUSR1, Signal::SIGHUP]);
        lifecycle.register_finalizer(|| {});

        let status = lifecycle.status();
        assert_eq!(status.signals, vec!["SIGHUP", "SIGUSR1"]);
        assert_eq!(status.pending_finalizers, 1);
        assert_eq!(status.phase, TerminationPhase::Idle);
    }

    fn tracer(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        done: Option<mpsc::Sender<()>>,
    ) -> HandlerToken {
        let log = log.clone();
        HandlerToken::new(name, move |_event| {
            let log = log.clone();
            let done = done.clone();
            async move {
                log.lock().push(name);
                if let Some(done) = done {
                    let _ = done.send(()).await;
                }
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_raised_signal_reaches_handlers_newest_first() {
        let (lifecycle, backend, _exits) = lifecycle();
        lifecycle.start_watcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel(1);

        let a = tracer("A", &log, Some(done_tx));
        let b = tracer("B", &log, None);
        let c = tracer("C", &log, None);
        for token in [&a, &b, &c] {
            lifecycle.register(token, &[Signal::SIGUSR1]);
        }
        assert!(backend.is_subscribed(Signal::SIGUSR1));

        lifecycle.raise(Signal::SIGUSR1).await;
        done_rx.recv().await.unwrap();

        assert_eq!(*log.lock(), vec!["C", "B", "A"]);
        let names: Vec<String> = lifecycle
            .registry()
            .handlers(Signal::SIGUSR1)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_unregistered_handler_is_not_invoked() {
        let (lifecycle, backend, _exits) = lifecycle();
        lifecycle.start_watcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel(1);

        let d = tracer("D", &log, None);
        lifecycle.register(&d, &[Signal::SIGUSR2]);
        lifecycle.unregister(&d, &[Signal::SIGUSR2]);
        assert!(!backend.is_subscribed(Signal::SIGUSR2));

        // A later handler on another signal proves the loop processed both.
        let e = tracer("E", &log, Some(done_tx));
        lifecycle.register(&e, &[Signal::SIGHUP]);

        lifecycle.raise(Signal::SIGUSR2).await;
        lifecycle.raise(Signal::SIGHUP).await;
        done_rx.recv().await.unwrap();

        assert_eq!(*log.lock(), vec!["E"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sigterm_runs_handlers_then_exits_after_prolonged_grace() {
        let (lifecycle, _backend, exits) = lifecycle();
        lifecycle.start_watcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        lifecycle.register(&tracer("term", &log, None), &[Signal::SIGTERM]);
        lifecycle.register(&tracer("int", &log, None), &[Signal::SIGINT]);

        let before = Instant::now();
        lifecycle.raise(Signal::SIGTERM).await;
        lifecycle.context().cancelled().await;

        let base = lifecycle.deadline().unwrap();
        assert!(base - before >= GRACE_PERIOD);
        assert!(base - before < GRACE_PERIOD + Duration::from_millis(100));
        lifecycle.request_prolongation("flushing buffers").unwrap();
        assert_eq!(lifecycle.deadline(), Some(base + PROLONGATION));

        // Signals arriving during termination are not dispatched.
        lifecycle.raise(Signal::SIGINT).await;

        tokio::time::sleep_until(base + Duration::from_millis(1)).await;
        assert!(exits.lock().is_empty());

        tokio::time::sleep_until(base + PROLONGATION + Duration::from_millis(1)).await;
        assert_eq!(*exits.lock(), vec![EXIT_CODE_TERMINATED]);
        assert_eq!(*log.lock(), vec!["term"]);
    }

    #[tokio::test]
    async fn test_prolongation_outside_termination_fails() {
        let (lifecycle, _backend, exits) = lifecycle();
        lifecycle.start_watcher();

        assert_eq!(
            lifecycle.request_prolongation("too early"),
            Err(ProlongationError::WithoutTermination)
        );
        assert!(lifecycle.deadline().is_none());
        assert!(!lifecycle.context().is_cancelled());
        assert!(exits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_os_signal_is_dispatched() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let exits_clone = exits.clone();
        let lifecycle = Lifecycle::builder()
            .exit(Arc::new(move |code: i32| exits_clone.lock().push(code)))
            .build();
        lifecycle.start_watcher();

        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel(1);
        lifecycle.register(&tracer("usr2", &log, Some(done_tx)), &[Signal::SIGUSR2]);

        nix::sys::signal::kill(nix::unistd::getpid(), Signal::SIGUSR2).unwrap();
        tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*log.lock(), vec!["usr2"]);
        assert!(exits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_register_from_thread_outside_runtime() {
        let backend = Arc::new(TokioSignalBackend::new());
        let lifecycle = Lifecycle::builder()
            .backend(backend.clone())
            .exit(Arc::new(|_code: i32| {}))
            .build();
        lifecycle.start_watcher();

        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let token = tracer("thread", &log, Some(done_tx));
        let registering = lifecycle.clone();
        std::thread::spawn(move || registering.register(&token, &[Signal::SIGUSR1]))
            .join()
            .unwrap();
        assert!(backend.subscribed().contains(&Signal::SIGUSR1));

        nix::sys::signal::kill(nix::unistd::getpid(), Signal::SIGUSR1).unwrap();
        tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*log.lock(), vec!["thread"]);
    }

    #[test]
    fn test_sigterm_after_cancellation_takes_default_action() {
        const TEST: &str = "lifecycle::tests::test_sigterm_after_cancellation_takes_default_action";
        if !testing::is_child(TEST) {
            let status = testing::run_child(TEST);
            assert_eq!(status.signal(), Some(Signal::SIGTERM as i32), "{status:?}");
            return;
        }

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let lifecycle = Lifecycle::builder()
                .exit(Arc::new(|_code: i32| {}))
                .build();
            lifecycle.start_watcher();
            // Stand-in for a finalizer that never returns.
            lifecycle.register_finalizer(|| std::thread::sleep(Duration::from_secs(60)));

            lifecycle.context().cancel();
            tokio::time::sleep(Duration::from_millis(100)).await;

            nix::sys::signal::kill(nix::unistd::getpid(), Signal::SIGTERM).unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
    }

    #[test]
    fn test_disabled_termination_takes_default_action() {
        const TEST: &str = "lifecycle::tests::test_disabled_termination_takes_default_action";
        if !testing::is_child(TEST) {
            let status = testing::run_child(TEST);
            assert_eq!(status.signal(), Some(Signal::SIGTERM as i32), "{status:?}");
            return;
        }

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let lifecycle = Lifecycle::builder()
                .exit(Arc::new(|_code: i32| {}))
                .build();
            lifecycle.disable_termination();
            lifecycle.start_watcher();

            nix::sys::signal::kill(nix::unistd::getpid(), Signal::SIGTERM).unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
    }
}
