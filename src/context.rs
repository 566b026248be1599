/// Process-wide cancellation and the finalizers that run once it fires.
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The single shutdown cue observed by application code.
///
/// Cloning is cheap and every clone observes the same token. Long-running
/// tasks should select on [`ProcessContext::cancelled`] and wind down
/// promptly: once it fires there is only the termination grace period left
/// before the process is killed.
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    token: CancellationToken,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Cancel the process-wide token. Calls after the first are no-ops.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("process context cancelled");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A clone of the underlying token, for APIs that take one directly.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled together with this context, but cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

type Finalizer = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct FinalizerList {
    pending: Vec<Finalizer>,
    frozen: bool,
}

/// Cleanup callbacks run once, last registered first, after cancellation.
///
/// The drain runs every finalizer synchronously one after another, so a slow
/// finalizer delays the rest. Nothing here bounds them; the termination
/// coordinator's forced exit is the only deadline.
#[derive(Clone)]
pub struct FinalizerRegistry {
    list: Arc<Mutex<FinalizerList>>,
    drained: CancellationToken,
}

impl FinalizerRegistry {
    /// Create the registry and spawn its drain task, which waits on `context`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(context: &ProcessContext) -> Self {
        let registry = Self {
            list: Arc::new(Mutex::new(FinalizerList::default())),
            drained: CancellationToken::new(),
        };

        let drain = registry.clone();
        let context = context.clone();
        tokio::spawn(async move {
            context.cancelled().await;
            drain.drain().await;
        });

        registry
    }

    /// Append a finalizer. Returns `false` (and drops `finalizer`) once the
    /// drain has already started.
    pub fn register<F>(&self, finalizer: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut list = self.list.lock();
        if list.frozen {
            tracing::warn!("finalizer registered after shutdown began, ignoring it");
            return false;
        }
        list.pending.push(Box::new(finalizer));
        true
    }

    /// Number of finalizers waiting to run.
    pub fn pending(&self) -> usize {
        self.list.lock().pending.len()
    }

    /// Resolves once every finalizer has run.
    pub async fn wait_drained(&self) {
        self.drained.cancelled().await
    }

    pub fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }

    async fn drain(&self) {
        let finalizers = {
            let mut list = self.list.lock();
            list.frozen = true;
            std::mem::take(&mut list.pending)
        };

        let count = finalizers.len();
        tracing::debug!(count, "running finalizers");

        let result = tokio::task::spawn_blocking(move || {
            let mut panicked = 0usize;
            for finalizer in finalizers.into_iter().rev() {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(finalizer));
                if outcome.is_err() {
                    panicked += 1;
                }
            }
            panicked
        })
        .await;

        match result {
            Ok(0) => tracing::debug!(count, "finalizers done"),
            Ok(panicked) => tracing::error!(count, panicked, "some finalizers panicked"),
            Err(e) => tracing::error!(error = %e, "finalizer task failed"),
        }
        self.drained.cancel();
    }
}

impl std::fmt::Debug for FinalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = self.list.lock();
        f.debug_struct("FinalizerRegistry")
            .field("pending", &list.pending.len())
            .field("frozen", &list.frozen)
            .finish()
    }
}
