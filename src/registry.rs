/// Signal handler registry.
///
/// Maps each signal to the handlers registered for it, in registration
/// order. The first handler on a signal subscribes OS delivery and removing
/// the last one withdraws it. SIGINT and SIGTERM are the exception: the
/// watcher subscribes them once at startup and they stay subscribed.
use crate::backend::{SignalBackend, SignalSink};
use crate::dispatch::SignalEvent;
use crate::signal::{is_termination, Signal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Boxed future returned by a signal handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;

type HandlerFn = dyn Fn(SignalEvent) -> HandlerFuture + Send + Sync;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Why a handler did not simply let dispatch continue.
#[derive(Debug)]
pub enum HandlerError {
    /// Skip every handler registered before this one, for this occurrence only.
    StopPropagation,
    /// The handler failed. Logged by the dispatcher, otherwise ignored.
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError::Failed(error.into())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::StopPropagation => write!(f, "signal propagation stopped"),
            HandlerError::Failed(e) => write!(f, "signal handler failed: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::StopPropagation => None,
            HandlerError::Failed(e) => Some(e.as_ref()),
        }
    }
}

/// Identity handle for a registered signal handler.
///
/// Registration and removal compare tokens by identity: clones of one token
/// are the same handler, while two tokens built from the same closure are
/// two handlers that can be added and removed independently.
#[derive(Clone)]
pub struct HandlerToken {
    id: u64,
    name: Arc<str>,
    handler: Arc<HandlerFn>,
}

impl HandlerToken {
    /// Wrap an async handler. `name` only shows up in logs.
    ///
    /// The handler receives the process context, the shared dispatch deadline
    /// and the signal. It should finish well within the deadline or move its
    /// work onto a task bound to the process context.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(SignalEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let name: String = name.into();
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
            handler: Arc::new(move |event| Box::pin(handler(event)) as HandlerFuture),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, event: SignalEvent) -> HandlerFuture {
        (self.handler)(event)
    }
}

impl PartialEq for HandlerToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HandlerToken {}

impl std::fmt::Debug for HandlerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerToken")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Signal to handlers map with lazy OS subscription.
///
/// One lock covers mutation, the OS subscribe/unsubscribe calls and the
/// snapshot taken at dispatch time, so a first registration on two signals
/// at once can never lose a delivery.
pub struct SignalRegistry {
    handlers: Mutex<HashMap<Signal, Vec<HandlerToken>>>,
    backend: Arc<dyn SignalBackend>,
    sink: SignalSink,
}

impl SignalRegistry {
    pub fn new(backend: Arc<dyn SignalBackend>, sink: SignalSink) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            backend,
            sink,
        }
    }

    /// Attach `token` to each of `signals`. Already attached pairs are left alone.
    pub fn register(&self, token: &HandlerToken, signals: &[Signal]) {
        if signals.is_empty() {
            return;
        }

        let mut handlers = self.handlers.lock();
        for &signal in signals {
            let list = handlers.entry(signal).or_default();
            if list.contains(token) {
                continue;
            }
            if list.is_empty() {
                self.subscribe(signal);
            }
            list.push(token.clone());
            tracing::debug!(
                signal = %signal,
                handler = token.name(),
                handlers = list.len(),
                "signal handler registered"
            );
        }
    }

    /// Detach `token` from each of `signals`.
    pub fn unregister(&self, token: &HandlerToken, signals: &[Signal]) {
        if signals.is_empty() {
            return;
        }

        let mut handlers = self.handlers.lock();
        for &signal in signals {
            let Some(list) = handlers.get_mut(&signal) else {
                continue;
            };
            list.retain(|h| h != token);
            if list.is_empty() {
                handlers.remove(&signal);
                self.unsubscribe(signal);
            }
        }
    }

    /// Detach every one of `tokens` from every signal.
    pub fn unregister_all(&self, tokens: &[HandlerToken]) {
        if tokens.is_empty() {
            return;
        }

        let mut handlers = self.handlers.lock();
        let mut emptied = Vec::new();
        for (&signal, list) in handlers.iter_mut() {
            list.retain(|h| !tokens.contains(h));
            if list.is_empty() {
                emptied.push(signal);
            }
        }
        for signal in emptied {
            handlers.remove(&signal);
            self.unsubscribe(signal);
        }
    }

    /// Drop every handler of each of `signals`.
    pub fn clear(&self, signals: &[Signal]) {
        let mut handlers = self.handlers.lock();
        for &signal in signals {
            if handlers.remove(&signal).is_some() {
                self.unsubscribe(signal);
            }
        }
    }

    /// Drop every handler of every signal.
    pub fn clear_all(&self) {
        let mut handlers = self.handlers.lock();
        for (signal, _) in handlers.drain() {
            self.unsubscribe(signal);
        }
    }

    /// Handlers of `signal` in registration order.
    pub fn handlers(&self, signal: Signal) -> Vec<HandlerToken> {
        self.handlers
            .lock()
            .get(&signal)
            .cloned()
            .unwrap_or_default()
    }

    /// Signals that currently have at least one handler.
    pub fn signals(&self) -> Vec<Signal> {
        let mut signals: Vec<Signal> = self.handlers.lock().keys().copied().collect();
        signals.sort_by_key(|s| *s as i32);
        signals
    }

    pub fn is_registered(&self, token: &HandlerToken, signal: Signal) -> bool {
        self.handlers
            .lock()
            .get(&signal)
            .is_some_and(|list| list.contains(token))
    }

    /// Subscribe the termination-class signals. Called once by the watcher.
    pub(crate) fn subscribe_termination(&self, signals: &[Signal]) {
        let _guard = self.handlers.lock();
        for &signal in signals {
            if let Err(e) = self.backend.subscribe(signal, self.sink.clone()) {
                tracing::error!(signal = %signal, error = %e, "failed to subscribe termination signal");
            }
        }
    }

    // Both helpers run under the registry lock.
    fn subscribe(&self, signal: Signal) {
        if is_termination(signal) {
            return;
        }
        if let Err(e) = self.backend.subscribe(signal, self.sink.clone()) {
            tracing::warn!(signal = %signal, error = %e, "failed to subscribe to os signal");
        }
    }

    fn unsubscribe(&self, signal: Signal) {
        if !is_termination(signal) {
            self.backend.unsubscribe(signal);
        }
    }
}
