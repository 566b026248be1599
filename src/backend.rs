/// OS delivery of signals into the dispatcher's channel.
use crate::signal::Signal;
use parking_lot::Mutex;
use signal_hook::low_level::emulate_default_handler;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal as os_signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sending half of the multiplexed signal channel read by the dispatch loop.
pub type SignalSink = mpsc::Sender<Signal>;

/// Capacity of the multiplexed signal channel.
pub const SIGNAL_QUEUE: usize = 5;

/// Source of OS signal deliveries.
///
/// The registry calls `subscribe`/`unsubscribe` while holding its lock, so
/// implementations must not call back into the registry.
pub trait SignalBackend: Send + Sync {
    /// Start forwarding every delivery of `signal` into `sink`.
    fn subscribe(&self, signal: Signal, sink: SignalSink) -> std::io::Result<()>;

    /// Stop forwarding `signal`; it takes its platform-default action again.
    /// Unknown signals are ignored.
    fn unsubscribe(&self, signal: Signal);

    /// Give `signal` back its platform-default disposition and deliver it to
    /// ourselves. For SIGINT/SIGTERM this normally ends the process.
    fn raise_default(&self, signal: Signal) -> std::io::Result<()>;
}

type Routes = Arc<Mutex<HashMap<Signal, SignalSink>>>;

/// Backend built on `tokio::signal::unix`.
///
/// Tokio never uninstalls its low-level handler, so the first subscription
/// of a signal starts a listener that lives as long as the backend. A
/// delivery is forwarded while the signal has a route to a live dispatch
/// loop; otherwise the listener applies the platform-default action itself.
pub struct TokioSignalBackend {
    runtime: Handle,
    routes: Routes,
    listeners: Mutex<HashMap<Signal, JoinHandle<()>>>,
}

impl TokioSignalBackend {
    /// A backend whose listeners run on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// When called outside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    /// A backend whose listeners run on `runtime`. Subscriptions may then be
    /// made from any thread.
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            routes: Arc::new(Mutex::new(HashMap::new())),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Signals currently forwarded.
    pub fn subscribed(&self) -> Vec<Signal> {
        self.routes.lock().keys().copied().collect()
    }
}

async fn listen(signal: Signal, mut stream: tokio::signal::unix::Signal, routes: Routes) {
    while stream.recv().await.is_some() {
        let sink = routes.lock().get(&signal).cloned();
        let forwarded = match sink {
            Some(sink) => sink.send(signal).await.is_ok(),
            None => false,
        };
        if forwarded {
            tracing::trace!(signal = %signal, "os signal forwarded");
            continue;
        }

        tracing::debug!(signal = %signal, "no live subscriber, applying default action");
        if let Err(e) = emulate_default_handler(signal as i32) {
            tracing::error!(signal = %signal, error = %e, "failed to apply default signal action");
        }
    }
}

impl SignalBackend for TokioSignalBackend {
    fn subscribe(&self, signal: Signal, sink: SignalSink) -> std::io::Result<()> {
        let mut listeners = self.listeners.lock();
        if !listeners.contains_key(&signal) {
            let stream = {
                let _runtime = self.runtime.enter();
                os_signal(SignalKind::from_raw(signal as i32))?
            };
            let listener = self
                .runtime
                .spawn(listen(signal, stream, self.routes.clone()));
            listeners.insert(signal, listener);
        }

        self.routes.lock().insert(signal, sink);
        tracing::debug!(signal = %signal, "subscribed to os signal");
        Ok(())
    }

    fn unsubscribe(&self, signal: Signal) {
        if self.routes.lock().remove(&signal).is_some() {
            tracing::debug!(signal = %signal, "unsubscribed from os signal");
        }
    }

    fn raise_default(&self, signal: Signal) -> std::io::Result<()> {
        self.unsubscribe(signal);
        emulate_default_handler(signal as i32)
    }
}

impl Drop for TokioSignalBackend {
    fn drop(&mut self) {
        for (_, listener) in self.listeners.lock().drain() {
            listener.abort();
        }
    }
}
