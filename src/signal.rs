/// Signal identities and the termination-class subset.
///
/// Signals are plain `nix` values compared by value. SIGINT and SIGTERM are
/// termination-class: they are always subscribed while the watcher runs and
/// hand off to the termination coordinator after their handlers ran.
pub use nix::sys::signal::Signal;

/// Signals that start a coordinated shutdown.
pub const TERMINATION_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Whether `signal` belongs to the termination class.
pub fn is_termination(signal: Signal) -> bool {
    TERMINATION_SIGNALS.contains(&signal)
}
