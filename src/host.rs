//! Host integration points: scheduling, debug/lockdep annotations and
//! telemetry.
//!
//! The lock body in [`crate::queued`] never touches an OS primitive
//! directly; every blocking wait and every debug/telemetry emission goes
//! through the [`Host`] trait, so the algorithm stays usable from a
//! `no_std` context that supplies its own task scheduler. The scheduler,
//! the debug/lockdep facility and the telemetry sink are all external
//! collaborators reached only through this trait; this module is their
//! concrete shape.

#[cfg(feature = "std")]
extern crate std;

/// Scheduling and observability hooks the queued lock needs from its
/// environment.
///
/// Only [`Host::Task`], [`Host::current_task`], [`Host::park`],
/// [`Host::unpark`] need an implementation to get a working lock; the
/// remaining methods default to no-ops (or, for `signal_pending`, "never
/// interrupted") and can be overridden selectively.
pub trait Host {
    /// Opaque handle identifying a parked task. Cloned into the waiter at
    /// enqueue time and handed to [`Host::unpark`] by the hand-off engine,
    /// possibly from a different thread than the one that parked. `Send +
    /// Sync` because the hand-off engine clones and wakes it from whichever
    /// thread happens to run the releasing `gate` critical section, not
    /// necessarily the task's own thread.
    type Task: Clone + Send + Sync;

    /// Returns a handle to the calling task.
    fn current_task() -> Self::Task;

    /// Blocks the calling task until woken.
    ///
    /// May return spuriously; every caller re-checks its condition in a
    /// loop, matching `std::thread::park`'s own contract.
    fn park();

    /// Wakes the task identified by `task`.
    fn unpark(task: &Self::Task);

    /// Reports whether the calling task has a signal pending. Only
    /// consulted by the `*_killable` slow path.
    fn signal_pending() -> bool {
        false
    }

    /// Monotonic nanosecond clock reading, used only to size a slow-path
    /// wait for [`Host::record_blocked_ns`]. Hosts without a clock can
    /// leave this at its default; durations will simply read as zero.
    fn monotonic_ns() -> u64 {
        0
    }

    fn acquire_exclusive(_name: &'static str) {}
    fn acquire_shared(_name: &'static str) {}
    fn release(_name: &'static str) {}
    fn downgrade(_name: &'static str) {}
    /// Emitted once, at the start of a slow-path wait.
    fn contended(_name: &'static str) {}
    /// Emitted once the lock is actually granted (fast or slow path).
    fn acquired(_name: &'static str) {}

    /// Reports the nanosecond duration of a completed slow-path wait under
    /// a single counter label.
    fn record_blocked_ns(_name: &'static str, _ns: u64) {}
}

/// `std::thread`-backed [`Host`].
///
/// Debug/lockdep annotations and telemetry are relayed through the `log`
/// facade (mirroring the way the pack's `havy-os` kernel pulls in
/// `log = { version = "0.4", default-features = false }` for exactly this
/// kind of low-level instrumentation); this crate never picks a logger
/// implementation for its caller, only the facade.
#[cfg(feature = "std")]
pub struct StdHost;

#[cfg(feature = "std")]
std::thread_local! {
    static SIGNAL_PENDING: core::cell::Cell<bool> = core::cell::Cell::new(false);
}

#[cfg(feature = "std")]
static PROCESS_START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

#[cfg(feature = "std")]
impl StdHost {
    /// Marks the calling thread as having a pending signal, so its next
    /// `*_killable` wait observes a cancellation request.
    ///
    /// There is no portable way to hook real OS signal delivery from plain
    /// `std::thread`; this is the concrete, testable stand-in for "a
    /// pending signal on the caller" and is also how the unit tests in
    /// [`crate::queued`] exercise the cancellation path.
    pub fn set_signal_pending(pending: bool) {
        SIGNAL_PENDING.with(|p| p.set(pending));
    }
}

#[cfg(feature = "std")]
impl Host for StdHost {
    type Task = std::thread::Thread;

    fn current_task() -> Self::Task {
        std::thread::current()
    }

    fn park() {
        std::thread::park();
    }

    fn unpark(task: &Self::Task) {
        task.unpark();
    }

    fn signal_pending() -> bool {
        SIGNAL_PENDING.with(|p| p.get())
    }

    fn monotonic_ns() -> u64 {
        let start = PROCESS_START.get_or_init(std::time::Instant::now);
        start.elapsed().as_nanos() as u64
    }

    fn acquire_exclusive(name: &'static str) {
        log::trace!(target: "range_rwlock", "{name}: acquire_exclusive");
    }

    fn acquire_shared(name: &'static str) {
        log::trace!(target: "range_rwlock", "{name}: acquire_shared");
    }

    fn release(name: &'static str) {
        log::trace!(target: "range_rwlock", "{name}: release");
    }

    fn downgrade(name: &'static str) {
        log::trace!(target: "range_rwlock", "{name}: downgrade");
    }

    fn contended(name: &'static str) {
        log::debug!(target: "range_rwlock", "{name}: contended");
    }

    fn acquired(name: &'static str) {
        log::trace!(target: "range_rwlock", "{name}: acquired");
    }

    fn record_blocked_ns(name: &'static str, ns: u64) {
        log::debug!(target: "range_rwlock", "{name}: blocked_duration_ns={ns}");
    }
}
