//! The transient wait-node, its FIFO queue, and the batched-wake handoff.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use crate::host::Host;
use crate::range_index::RangeEntry;
use crate::state::State;

/// What a waiter is trying to acquire, and the state mutation that records
/// success. This is the acquire predicate, expressed as a closed enum (the
/// simpler of the two alternatives noted in the design notes: there is no
/// caller-extensible fine mode, so a trait object buys nothing).
///
/// `Copy` because the same intent is tested once on the fast path and,
/// should that fail, copied again into the stack-allocated [`Waiter`], both
/// uses are transient reads/mutations of `state`, never of `Intent` itself.
#[derive(Clone, Copy)]
pub(crate) enum Intent {
    Writer,
    Reader,
    /// `entry` points at a `RangeEntry` boxed by the acquirer for the
    /// lifetime of the call (through fast path, slow path, and the eventual
    /// guard returned to the caller); the box keeps the entry's address
    /// stable even though the `Intent`/guard carrying this pointer may move.
    FineReader { start: u64, end: u64, entry: NonNull<RangeEntry> },
    FineWriter { start: u64, end: u64, entry: NonNull<RangeEntry> },
}

impl Intent {
    /// Tests whether the intent can be granted against `state` and, if so,
    /// mutates `state` to record the acquisition. Must only be called while
    /// `state`'s owning `gate` is held.
    pub(crate) fn apply<H: Host>(&self, state: &mut State<H>) -> bool {
        match *self {
            Intent::Writer => {
                if state.coarse_count != 0 || state.fine_writers != 0 || !state.ranges.is_empty() {
                    return false;
                }
                state.coarse_count = -1;
                true
            }
            Intent::Reader => {
                if state.coarse_count < 0 || state.fine_writers != 0 {
                    return false;
                }
                state.coarse_count += 1;
                true
            }
            Intent::FineReader { start, end, mut entry } => {
                if state.coarse_count < 0 || state.fine_writer_ranges.intersects(start, end) {
                    return false;
                }
                // SAFETY: `entry` outlives this call (see field doc above);
                // nothing else holds a reference to it while `gate` is held.
                state.ranges.insert(unsafe { entry.as_mut() });
                true
            }
            Intent::FineWriter { start, end, mut entry } => {
                if state.coarse_count != 0
                    || state.ranges.intersects(start, end)
                    || state.fine_writer_ranges.intersects(start, end)
                {
                    return false;
                }
                state.fine_writers += 1;
                // SAFETY: see above.
                state.fine_writer_ranges.insert(unsafe { entry.as_mut() });
                true
            }
        }
    }
}

/// A stack-allocated wait-node. Its address is published into the lock's
/// FIFO `queue` for the duration of the blocking call.
pub(crate) struct Waiter<H: Host> {
    pub(crate) intent: Intent,
    pub(crate) task: H::Task,
    /// Cleared to `false` at construction, set `true` (release-store) by the
    /// hand-off engine the instant this waiter is granted. The waiter's wait
    /// loop is the matching acquire-load, publishing the hand-off the same
    /// way a "task = null" sentinel would.
    pub(crate) granted: AtomicBool,
    pub(crate) prev: Option<NonNull<Waiter<H>>>,
    pub(crate) next: Option<NonNull<Waiter<H>>>,
}

impl<H: Host> Waiter<H> {
    pub(crate) fn new(intent: Intent, task: H::Task) -> Self {
        Self {
            intent,
            task,
            granted: AtomicBool::new(false),
            prev: None,
            next: None,
        }
    }
}

/// Intrusive, doubly linked FIFO of [`Waiter`]s.
///
/// Nodes are owned by the blocked callers; the queue holds only borrows,
/// mutated exclusively while the surrounding `gate` mutex is held.
pub(crate) struct WaitQueue<H: Host> {
    head: Option<NonNull<Waiter<H>>>,
    tail: Option<NonNull<Waiter<H>>>,
}

impl<H: Host> WaitQueue<H> {
    pub(crate) const fn new() -> Self {
        Self { head: None, tail: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head(&self) -> Option<NonNull<Waiter<H>>> {
        self.head
    }

    pub(crate) fn push_back(&mut self, mut node: NonNull<Waiter<H>>) {
        // SAFETY: `node` is a live Waiter owned by the calling stack frame,
        // not yet linked anywhere else.
        unsafe {
            node.as_mut().prev = self.tail;
            node.as_mut().next = None;
        }
        match self.tail {
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
    }

    /// Unlinks `node` from the queue. Returns whether `node` was the head.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this queue.
    pub(crate) unsafe fn unlink(&mut self, node: NonNull<Waiter<H>>) -> bool {
        let was_head = self.head == Some(node);
        let (prev, next) = unsafe { (node.as_ref().prev, node.as_ref().next) };
        match prev {
            Some(mut p) => unsafe { p.as_mut().next = next },
            None => self.head = next,
        }
        match next {
            Some(mut n) => unsafe { n.as_mut().prev = prev },
            None => self.tail = prev,
        }
        was_head
    }

    /// Detaches the prefix `[head, new_head)` from the queue, making
    /// `new_head` (possibly `None`, draining the whole queue) the new head.
    pub(crate) fn splice_prefix(&mut self, new_head: Option<NonNull<Waiter<H>>>) {
        self.head = new_head;
        match new_head {
            Some(mut node) => unsafe { node.as_mut().prev = None },
            None => self.tail = None,
        }
    }
}

/// Accumulates tasks to wake after `gate` is released.
///
/// Linux's mmap_lock threads an equivalent batch through a field already
/// reused on the blocked `task_struct`, avoiding allocation; this crate has
/// no equivalent long-lived per-task node to reuse safely from outside the
/// kernel. Once a waiter observes `granted == true` its stack frame may
/// already be gone (spurious wakeups are legal), so the engine must capture
/// an owned, already-cloned task handle before publishing `granted`, rather
/// than re-reading the waiter afterwards. A small `Vec` is the pragmatic,
/// documented trade (see DESIGN.md) for that safety.
pub(crate) struct WakeBatch<H: Host> {
    tasks: Vec<H::Task>,
}

impl<H: Host> WakeBatch<H> {
    pub(crate) fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub(crate) fn push(&mut self, task: H::Task) {
        self.tasks.push(task);
    }

    pub(crate) fn wake_all(self) {
        for task in &self.tasks {
            H::unpark(task);
        }
    }
}

/// The hand-off engine: walks a [`State`]'s `queue` head-first, granting the
/// lock to as many consecutive compatible waiters as possible and stopping
/// at the first incompatible one, preserving FIFO fairness.
///
/// Must be called with the owning `gate` held. Safe to call on a queue whose
/// head is not currently grantable, it is then a no-op, which is what lets
/// every unlock/downgrade/cancel path invoke it unconditionally rather than
/// re-deriving "is the head now grantable?" itself.
pub(crate) struct Dequeue;

impl Dequeue {
    pub(crate) fn run<H: Host>(state: &mut State<H>, batch: &mut WakeBatch<H>) {
        let mut granted_any = false;
        let mut cur = state.queue.head();

        while let Some(mut node) = cur {
            // SAFETY: `node` is linked into `state.queue`, hence a live
            // `Waiter` whose owner has not yet observed `granted == true`.
            let w = unsafe { node.as_mut() };
            if !w.intent.apply(state) {
                break;
            }
            granted_any = true;
            cur = w.next;
            batch.push(w.task.clone());
            // Release-store: after this, the waiter may resume and its
            // stack frame may vanish at any point. No further access to
            // `*w` is permitted past this line.
            w.granted.store(true, Ordering::Release);
        }

        if granted_any {
            state.queue.splice_prefix(cur);
        }
    }
}
