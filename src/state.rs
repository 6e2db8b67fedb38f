//! The lock body's protected state: everything mutated only while `gate` is
//! held.

use crate::host::Host;
use crate::range_index::RangeIndex;
use crate::waiter::WaitQueue;

/// Fields guarded by [`crate::queued::Lock`]'s `gate`.
///
/// `coarse_count`: `0` idle, `>0` active coarse readers, `-1` one active
/// coarse writer. `fine_writers`: count of active fine-grained writers.
/// `ranges`: intervals held by active fine-grained readers. `fine_writer_ranges`:
/// intervals held by active fine-grained writers, see DESIGN.md for why
/// this crate tracks writer intervals rather than a bare scalar.
pub(crate) struct State<H: Host> {
    pub(crate) coarse_count: i64,
    pub(crate) fine_writers: u32,
    pub(crate) ranges: RangeIndex,
    pub(crate) fine_writer_ranges: RangeIndex,
    pub(crate) queue: WaitQueue<H>,
}

impl<H: Host> State<H> {
    pub(crate) const fn new() -> Self {
        Self {
            coarse_count: 0,
            fine_writers: 0,
            ranges: RangeIndex::new(),
            fine_writer_ranges: RangeIndex::new(),
            queue: WaitQueue::new(),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.coarse_count == 0
            && self.fine_writers == 0
            && self.ranges.is_empty()
            && self.fine_writer_ranges.is_empty()
    }
}
