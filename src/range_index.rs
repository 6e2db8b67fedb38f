//! An augmented, intrusive, self-balancing binary search tree keyed by
//! interval start, supporting O(log N) amortized "does any stored interval
//! intersect `[s, e)`?" queries.
//!
//! This backs the set of half-open ranges held by active fine-grained
//! readers (and, separately, active fine-grained writers) in [`crate::queued`].
//! Balancing uses the treap discipline (BST order on `start`, max-heap order
//! on a per-node priority) rather than red-black rotations: the rotation
//! primitives are identical in shape, but treap insert/delete need no parent
//! pointers and no color-fixup case analysis, keeping insertion and removal
//! compact without sacrificing the expected O(log N) bound. Rotations are
//! plain pointer surgery over borrows the caller already holds exclusively
//! (the `gate` mutex in [`crate::queued::Lock`]).

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

/// A node of a [`RangeIndex`], embedded in the caller's own storage (a
/// lock-guard living on the acquirer's stack).
///
/// A `RangeEntry` must not move while linked into a `RangeIndex` and must
/// outlive its membership in one; both are upheld by construction in
/// [`crate::queued`], where every entry lives in the stack frame that
/// performed the range acquisition until the corresponding guard drops.
pub struct RangeEntry {
    start: u64,
    end: u64,
    subtree_max_end: u64,
    priority: u32,
    left: Option<NonNull<RangeEntry>>,
    right: Option<NonNull<RangeEntry>>,
}

// A fresh, decorrelated-enough priority for each entry. This is not a
// cryptographic RNG: a treap only needs insertion order to be unrelated to
// key order, and an atomically-advancing SplitMix64 stream achieves that
// without pulling `rand` in as anything more than a dev-dependency for the
// core no_std library.
static PRIORITY_STREAM: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

fn next_priority() -> u32 {
    let mut z = PRIORITY_STREAM.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    (z ^ (z >> 31)) as u32
}

impl RangeEntry {
    /// Creates a detached entry for the half-open interval `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics (via debug assertion) if `start >= end`; callers build ranges
    /// from a compatibility-checked fault address pair and never hit this
    /// in practice.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end, "RangeEntry requires start < end");
        Self {
            start,
            end,
            subtree_max_end: end,
            priority: next_priority(),
            left: None,
            right: None,
        }
    }

    /// The inclusive start of the half-open interval.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The exclusive end of the half-open interval.
    pub fn end(&self) -> u64 {
        self.end
    }
}

/// A set of half-open intervals supporting overlap queries.
///
/// `RangeIndex` holds no ownership over its entries: it only links nodes the
/// caller already owns, and every mutating method requires `&mut self`,
/// which in practice is only reachable while the owning [`crate::queued::Lock`]
/// holds its `gate`.
#[derive(Default)]
pub struct RangeIndex {
    root: Option<NonNull<RangeEntry>>,
}

// SAFETY justification for the raw-pointer tree below: every node is a
// `RangeEntry` owned by some caller's stack frame; `RangeIndex` never frees,
// allocates, or moves a node, it only threads `left`/`right` pointers between
// nodes the caller has proven (by holding `&mut RangeEntry`) are exclusively
// theirs at `insert`/`remove` time. All subsequent access happens with the
// `gate` mutex held, so there is never more than one mutable view of the
// tree at once.
impl RangeIndex {
    pub const fn new() -> Self {
        Self { root: None }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Links `entry` into the index.
    ///
    /// `entry.start < entry.end` is a precondition (checked in
    /// [`RangeEntry::new`]); inserting an interval identical to one already
    /// present is permitted.
    pub fn insert(&mut self, entry: &mut RangeEntry) {
        entry.left = None;
        entry.right = None;
        entry.subtree_max_end = entry.end;
        let node = NonNull::from(entry);
        self.root = Some(Self::insert_rec(self.root, node));
    }

    /// Unlinks `entry`, previously passed to [`RangeIndex::insert`], by
    /// pointer identity.
    ///
    /// # Panics
    ///
    /// Panics if `entry` is not currently linked into this index; that is a
    /// caller bug (double unlock), not a runtime condition.
    pub fn remove(&mut self, entry: &mut RangeEntry) {
        let target = NonNull::from(&mut *entry);
        self.root = Self::remove_rec(self.root, target);
        entry.left = None;
        entry.right = None;
    }

    /// Returns true iff some stored interval `r` satisfies
    /// `r.start < end && start < r.end`.
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        let mut cur = self.root;
        while let Some(node) = cur {
            // SAFETY: node is linked, hence a live RangeEntry; we only hold
            // a shared reference for the duration of this comparison.
            let r = unsafe { node.as_ref() };
            if r.subtree_max_end <= start {
                return false;
            }
            if r.start >= end {
                cur = r.left;
                continue;
            }
            if start < r.end {
                return true;
            }
            if let Some(left) = r.left {
                // SAFETY: see above.
                if start < unsafe { left.as_ref() }.subtree_max_end {
                    return true;
                }
            }
            cur = r.right;
        }
        false
    }

    fn update(mut node: NonNull<RangeEntry>) {
        // SAFETY: caller (insert/remove recursion) holds exclusive access
        // to the whole subtree rooted here.
        let n = unsafe { node.as_mut() };
        let mut max_end = n.end;
        if let Some(l) = n.left {
            max_end = max_end.max(unsafe { l.as_ref() }.subtree_max_end);
        }
        if let Some(r) = n.right {
            max_end = max_end.max(unsafe { r.as_ref() }.subtree_max_end);
        }
        n.subtree_max_end = max_end;
    }

    fn set_left(mut node: NonNull<RangeEntry>, child: Option<NonNull<RangeEntry>>) {
        unsafe { node.as_mut() }.left = child;
    }

    fn set_right(mut node: NonNull<RangeEntry>, child: Option<NonNull<RangeEntry>>) {
        unsafe { node.as_mut() }.right = child;
    }

    fn rotate_right(node: NonNull<RangeEntry>) -> NonNull<RangeEntry> {
        // SAFETY: `node` has a left child (checked by caller via priority
        // comparison before rotating).
        let mut pivot = unsafe { node.as_ref() }.left.expect("rotate_right: no left child");
        let pivot_right = unsafe { pivot.as_ref() }.right;
        Self::set_left(node, pivot_right);
        Self::set_right(pivot, Some(node));
        Self::update(node);
        Self::update(pivot);
        pivot
    }

    fn rotate_left(node: NonNull<RangeEntry>) -> NonNull<RangeEntry> {
        let mut pivot = unsafe { node.as_ref() }.right.expect("rotate_left: no right child");
        let pivot_left = unsafe { pivot.as_ref() }.left;
        Self::set_right(node, pivot_left);
        Self::set_left(pivot, Some(node));
        Self::update(node);
        Self::update(pivot);
        pivot
    }

    /// Strict total order used to place and later relocate nodes: primarily
    /// by `start`, tie-broken by address so that two entries with identical
    /// ranges (which are allowed to coexist) still have a well-defined,
    /// stable position.
    fn less(a: NonNull<RangeEntry>, b: NonNull<RangeEntry>) -> bool {
        // SAFETY: both are live linked-or-about-to-be-linked nodes.
        let (ra, rb) = unsafe { (a.as_ref(), b.as_ref()) };
        (ra.start, a.as_ptr() as usize) < (rb.start, b.as_ptr() as usize)
    }

    fn insert_rec(root: Option<NonNull<RangeEntry>>, new: NonNull<RangeEntry>) -> NonNull<RangeEntry> {
        let Some(node) = root else {
            return new;
        };
        // SAFETY: node is live; priority is read-only here.
        let node_priority = unsafe { node.as_ref() }.priority;
        let new_priority = unsafe { new.as_ref() }.priority;
        if Self::less(new, node) {
            let left = unsafe { node.as_ref() }.left;
            let new_left = Self::insert_rec(left, new);
            Self::set_left(node, Some(new_left));
            Self::update(node);
            if new_priority > node_priority {
                Self::rotate_right(node)
            } else {
                node
            }
        } else {
            let right = unsafe { node.as_ref() }.right;
            let new_right = Self::insert_rec(right, new);
            Self::set_right(node, Some(new_right));
            Self::update(node);
            if new_priority > node_priority {
                Self::rotate_left(node)
            } else {
                node
            }
        }
    }

    fn remove_rec(root: Option<NonNull<RangeEntry>>, target: NonNull<RangeEntry>) -> Option<NonNull<RangeEntry>> {
        let node = root.expect("RangeIndex::remove: entry not linked into this index");
        if node == target {
            return Self::delete_node(node);
        }
        if Self::less(target, node) {
            let left = unsafe { node.as_ref() }.left;
            let new_left = Self::remove_rec(left, target);
            Self::set_left(node, new_left);
        } else {
            let right = unsafe { node.as_ref() }.right;
            let new_right = Self::remove_rec(right, target);
            Self::set_right(node, new_right);
        }
        Self::update(node);
        Some(node)
    }

    /// Removes `node` itself, rotating it down to a leaf (always rotating
    /// in the higher-priority child) before splicing it out, preserving the
    /// heap property.
    fn delete_node(node: NonNull<RangeEntry>) -> Option<NonNull<RangeEntry>> {
        // SAFETY: node is live.
        let (left, right) = unsafe { (node.as_ref().left, node.as_ref().right) };
        match (left, right) {
            (None, None) => None,
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (Some(l), Some(r)) => {
                let lp = unsafe { l.as_ref() }.priority;
                let rp = unsafe { r.as_ref() }.priority;
                if lp > rp {
                    let new_root = Self::rotate_right(node);
                    let new_right = Self::delete_node(node);
                    Self::set_right(new_root, new_right);
                    Self::update(new_root);
                    Some(new_root)
                } else {
                    let new_root = Self::rotate_left(node);
                    let new_left = Self::delete_node(node);
                    Self::set_left(new_root, new_left);
                    Self::update(new_root);
                    Some(new_root)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_index_never_intersects() {
        let idx = RangeIndex::new();
        assert!(!idx.intersects(0, 100));
    }

    #[test]
    fn single_entry_overlap_rules() {
        let mut idx = RangeIndex::new();
        let mut e = RangeEntry::new(10, 20);
        idx.insert(&mut e);

        assert!(idx.intersects(0, 11));
        assert!(idx.intersects(15, 25));
        assert!(idx.intersects(5, 25));
        assert!(!idx.intersects(20, 30));
        assert!(!idx.intersects(0, 10));

        idx.remove(&mut e);
        assert!(!idx.intersects(10, 20));
    }

    #[test]
    fn many_entries_insert_and_remove_in_random_order() {
        let mut idx = RangeIndex::new();
        let mut entries: alloc::vec::Vec<RangeEntry> = (0..64)
            .map(|i| RangeEntry::new(i * 10, i * 10 + 5))
            .collect();
        for e in entries.iter_mut() {
            idx.insert(e);
        }
        for i in 0..64u64 {
            assert!(idx.intersects(i * 10, i * 10 + 5));
            assert!(!idx.intersects(i * 10 + 5, i * 10 + 10));
        }
        // Remove every other entry and re-check overlap queries stay correct.
        for (i, e) in entries.iter_mut().enumerate() {
            if i % 2 == 0 {
                idx.remove(e);
            }
        }
        for i in 0..64u64 {
            let expect = i % 2 == 1;
            assert_eq!(idx.intersects(i * 10, i * 10 + 5), expect);
        }
        for (i, e) in entries.iter_mut().enumerate() {
            if i % 2 == 1 {
                idx.remove(e);
            }
        }
        assert!(idx.is_empty());
    }

    #[test]
    fn duplicate_ranges_are_permitted() {
        let mut idx = RangeIndex::new();
        let mut a = RangeEntry::new(0, 10);
        let mut b = RangeEntry::new(0, 10);
        idx.insert(&mut a);
        idx.insert(&mut b);
        assert!(idx.intersects(0, 10));
        idx.remove(&mut a);
        assert!(idx.intersects(0, 10));
        idx.remove(&mut b);
        assert!(!idx.intersects(0, 10));
    }
}
