//! The single failure mode a killable acquisition can report.

use core::fmt;

/// Returned by the `*_lock_killable` family when a pending signal was
/// observed before the lock was granted.
///
/// The acquirer holds nothing: it raced a grant, lost, and successfully
/// unlinked itself from the queue before returning. No lock state changed
/// beyond the transient enqueue/unlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("lock acquisition interrupted by a pending signal")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Interrupted {}
