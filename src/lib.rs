#![no_std]
//! A fair, queued reader/writer lock for serializing access to a
//! per-process address-space object, with an optional fine-grained
//! range-based reader mode. The `queued` feature (default-on) selects the
//! FIFO algorithm in `queued`; disabling it switches `RwLock<T>` to the
//! plain-semaphore fallback in `simple`, with none of the waitqueue
//! machinery.

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
extern crate static_assertions;

pub mod error;
pub mod host;
pub mod range_index;

mod state;
mod waiter;

#[cfg(feature = "queued")]
pub mod queued;

#[cfg(not(feature = "queued"))]
pub mod simple;

#[cfg(feature = "queued")]
pub use queued::{FineReadGuard, FineWriteGuard, Lock, ReadGuard, WriteGuard};

#[cfg(all(feature = "queued", feature = "std"))]
pub use queued::RwLock;

#[cfg(not(feature = "queued"))]
pub use simple::{ReadGuard, RwLock, WriteGuard};

pub use error::Interrupted;

#[cfg(all(test, feature = "queued"))]
mod test {
    use super::queued::*;
    use crate::host::StdHost;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    type Lock<T> = super::queued::Lock<T, StdHost>;

    /// Stress-tests a mix of coarse readers, coarse writers, fine readers
    /// and fine writers all contending on one lock.
    #[test]
    fn mixed_mode_stress() {
        const READ_NUM_THREADS: usize = 8;
        const WRITE_NUM_THREADS: usize = 2;
        const FINE_READ_THREADS: usize = 4;
        const FINE_WRITE_THREADS: usize = 2;
        const WRITE_LOCK: usize = 1 << 31;

        let lock = Arc::new(Lock::new(0usize));

        let r_ths: Vec<_> = (0..READ_NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..50 {
                        let locked = lock.read();
                        assert!(*locked & WRITE_LOCK == 0);
                        thread::sleep(Duration::from_millis(rng.gen_range(1..5)));
                        drop(locked);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let w_ths: Vec<_> = (0..WRITE_NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..50 {
                        let mut locked = lock.write();
                        assert!(*locked & WRITE_LOCK == 0);
                        *locked |= WRITE_LOCK;
                        thread::sleep(Duration::from_millis(rng.gen_range(1..5)));
                        *locked &= !WRITE_LOCK;
                        drop(locked);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let fr_ths: Vec<_> = (0..FINE_READ_THREADS)
            .map(|i| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let base = (i as u64) * 100;
                    for _ in 0..50 {
                        let g = lock.read_range(base, base + 50);
                        assert_eq!(g.start(), base);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let fw_ths: Vec<_> = (0..FINE_WRITE_THREADS)
            .map(|i| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let base = 1000 + (i as u64) * 100;
                    for _ in 0..50 {
                        let mut g = lock.write_range(base, base + 50);
                        // SAFETY: this thread is the only writer touching
                        // [base, base+50) and the Lock's whole-value data is
                        // not otherwise inspected by callers in this test.
                        unsafe {
                            *g.data_mut() = g.data().wrapping_add(1);
                        }
                        thread::yield_now();
                    }
                })
            })
            .collect();

        for th in r_ths.into_iter().chain(w_ths).chain(fr_ths).chain(fw_ths) {
            th.join().unwrap();
        }
    }
}
