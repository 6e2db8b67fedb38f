//! The `queued` feature's fallback: a plain spinning reader/writer
//! semaphore with none of the FIFO waitqueue/hand-off machinery.
//!
//! This is the "simpler read/write-semaphore primitive" the crate's
//! compile-time configuration flag can select instead of
//! [`crate::queued::Lock`]. It offers the same coarse
//! `read`/`write`/`*_try_lock`/downgrade surface, but is read- or
//! write-preferred depending on arrival order at the ticket queue rather
//! than FIFO-fair, and has no fine-grained range mode at all, callers that
//! need range-based readers must enable `queued`.

use core::{
    cell::UnsafeCell,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
};
use spin::{mutex::TicketMutex, relax::Spin, RelaxStrategy};

const WRITER_LOCKED: u32 = 0xff;
const WRITER_WAITING: u32 = 1 << 8;
const WRITER_MASK: u32 = WRITER_LOCKED | WRITER_WAITING;
const READER_COUNT: u32 = 1 << 9;

#[cfg(target_endian = "big")]
#[repr(C)]
struct RawRwLockBits {
    padd: [u8; 3],
    w_lock: ManuallyDrop<AtomicU8>,
}

#[cfg(target_endian = "little")]
#[repr(C)]
struct RawRwLockBits {
    w_lock: ManuallyDrop<AtomicU8>,
    padd: [u8; 3],
}

#[repr(C)]
union RawRwlock {
    bits: ManuallyDrop<AtomicU32>,
    raw: ManuallyDrop<RawRwLockBits>,
}

static_assertions::const_assert!(core::mem::size_of::<RawRwlock>() == core::mem::size_of::<u32>());

/// A [read-write lock](https://en.wikipedia.org/wiki/Readers%E2%80%93writer_lock)
/// that serializes one writer against any number of readers.
///
/// Uses spinning as its backoff mechanism and, like
/// [`crate::queued::Lock`], is not prone to reader or writer starvation: new
/// requests queue behind a ticket spinlock, so a writer waiting behind a
/// long run of readers is served in arrival order rather than being
/// overtaken indefinitely. Unlike `queued::Lock`, it has no fine-grained
/// range mode and no killable acquire (there is nothing to interrupt: the
/// wait is a bounded spin, not a scheduler sleep).
pub struct RwLock<T> {
    raw: RawRwlock,
    data: UnsafeCell<T>,
    wq: TicketMutex<()>,
}

/// Guard that provides read-only access to underlying data.
pub struct ReadGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
    data: &'a T,
}

/// Guard that provides exclusive read-write access to underlying data.
pub struct WriteGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
    data: &'a mut T,
}

impl<T> RwLock<T> {
    /// Creates a new rwlock wrapping the passed data.
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            wq: TicketMutex::new(()),
            raw: unsafe { core::mem::zeroed() },
            data: UnsafeCell::new(data),
        }
    }

    /// Tries to acquire the lock for write.
    ///
    /// Returns `Some(WriteGuard<T>)` if the lock was acquired, `None`
    /// otherwise.
    #[inline(always)]
    pub fn write_try_lock(&self) -> Option<WriteGuard<T>> {
        let raw = self.raw(Ordering::Relaxed);

        if raw == 0
            && unsafe {
                self.raw
                    .bits
                    .compare_exchange(0, WRITER_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            }
        {
            Some(WriteGuard {
                lock: self,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }

    /// Tries to acquire the lock for read.
    ///
    /// Returns `Some(ReadGuard<T>)` if the lock was acquired, `None`
    /// otherwise.
    #[inline(always)]
    pub fn read_try_lock(&self) -> Option<ReadGuard<T>> {
        let mut raw = self.raw(Ordering::Relaxed);

        if raw & WRITER_MASK == 0 {
            raw = self.add_read_count(Ordering::Acquire);
            if raw & WRITER_MASK == 0 {
                Some(ReadGuard {
                    lock: self,
                    data: unsafe { &*self.data.get() },
                })
            } else {
                None
            }
        } else {
            None
        }
    }

    fn wait_for_writes_to_unlock(&self) {
        loop {
            let cur = self.raw(Ordering::Acquire);

            if cur & WRITER_MASK == 0 {
                break;
            }

            Spin::relax();
        }
    }

    pub(crate) fn raw(&self, order: Ordering) -> u32 {
        unsafe { self.raw.bits.load(order) }
    }

    #[inline(always)]
    fn add_read_count(&self, order: Ordering) -> u32 {
        unsafe { self.raw.bits.fetch_add(READER_COUNT, order) }
    }

    #[inline(always)]
    pub(crate) fn sub_read_count(&self, order: Ordering) -> u32 {
        unsafe { self.raw.bits.fetch_sub(READER_COUNT, order) }
    }

    #[inline(always)]
    fn read_lock_fast(&self) -> bool {
        let state = self.add_read_count(Ordering::Acquire);

        if (state & WRITER_MASK) == 0 {
            true
        } else {
            // Here we just maintain the counter, so no semantics are needed.
            self.sub_read_count(Ordering::Relaxed);
            false
        }
    }

    #[inline(always)]
    fn write_lock_fast(&self) -> bool {
        unsafe {
            self.raw
                .bits
                .compare_exchange(0, WRITER_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }
    }

    fn read_lock_slow(&self) {
        // Acquired only to wait in FIFO order behind any pending writer;
        // dropped immediately, it never guards the reader count itself.
        let _guard = self.wq.lock();

        // Here we just maintain the counter, so no semantics are needed.
        self.add_read_count(Ordering::Relaxed);

        self.wait_for_writes_to_unlock();
    }

    fn write_lock_slow(&self) {
        let _guard = self.wq.lock();

        if self.raw(Ordering::Relaxed) == 0 && self.write_lock_fast() {
            return;
        }

        unsafe { self.raw.bits.fetch_or(WRITER_WAITING, Ordering::Relaxed) };

        loop {
            let raw = self.raw(Ordering::Relaxed);

            if raw == WRITER_WAITING
                && unsafe {
                    self.raw
                        .bits
                        .compare_exchange(
                            WRITER_WAITING,
                            WRITER_LOCKED,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                }
            {
                return;
            }

            Spin::relax();
        }
    }

    /// Acquires the lock for read.
    ///
    /// Divided into a fast and a slow path; the fast path is inlined, the
    /// slow path is not.
    #[inline(always)]
    pub fn read(&self) -> ReadGuard<T> {
        if !self.read_lock_fast() {
            self.read_lock_slow();
        }

        ReadGuard {
            lock: self,
            data: unsafe { &*self.data.get() },
        }
    }

    /// Acquires the lock for write.
    ///
    /// Divided into a fast and a slow path; the fast path is inlined, the
    /// slow path is not.
    #[inline(always)]
    pub fn write(&self) -> WriteGuard<T> {
        if !self.write_lock_fast() {
            self.write_lock_slow();
        }

        WriteGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    #[inline(always)]
    pub(crate) fn write_unlock(&self) {
        unsafe { self.raw.raw.w_lock.store(0, Ordering::Release) };
    }
}

impl<'a, T> WriteGuard<'a, T> {
    /// Atomically converts this writer into a single reader.
    ///
    /// Valid because a held `WriteGuard` proves `raw == WRITER_LOCKED`
    /// exactly (no reader bits set): replacing the whole word with one
    /// reader count is equivalent to clearing the writer bit and then
    /// incrementing the reader count, without a window where both a writer
    /// and a reader appear held.
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        core::mem::forget(self);
        unsafe { lock.raw.bits.store(READER_COUNT, Ordering::Release) };
        ReadGuard {
            lock,
            data: unsafe { &*lock.data.get() },
        }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.sub_read_count(Ordering::Release);
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

unsafe impl<T> Sync for RwLock<T> {}
unsafe impl<T> Send for RwLock<T> {}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    #[test]
    fn rwlock_test_single_threaded() {
        let lock = RwLock::new(());

        let locked = lock.write();
        assert!(lock.read_try_lock().is_none());
        assert!(lock.write_try_lock().is_none());
        drop(locked);

        let _locked1 = lock.read();
        let _locked2 = lock.read();

        assert!(lock.write_try_lock().is_none());
    }

    #[test]
    fn rwlock_test_downgrade() {
        let lock = RwLock::new(5);
        let w = lock.write();
        let r = w.downgrade();
        assert_eq!(*r, 5);
        assert!(lock.write_try_lock().is_none());
        drop(r);
        assert!(lock.write_try_lock().is_some());
    }

    #[test]
    fn rwlock_test_multy_threaded() {
        const READ_NUM_THREADS: usize = 10;
        const WRITE_NUM_THREADS: usize = 2;
        const WRITE_LOCK: usize = 1 << 31;

        let lock = Arc::new(RwLock::new(0));
        let r_ths: Vec<_> = (0..READ_NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();

                    for _ in 0..100 {
                        let locked = lock.read();
                        assert!(*locked & WRITE_LOCK == 0);
                        thread::sleep(Duration::from_millis(rng.gen_range(10..20)));
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

                    for _ in 0..100 {
                        let mut locked = lock.write();
                        assert!(*locked & WRITE_LOCK == 0);
                        *locked |= WRITE_LOCK;
                        thread::sleep(Duration::from_millis(rng.gen_range(10..20)));
                        *locked &= !WRITE_LOCK;
                        drop(locked);

                        thread::yield_now();
                    }
                })
            })
            .collect();

        for th in r_ths {
            th.join().unwrap();
        }

        for th in w_ths {
            th.join().unwrap();
        }
    }
}
