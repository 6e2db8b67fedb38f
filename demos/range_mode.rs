//! Demonstrates fine-grained range locking: two threads touch disjoint
//! halves of a shared buffer concurrently without taking the coarse,
//! whole-buffer write lock.
//!
//! Only meaningful under the `queued` feature (default-on); the `simple`
//! fallback has no range mode at all.

#[cfg(feature = "queued")]
fn main() {
    use range_rwlock::RwLock;
    use std::sync::Arc;
    use std::thread;

    const LEN: usize = 200;
    const SPLIT: u64 = (LEN / 2) as u64;

    let buf = Arc::new(RwLock::new(vec![0u8; LEN]));

    let left = {
        let buf = buf.clone();
        thread::spawn(move || {
            let mut guard = buf.write_range(0, SPLIT);
            // SAFETY: this thread only ever touches indices in [0, SPLIT),
            // and the concurrently running `right` thread only touches
            // indices in [SPLIT, LEN) — the two guards' ranges are disjoint.
            let data = unsafe { guard.data_mut() };
            for b in &mut data[0..SPLIT as usize] {
                *b = 1;
            }
        })
    };

    let right = {
        let buf = buf.clone();
        thread::spawn(move || {
            let mut guard = buf.write_range(SPLIT, LEN as u64);
            // SAFETY: see `left` above.
            let data = unsafe { guard.data_mut() };
            for b in &mut data[SPLIT as usize..LEN] {
                *b = 2;
            }
        })
    };

    left.join().unwrap();
    right.join().unwrap();

    let snapshot = buf.read();
    assert!(snapshot[..SPLIT as usize].iter().all(|&b| b == 1));
    assert!(snapshot[SPLIT as usize..].iter().all(|&b| b == 2));
    println!("range_mode demo: {} bytes partitioned across two fine writers", LEN);
}

#[cfg(not(feature = "queued"))]
fn main() {
    println!("range_mode demo requires the `queued` feature (it is default-on)");
}
