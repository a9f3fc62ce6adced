use crate::sample::Sample;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

const INITIAL_BUCKETS: usize = 4096;

// The table grows once live entries exceed 1/MAX_LOAD of the buckets, and is
// rebuilt with GROWN_LOAD buckets per live entry.
const MAX_LOAD: usize = 8;
const GROWN_LOAD: usize = 16;

// Fibonacci hashing multiplier (2^64 / golden ratio), truncated on 32-bit targets.
const HASH_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

/// Live sampled allocations, keyed by address.
///
/// Mutation happens under a mutex. Frees ask [`SampleStore::might_contain`]
/// first, which answers without locking from a counting filter over the
/// stored addresses. A `false` answer is exact.
pub struct SampleStore {
    samples: Mutex<HashMap<usize, Sample>>,
    index: FastPathIndex,
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleStore {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            index: FastPathIndex::new(INITIAL_BUCKETS),
        }
    }

    /// Lock-free membership test. May return false positives, never false negatives.
    #[inline]
    pub fn might_contain(&self, address: usize) -> bool {
        self.index.might_contain(address)
    }

    /// Insert the sample built by `make` for `address`.
    ///
    /// `make` runs with the store lock held, so anything it numbers (ordinals)
    /// becomes visible to snapshots in the same order. It must not take other
    /// locks or capture stacks. An existing entry for `address` is superseded;
    /// its allocation was freed without us seeing it.
    pub fn insert_with<F>(&self, address: usize, make: F)
    where
        F: FnOnce() -> Sample,
    {
        let mut samples = self.samples.lock();
        let sample = make();

        let closed = self.index.close();
        let superseded = samples.insert(address, sample);
        if superseded.is_none() {
            if closed.needs_growth(samples.len()) {
                closed.rebuild(samples.len(), samples.keys().copied());
            } else {
                closed.increment(address);
            }
        }
        drop(closed);
        drop(samples);
    }

    pub fn insert(&self, address: usize, sample: Sample) {
        self.insert_with(address, move || sample);
    }

    /// Forget `address`, returning its sample if one was recorded.
    pub fn remove(&self, address: usize) -> Option<Sample> {
        let mut samples = self.samples.lock();
        let removed = samples.remove(&address);
        if removed.is_some() {
            self.index.decrement(address);
        }
        removed
    }

    /// Copies of every sample with `ordinal > min_ordinal`.
    pub fn snapshot(&self, min_ordinal: u32) -> Vec<Sample> {
        let samples = self.samples.lock();
        samples
            .values()
            .filter(|sample| sample.ordinal > min_ordinal)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Buckets {
    counts: Box<[AtomicU32]>,
    shift: u32,
}

impl Buckets {
    fn with_capacity(buckets: usize) -> Self {
        let buckets = buckets.max(2).next_power_of_two();
        Self {
            counts: (0..buckets).map(|_| AtomicU32::new(0)).collect(),
            shift: usize::BITS - buckets.trailing_zeros(),
        }
    }

    #[inline]
    fn slot(&self, address: usize) -> &AtomicU32 {
        let hash = address.wrapping_mul(HASH_MULTIPLIER as usize) >> self.shift;
        &self.counts[hash]
    }
}

/// The lock-free side of the store.
///
/// Readers announce themselves in `operations_in_flight` and only touch the
/// bucket table while `fast_path_closed` is clear. The table pointer is only
/// replaced after closing the fast path and waiting for in-flight readers to
/// drain, so a reader never sees a freed table.
struct FastPathIndex {
    table: AtomicPtr<Buckets>,
    fast_path_closed: AtomicBool,
    operations_in_flight: AtomicUsize,
}

impl FastPathIndex {
    fn new(buckets: usize) -> Self {
        let table = Box::into_raw(Box::new(Buckets::with_capacity(buckets)));
        Self {
            table: AtomicPtr::new(table),
            fast_path_closed: AtomicBool::new(false),
            operations_in_flight: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn might_contain(&self, address: usize) -> bool {
        // Pessimistically assume the address was sampled while closed.
        let mut maybe_sampled = true;
        self.operations_in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.fast_path_closed.load(Ordering::SeqCst) {
            // SAFETY: the table is only swapped and freed inside `close()`,
            // which waits for this reader to leave before doing so.
            let table = unsafe { &*self.table.load(Ordering::Acquire) };
            maybe_sampled = table.slot(address).load(Ordering::Acquire) != 0;
        }
        self.operations_in_flight.fetch_sub(1, Ordering::SeqCst);
        maybe_sampled
    }

    /// Close the fast path and wait until no reader is in flight.
    fn close(&self) -> ClosedFastPath<'_> {
        self.fast_path_closed.store(true, Ordering::SeqCst);
        while self.operations_in_flight.load(Ordering::SeqCst) != 0 {
            hint::spin_loop();
        }
        ClosedFastPath { index: self }
    }

    fn decrement(&self, address: usize) {
        // SAFETY: callers hold the store lock, and the table is only replaced
        // by a writer holding that same lock.
        let table = unsafe { &*self.table.load(Ordering::Acquire) };
        let _ = table
            .slot(address)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }
}

impl Drop for FastPathIndex {
    fn drop(&mut self) {
        let table = self.table.swap(ptr::null_mut(), Ordering::AcqRel);
        if !table.is_null() {
            // SAFETY: created by Box::into_raw and owned exclusively by self.
            drop(unsafe { Box::from_raw(table) });
        }
    }
}

/// Exclusive access to the index table; reopens the fast path on drop.
struct ClosedFastPath<'a> {
    index: &'a FastPathIndex,
}

impl ClosedFastPath<'_> {
    fn table(&self) -> &Buckets {
        // SAFETY: only the lock-holding writer that closed the fast path swaps the table.
        unsafe { &*self.index.table.load(Ordering::Acquire) }
    }

    fn needs_growth(&self, live: usize) -> bool {
        live * MAX_LOAD > self.table().counts.len()
    }

    fn increment(&self, address: usize) {
        self.table()
            .slot(address)
            .fetch_add(1, Ordering::AcqRel);
    }

    fn rebuild<I>(&self, live: usize, addresses: I)
    where
        I: Iterator<Item = usize>,
    {
        let grown = Buckets::with_capacity(live * GROWN_LOAD);
        for address in addresses {
            grown.slot(address).fetch_add(1, Ordering::Relaxed);
        }

        let old = self
            .index
            .table
            .swap(Box::into_raw(Box::new(grown)), Ordering::AcqRel);
        // SAFETY: no reader is in flight while the fast path is closed, and
        // `old` came from Box::into_raw.
        drop(unsafe { Box::from_raw(old) });
    }
}

impl Drop for ClosedFastPath<'_> {
    fn drop(&mut self) {
        self.index.fast_path_closed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn sample(size: usize, ordinal: u32) -> Sample {
        Sample::new(size, 1, ordinal, vec![0xfeed])
    }

    #[test]
    fn insert_then_remove() {
        let store = SampleStore::new();
        store.insert(0x1000, sample(100, 1));

        assert!(store.might_contain(0x1000));
        assert_eq!(store.len(), 1);

        let removed = store.remove(0x1000).unwrap();
        assert_eq!(removed.size, 100);
        assert!(!store.might_contain(0x1000));
        assert!(store.is_empty());
    }

    #[test]
    fn removing_unknown_address_is_a_no_op() {
        let store = SampleStore::new();
        store.insert(0x1000, sample(100, 1));

        assert!(store.remove(0x2000).is_none());
        assert_eq!(store.len(), 1);
        assert!(store.might_contain(0x1000));
    }

    #[test]
    fn reused_address_supersedes_without_double_counting() {
        let store = SampleStore::new();
        store.insert(0x1000, sample(100, 1));
        store.insert(0x1000, sample(200, 2));

        let snapshot = store.snapshot(0);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].size, 200);

        store.remove(0x1000);
        assert!(!store.might_contain(0x1000));
    }

    #[test]
    fn snapshot_filters_by_ordinal() {
        let store = SampleStore::new();
        for ordinal in 1..=5 {
            store.insert(ordinal as usize * 0x100, sample(8, ordinal));
        }

        let mut newer: Vec<u32> = store.snapshot(3).iter().map(|s| s.ordinal).collect();
        newer.sort_unstable();
        assert_eq!(newer, vec![4, 5]);
        assert_eq!(store.snapshot(0).len(), 5);
        assert!(store.snapshot(5).is_empty());
    }

    #[test]
    fn index_grows_past_initial_capacity() {
        let store = SampleStore::new();
        let addresses: Vec<usize> = (1..=INITIAL_BUCKETS * 3).map(|i| i * 16).collect();

        for (i, &address) in addresses.iter().enumerate() {
            store.insert(address, sample(16, i as u32 + 1));
        }
        assert!(addresses.iter().all(|&a| store.might_contain(a)));

        for &address in &addresses {
            assert!(store.remove(address).is_some());
        }
        assert!(store.is_empty());
        assert!(addresses.iter().all(|&a| !store.might_contain(a)));
    }

    #[test]
    fn unsampled_addresses_mostly_skip_the_lock() {
        let store = SampleStore::new();
        for i in 0..2000usize {
            store.insert(0x1000_0000 + i * 48, sample(48, i as u32 + 1));
        }

        let lookups = 100_000usize;
        let false_positives = (0..lookups)
            .filter(|i| store.might_contain(0x5000_0000 + i * 32))
            .count();
        let rate = false_positives as f64 / lookups as f64;
        assert!(rate < 0.2, "{false_positives} of {lookups} unsampled frees would lock");
    }

    #[test]
    fn readers_never_miss_live_entries_during_growth() {
        let store = SampleStore::new();
        let pinned: Vec<usize> = (1..=64).map(|i| i * 0x1_0000).collect();
        for (i, &address) in pinned.iter().enumerate() {
            store.insert(address, sample(32, i as u32 + 1));
        }

        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while !done.load(Ordering::Relaxed) {
                        for &address in &pinned {
                            assert!(store.might_contain(address));
                        }
                    }
                });
            }

            for i in 0..20_000usize {
                store.insert(0x7000_0000 + i * 16, sample(16, 1000 + i as u32));
            }
            done.store(true, Ordering::Relaxed);
        });

        assert_eq!(store.len(), 64 + 20_000);
    }
}
