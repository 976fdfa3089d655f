//! Verification cache: positive digest-check results keyed by (device, inode).
//!
//! The cache is a fixed-size open-addressed table. The inode number hashes
//! to one of `2^k` buckets; each bucket holds up to eight slots plus a
//! round-robin eviction cursor, all behind its own reader/writer lock so a
//! hot lookup never contends on a global lock. A slot is unused iff its
//! `src_id` is [`UNUSED_SRC_ID`] — `0` and `-1` are never valid source
//! labels, so the field doubles as the occupancy flag.
//!
//! Eviction in a full bucket is round-robin via the bucket's `next_evicted`
//! cursor. After inserting into a free slot that the cursor happens to point
//! at, the cursor advances so the entry just written is not the immediate
//! next victim.
//!
//! # Environment variable
//!
//! `VIGIL_CACHE_BUCKETS` — seed for the bucket count; rounded up to a power
//! of two. Defaults to `512`.

use std::sync::RwLock;

use crate::types::{hash_long, FileId, UNUSED_SRC_ID};

/// Each cache bucket holds this many slots for hash collisions.
pub const SLOTS_PER_BUCKET: usize = 8;

/// Default bucket-count seed when `VIGIL_CACHE_BUCKETS` is not set.
pub const DEFAULT_BUCKETS: usize = 512;

#[derive(Clone, Copy)]
struct Slot {
    ino: u64,
    dev: u64,
    src_id: i64,
}

impl Slot {
    const UNUSED: Slot = Slot {
        ino: 0,
        dev: 0,
        src_id: UNUSED_SRC_ID,
    };

    fn is_used(&self) -> bool {
        self.src_id != UNUSED_SRC_ID
    }

    fn matches(&self, id: FileId) -> bool {
        self.is_used() && self.ino == id.ino && self.dev == id.dev
    }
}

struct Bucket {
    slots: [Slot; SLOTS_PER_BUCKET],
    next_evicted: i16,
}

impl Bucket {
    fn new() -> Self {
        Self {
            slots: [Slot::UNUSED; SLOTS_PER_BUCKET],
            next_evicted: 0,
        }
    }

    /// Advance the eviction cursor, returning its previous position.
    fn inc_evicted(&mut self) -> usize {
        let current = self.next_evicted;
        self.next_evicted += 1;
        if self.next_evicted == SLOTS_PER_BUCKET as i16 {
            self.next_evicted = 0;
        }
        current as usize
    }
}

/// Bounded, lock-striped cache of positive verification results.
pub struct VerifyCache {
    buckets: Vec<RwLock<Bucket>>,
    hash_bits: u32,
}

impl VerifyCache {
    /// Create a cache with at least `seed` buckets, rounded up to a power
    /// of two.
    pub fn new(seed: usize) -> Self {
        let count = seed.max(1).next_power_of_two();
        let hash_bits = count.trailing_zeros();
        let buckets = (0..count).map(|_| RwLock::new(Bucket::new())).collect();
        Self { buckets, hash_bits }
    }

    /// Bucket-count seed from `VIGIL_CACHE_BUCKETS`, defaulting to
    /// [`DEFAULT_BUCKETS`]. A value of `0` is treated as `1`.
    pub fn default_buckets() -> usize {
        std::env::var("VIGIL_CACHE_BUCKETS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_BUCKETS)
            .max(1)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, ino: u64) -> usize {
        hash_long(ino, self.hash_bits)
    }

    /// Look up `id`, returning the cached source identifier on a hit.
    pub fn lookup(&self, id: FileId) -> Option<i64> {
        let bucket = self.buckets[self.bucket_index(id.ino)]
            .read()
            .expect("cache bucket lock poisoned");
        bucket
            .slots
            .iter()
            .find(|slot| slot.matches(id))
            .map(|slot| slot.src_id)
    }

    /// Record a positive verification for `id` with its source identifier.
    ///
    /// If the bucket is full one slot is evicted round-robin; otherwise the
    /// first free slot is used and the cursor skips over it so the fresh
    /// entry is not the next victim.
    pub fn insert(&self, id: FileId, src_id: i64) {
        let mut bucket = self.buckets[self.bucket_index(id.ino)]
            .write()
            .expect("cache bucket lock poisoned");
        let free = bucket.slots.iter().position(|slot| !slot.is_used());
        let index = match free {
            Some(i) => {
                if i == bucket.next_evicted as usize {
                    bucket.inc_evicted();
                }
                i
            }
            None => bucket.inc_evicted(),
        };
        bucket.slots[index] = Slot {
            ino: id.ino,
            dev: id.dev,
            src_id,
        };
    }

    /// Drop any cached result for `id`.
    pub fn remove(&self, id: FileId) {
        let mut bucket = self.buckets[self.bucket_index(id.ino)]
            .write()
            .expect("cache bucket lock poisoned");
        for slot in bucket.slots.iter_mut() {
            if slot.matches(id) {
                *slot = Slot::UNUSED;
            }
        }
    }

    /// Drop every cached result belonging to an unmounted volume.
    pub fn purge_device(&self, dev: u64) {
        for bucket in &self.buckets {
            let mut bucket = bucket.write().expect("cache bucket lock poisoned");
            for slot in bucket.slots.iter_mut() {
                if slot.is_used() && slot.dev == dev {
                    *slot = Slot::UNUSED;
                }
            }
        }
    }

    /// Clear every slot and reset all eviction cursors.
    pub fn flush(&self) {
        for bucket in &self.buckets {
            let mut bucket = bucket.write().expect("cache bucket lock poisoned");
            bucket.slots = [Slot::UNUSED; SLOTS_PER_BUCKET];
            bucket.next_evicted = 0;
        }
    }

    /// Number of used slots across all buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                bucket
                    .read()
                    .expect("cache bucket lock poisoned")
                    .slots
                    .iter()
                    .filter(|slot| slot.is_used())
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable dump: one line per bucket listing the cached inode
    /// numbers.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.read().expect("cache bucket lock poisoned");
            out.push_str(&format!("Line: {index:03}\t"));
            for slot in bucket.slots.iter().filter(|slot| slot.is_used()) {
                out.push_str(&format!("{} ", slot.ino));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Sizing ───────────────────────────────────────────────────────────────

    #[test]
    fn test_bucket_count_rounds_up_to_power_of_two() {
        assert_eq!(VerifyCache::new(512).bucket_count(), 512);
        assert_eq!(VerifyCache::new(500).bucket_count(), 512);
        assert_eq!(VerifyCache::new(3).bucket_count(), 4);
        assert_eq!(VerifyCache::new(1).bucket_count(), 1);
        assert_eq!(VerifyCache::new(0).bucket_count(), 1);
    }

    // ── Basic hit/miss ───────────────────────────────────────────────────────

    #[test]
    fn test_lookup_miss_on_empty_cache() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        assert_eq!(cache.lookup(FileId::new(1, 100)), None);
    }

    #[test]
    fn test_insert_then_lookup_returns_src_id() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        cache.insert(FileId::new(1, 100), 42);
        assert_eq!(cache.lookup(FileId::new(1, 100)), Some(42));
    }

    #[test]
    fn test_lookup_distinguishes_devices() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        cache.insert(FileId::new(1, 100), 42);
        assert_eq!(
            cache.lookup(FileId::new(2, 100)),
            None,
            "same inode on another device must miss"
        );
    }

    #[test]
    fn test_insert_then_remove_yields_miss() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        let id = FileId::new(1, 100);
        cache.insert(id, 42);
        cache.remove(id);
        assert_eq!(cache.lookup(id), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_absent_entry_is_safe() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        cache.remove(FileId::new(1, 100));
        assert!(cache.is_empty());
    }

    // ── Eviction (single-bucket cache makes every insert collide) ───────────

    #[test]
    fn test_bucket_never_exceeds_eight_slots() {
        let cache = VerifyCache::new(1);
        for ino in 1..=20 {
            cache.insert(FileId::new(1, ino), ino as i64);
        }
        assert_eq!(cache.len(), SLOTS_PER_BUCKET);
    }

    #[test]
    fn test_ninth_insert_evicts_exactly_one_round_robin() {
        let cache = VerifyCache::new(1);
        for ino in 1..=8 {
            cache.insert(FileId::new(1, ino), ino as i64);
        }
        assert_eq!(cache.len(), 8);
        cache.insert(FileId::new(1, 9), 9);
        assert_eq!(cache.len(), 8, "exactly one slot must have been evicted");
        assert_eq!(cache.lookup(FileId::new(1, 1)), None, "oldest slot evicted first");
        for ino in 2..=9 {
            assert_eq!(
                cache.lookup(FileId::new(1, ino)),
                Some(ino as i64),
                "ino {ino} should survive the first eviction"
            );
        }
    }

    #[test]
    fn test_just_inserted_slot_is_not_next_victim() {
        let cache = VerifyCache::new(1);
        for ino in 1..=9 {
            cache.insert(FileId::new(1, ino), ino as i64);
        }
        // Ino 9 took slot 0; the cursor must now point past it, so the next
        // eviction removes ino 2, not ino 9.
        cache.insert(FileId::new(1, 10), 10);
        assert_eq!(cache.lookup(FileId::new(1, 9)), Some(9));
        assert_eq!(cache.lookup(FileId::new(1, 2)), None);
    }

    #[test]
    fn test_insert_into_freed_cursor_slot_advances_cursor() {
        let cache = VerifyCache::new(1);
        for ino in 1..=8 {
            cache.insert(FileId::new(1, ino), ino as i64);
        }
        // Cursor wrapped back to slot 0. Free it, reinsert into it, and the
        // fresh entry must not be the immediate next victim.
        cache.remove(FileId::new(1, 1));
        cache.insert(FileId::new(1, 50), 50);
        cache.insert(FileId::new(1, 51), 51); // full bucket again: evicts slot 1
        assert_eq!(cache.lookup(FileId::new(1, 50)), Some(50));
        assert_eq!(cache.lookup(FileId::new(1, 2)), None);
    }

    // ── purge / flush ────────────────────────────────────────────────────────

    #[test]
    fn test_purge_device_clears_only_that_device() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        cache.insert(FileId::new(1, 100), 1);
        cache.insert(FileId::new(1, 200), 2);
        cache.insert(FileId::new(2, 100), 3);
        cache.purge_device(1);
        assert_eq!(cache.lookup(FileId::new(1, 100)), None);
        assert_eq!(cache.lookup(FileId::new(1, 200)), None);
        assert_eq!(cache.lookup(FileId::new(2, 100)), Some(3));
    }

    #[test]
    fn test_flush_clears_everything() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        for ino in 1..=32 {
            cache.insert(FileId::new(1, ino), ino as i64);
        }
        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(FileId::new(1, 5)), None);
    }

    #[test]
    fn test_reinsert_after_flush_same_src_id() {
        let cache = VerifyCache::new(DEFAULT_BUCKETS);
        let id = FileId::new(1, 100);
        cache.insert(id, 42);
        cache.flush();
        cache.insert(id, 42);
        assert_eq!(cache.lookup(id), Some(42));
    }

    // ── Dump ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_dump_lists_buckets_and_inodes() {
        let cache = VerifyCache::new(1);
        cache.insert(FileId::new(1, 123), 1);
        let dump = cache.dump();
        assert!(dump.starts_with("Line: 000\t"), "dump was: {dump}");
        assert!(dump.contains("123 "), "dump was: {dump}");
    }

    // ── Thread safety ────────────────────────────────────────────────────────

    #[test]
    fn test_concurrent_insert_lookup_remove() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(VerifyCache::new(64));
        let handles: Vec<_> = (0u64..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0u64..128 {
                        let id = FileId::new(t, i);
                        cache.insert(id, (t * 1000 + i) as i64);
                        let _ = cache.lookup(id);
                        if i % 3 == 0 {
                            cache.remove(id);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("cache thread panicked");
        }
    }
}
