//! C-level persistent leaf (§4.2, C2): a fixed-size unsorted array of KV
//! slots with a forward link, chosen over the sorted variant because its
//! writes touch exactly one cache line per insert (Open Question #1).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Full;
use crate::offset::Offset;
use crate::pmem::PmFile;

/// Max KV slots held by one bucket (§3: "`n ≤ MAX`≈16").
pub const MAX_SLOTS: usize = 16;

#[derive(Clone, Copy)]
struct Slot {
    key: u64,
    value: u64,
}

/// A persistent leaf. `entries` is the durability boundary: any slot at
/// index `>= entries` is considered absent by a reader that crashes
/// mid-write, so every insert writes the slot *then* flushes *then* bumps
/// and flushes `entries` last (§4.2).
#[repr(C, align(64))]
pub struct Bucket {
    header: AtomicU32,
    entries: AtomicU32,
    next: Offset,
    slots: [Slot; MAX_SLOTS],
}

const HEADER_VALID: u32 = 0xB0CC_0001;

pub enum PutOutcome {
    Ok,
    Full,
}

pub enum FindOutcome {
    Found(u64),
    NotFound,
}

impl Bucket {
    /// Byte size of one bucket, for allocator sizing calls.
    pub const SIZE: u64 = std::mem::size_of::<Bucket>() as u64;

    /// Initialize a freshly allocated bucket in place. Persisted as the
    /// last step so a reader never observes a half-initialized header.
    pub fn init(this: &mut Bucket, file: &PmFile, self_off: Offset, next: Offset) {
        this.next = next;
        this.entries.store(0, Ordering::Relaxed);
        for slot in this.slots.iter_mut() {
            slot.key = 0;
            slot.value = 0;
        }
        this.header.store(HEADER_VALID, Ordering::Relaxed);
        file.persist(self_off, Bucket::SIZE as usize);
    }

    pub fn is_valid(&self) -> bool {
        self.header.load(Ordering::Acquire) == HEADER_VALID
    }

    pub fn next(&self) -> Offset {
        self.next
    }

    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `get` (§4.2): linear scan over `n` slots.
    pub fn get(&self, key: u64) -> FindOutcome {
        let n = self.len();
        for slot in &self.slots[..n] {
            if slot.key == key {
                return FindOutcome::Found(slot.value);
            }
        }
        FindOutcome::NotFound
    }

    /// `put` (§4.2): fails with `Full` when `n == MAX`, otherwise writes
    /// slot `n`, flushes it, fences, then bumps and flushes `n`. Existing
    /// keys are updated in place instead of duplicated.
    pub fn put(&mut self, file: &PmFile, self_off: Offset, key: u64, value: u64) -> Result<PutOutcome, Full> {
        let n = self.len();
        for (i, slot) in self.slots[..n].iter_mut().enumerate() {
            if slot.key == key {
                slot.value = value;
                let off = Offset::new(self_off.get() + Self::slot_byte_offset(i));
                file.persist(off, std::mem::size_of::<Slot>());
                return Ok(PutOutcome::Ok);
            }
        }
        if n == MAX_SLOTS {
            return Err(Full::Full);
        }
        self.slots[n] = Slot { key, value };
        let slot_off = Offset::new(self_off.get() + Self::slot_byte_offset(n));
        file.persist(slot_off, std::mem::size_of::<Slot>());
        self.entries.store((n + 1) as u32, Ordering::Release);
        let entries_off = Self::entries_field_offset(self_off);
        file.persist(entries_off, std::mem::size_of::<u32>());
        Ok(PutOutcome::Ok)
    }

    /// `update` (§4.2): overwrite value in place, flush.
    pub fn update(&mut self, file: &PmFile, self_off: Offset, key: u64, value: u64) -> FindOutcome {
        let n = self.len();
        for (i, slot) in self.slots[..n].iter_mut().enumerate() {
            if slot.key == key {
                let prev = slot.value;
                slot.value = value;
                let off = Offset::new(self_off.get() + Self::slot_byte_offset(i));
                file.persist(off, std::mem::size_of::<Slot>());
                return FindOutcome::Found(prev);
            }
        }
        FindOutcome::NotFound
    }

    /// `delete` (§4.2): swap with last slot, flush, then decrement and
    /// flush `n`.
    pub fn delete(&mut self, file: &PmFile, self_off: Offset, key: u64) -> FindOutcome {
        let n = self.len();
        for i in 0..n {
            if self.slots[i].key == key {
                let removed = self.slots[i].value;
                let last = n - 1;
                if i != last {
                    self.slots[i] = self.slots[last];
                    let off = Offset::new(self_off.get() + Self::slot_byte_offset(i));
                    file.persist(off, std::mem::size_of::<Slot>());
                }
                self.entries.store(last as u32, Ordering::Release);
                let entries_off = Self::entries_field_offset(self_off);
                file.persist(entries_off, std::mem::size_of::<u32>());
                return FindOutcome::Found(removed);
            }
        }
        FindOutcome::NotFound
    }

    /// `scan_from` (§4.2): build a sorted view of this bucket's resident
    /// keys `>= start_key` (or all of them, when `start_key` is `None`,
    /// i.e. the sentinel "beginning"), push up to `remaining` pairs into
    /// `out`, and follow `next` via the caller-supplied resolver until
    /// `remaining` is exhausted or the chain ends.
    pub fn scan_local(&self, start_key: Option<u64>, out: &mut Vec<(u64, u64)>, remaining: &mut usize) {
        let n = self.len();
        let mut view: Vec<(u64, u64)> = self.slots[..n]
            .iter()
            .map(|s| (s.key, s.value))
            .filter(|(k, _)| start_key.map_or(true, |start| *k >= start))
            .collect();
        view.sort_unstable_by_key(|(k, _)| *k);
        for (k, v) in view {
            if *remaining == 0 {
                return;
            }
            out.push((k, v));
            *remaining -= 1;
        }
    }

    /// `split` (§4.2): sort keys, move the upper half into a freshly
    /// allocated bucket, link it ahead of `self`, and compact `self` down
    /// to the lower half. Returns the new bucket's offset and its
    /// smallest key (the separator pushed upward to the parent BEntry).
    pub fn split(
        &mut self,
        file: &PmFile,
        self_off: Offset,
    ) -> Result<(Offset, u64), crate::error::Error> {
        let n = self.len();
        let mut sorted: Vec<Slot> = self.slots[..n].to_vec();
        sorted.sort_unstable_by_key(|s| s.key);
        let mid = sorted.len() / 2;
        let upper = &sorted[mid..];
        let lower = &sorted[..mid];

        let new_off = file.alloc_aligned(Bucket::SIZE, 64)?;
        let new_bucket: &mut Bucket = unsafe { file.get_mut(new_off) };
        new_bucket.next = self.next;
        for (i, s) in upper.iter().enumerate() {
            new_bucket.slots[i] = *s;
        }
        new_bucket.entries.store(upper.len() as u32, Ordering::Relaxed);
        new_bucket.header.store(HEADER_VALID, Ordering::Relaxed);
        file.persist(new_off, Bucket::SIZE as usize);

        self.next = new_off;
        let next_off = Self::next_field_offset(self_off);
        file.persist(next_off, std::mem::size_of::<Offset>());

        for (i, s) in lower.iter().enumerate() {
            self.slots[i] = *s;
        }
        self.entries.store(lower.len() as u32, Ordering::Release);
        let entries_off = Self::entries_field_offset(self_off);
        file.persist(entries_off, std::mem::size_of::<u32>());

        let split_key = upper[0].key;
        Ok((new_off, split_key))
    }

    fn slot_byte_offset(index: usize) -> u64 {
        let base = std::mem::offset_of!(Bucket, slots);
        (base + index * std::mem::size_of::<Slot>()) as u64
    }

    fn entries_field_offset(self_off: Offset) -> Offset {
        Offset::new(self_off.get() + std::mem::offset_of!(Bucket, entries) as u64)
    }

    fn next_field_offset(self_off: Offset) -> Offset {
        Offset::new(self_off.get() + std::mem::offset_of!(Bucket, next) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PmSizes;
    use crate::pmem::{PmPool, Region};
    use proptest::prelude::*;

    fn new_bucket(pool: &PmPool) -> (Offset, &mut Bucket) {
        let off = pool
            .file(Region::Clevel)
            .alloc_aligned(Bucket::SIZE, 64)
            .unwrap();
        let bucket: &mut Bucket = unsafe { pool.file(Region::Clevel).get_mut(off) };
        Bucket::init(bucket, pool.file(Region::Clevel), off, Offset::NULL);
        (off, bucket)
    }

    #[test]
    fn put_get_update_delete_roundtrip() {
        let pool = PmPool::anonymous(PmSizes::new(1 << 20, 1 << 20)).unwrap();
        let (off, bucket) = new_bucket(&pool);
        let file = pool.file(Region::Clevel);

        bucket.put(file, off, 1, 100).unwrap();
        bucket.put(file, off, 2, 200).unwrap();
        assert!(matches!(bucket.get(1), FindOutcome::Found(100)));
        assert!(matches!(bucket.get(2), FindOutcome::Found(200)));
        assert!(matches!(bucket.get(3), FindOutcome::NotFound));

        assert!(matches!(bucket.update(file, off, 1, 999), FindOutcome::Found(100)));
        assert!(matches!(bucket.get(1), FindOutcome::Found(999)));

        assert!(matches!(bucket.delete(file, off, 1), FindOutcome::Found(999)));
        assert!(matches!(bucket.get(1), FindOutcome::NotFound));
        assert!(matches!(bucket.get(2), FindOutcome::Found(200)));
    }

    #[test]
    fn put_signals_full_at_capacity() {
        let pool = PmPool::anonymous(PmSizes::new(1 << 20, 1 << 20)).unwrap();
        let (off, bucket) = new_bucket(&pool);
        let file = pool.file(Region::Clevel);
        for k in 0..MAX_SLOTS as u64 {
            bucket.put(file, off, k, k * 10).unwrap();
        }
        assert!(bucket.put(file, off, 999, 1).is_err());
    }

    #[test]
    fn split_moves_upper_half_and_links_next() {
        let pool = PmPool::anonymous(PmSizes::new(1 << 20, 1 << 20)).unwrap();
        let (off, bucket) = new_bucket(&pool);
        let file = pool.file(Region::Clevel);
        for k in 0..MAX_SLOTS as u64 {
            bucket.put(file, off, k, k).unwrap();
        }
        let (new_off, split_key) = bucket.split(file, off).unwrap();
        assert_eq!(bucket.len() + {
            let new_bucket: &Bucket = unsafe { file.get(new_off) };
            new_bucket.len()
        }, MAX_SLOTS);
        assert_eq!(split_key, MAX_SLOTS as u64 / 2);
        assert_eq!(bucket.next(), new_off);
    }

    #[test]
    fn scan_local_sorts_and_filters_by_start_key() {
        let pool = PmPool::anonymous(PmSizes::new(1 << 20, 1 << 20)).unwrap();
        let (off, bucket) = new_bucket(&pool);
        let file = pool.file(Region::Clevel);
        for k in [5u64, 1, 3, 2, 4] {
            bucket.put(file, off, k, k * 10).unwrap();
        }
        let mut out = Vec::new();
        let mut remaining = 10;
        bucket.scan_local(Some(3), &mut out, &mut remaining);
        assert_eq!(out, vec![(3, 30), (4, 40), (5, 50)]);
    }

    proptest! {
        /// Invariant 1 (§8): `entries <= MAX` and all resident keys are
        /// distinct, for any sequence of puts including duplicate keys.
        #[test]
        fn entries_bounded_and_distinct_after_arbitrary_puts(
            keys in prop::collection::vec(0u64..40, 0..60)
        ) {
            let pool = PmPool::anonymous(PmSizes::new(1 << 20, 1 << 20)).unwrap();
            let (off, bucket) = new_bucket(&pool);
            let file = pool.file(Region::Clevel);
            for k in &keys {
                let _ = bucket.put(file, off, *k, *k * 10);
            }
            prop_assert!(bucket.len() <= MAX_SLOTS);
            let mut seen = std::collections::HashSet::new();
            for i in 0..bucket.len() {
                prop_assert!(seen.insert(bucket.slots[i].key));
            }
        }
    }
}
