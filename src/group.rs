//! Learned Group (§4.4, C4): a contiguous Pointer-BEntry array plus one
//! linear predictor over their `entry_key`s.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::bentry::PointerBEntry;
use crate::bucket::{Bucket, FindOutcome};
use crate::error::{Error, Full, Result};
use crate::model::LinearModel;
use crate::offset::Offset;
use crate::pmem::{PmFile, PmPool, Region};

/// Target entry count before a group signals overflow upward (§4.4
/// `max_entry_count`~1024).
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Persisted header for one Learned Group: entries array location,
/// capacity/count, and the fitted linear model (§3 "Learned Group").
#[repr(C)]
pub struct GroupHeader {
    entries_off: Offset,
    capacity: u32,
    count: AtomicU32,
    min_key: u64,
    slope: f64,
    intercept: f64,
}

impl GroupHeader {
    const SIZE: u64 = std::mem::size_of::<GroupHeader>() as u64;

    fn model(&self) -> LinearModel {
        LinearModel {
            slope: self.slope,
            intercept: self.intercept,
        }
    }

    fn set_model(&mut self, model: LinearModel) {
        self.slope = model.slope;
        self.intercept = model.intercept;
    }
}

/// Runtime handle to one Learned Group. The mutex serializes writers;
/// readers take no lock and instead read the header's atomically
/// published `count`/model fields directly (§5: "readers take no lock").
pub struct Group {
    header_off: Offset,
    write_lock: Mutex<()>,
    max_entries: usize,
}

pub enum GroupPut {
    Ok,
    Full,
}

impl Group {
    /// `bulk_load` (§4.4): construct `pairs.len()` BEntries, each seeded
    /// with one bucket holding one KV pair; fit a linear model to
    /// `(entry_key, index)` pairs sampled every `stride`-th entry;
    /// persist all BEntries then the header.
    pub fn bulk_load(pool: &PmPool, pairs: &[(u64, u64)], max_entries: usize) -> Result<Self> {
        let file = pool.file(Region::Common);
        let count = pairs.len().max(1);
        let entries_off = file.alloc_aligned(PointerBEntry::SIZE * count as u64, 64)?;

        for (i, (key, value)) in pairs.iter().enumerate() {
            let bucket_off = pool
                .file(Region::Clevel)
                .alloc_aligned(Bucket::SIZE, 64)?;
            let bucket: &mut Bucket = unsafe { pool.file(Region::Clevel).get_mut(bucket_off) };
            Bucket::init(bucket, pool.file(Region::Clevel), bucket_off, Offset::NULL);
            bucket.put(pool.file(Region::Clevel), bucket_off, *key, *value)
                .map_err(|_| Error::Corruption("fresh bucket reported Full".into()))?;

            let entry_off = Offset::new(entries_off.get() + i as u64 * PointerBEntry::SIZE);
            let entry: &mut PointerBEntry = unsafe { file.get_mut(entry_off) };
            entry.init_with_bucket(*key, bucket_off);
        }
        if pairs.is_empty() {
            let entry: &mut PointerBEntry = unsafe { file.get_mut(entries_off) };
            let bucket_off = pool.file(Region::Clevel).alloc_aligned(Bucket::SIZE, 64)?;
            let bucket: &mut Bucket = unsafe { pool.file(Region::Clevel).get_mut(bucket_off) };
            Bucket::init(bucket, pool.file(Region::Clevel), bucket_off, Offset::NULL);
            entry.init_with_bucket(0, bucket_off);
        }
        file.persist(entries_off, (PointerBEntry::SIZE * count as u64) as usize);

        const SAMPLE_STRIDE: usize = 100;
        let sample: Vec<(f64, f64)> = (0..count)
            .step_by(SAMPLE_STRIDE.max(1))
            .map(|i| {
                let entry: &PointerBEntry = unsafe { file.get(Offset::new(entries_off.get() + i as u64 * PointerBEntry::SIZE)) };
                (entry.entry_key() as f64, i as f64)
            })
            .collect();
        let model = LinearModel::fit(&sample);

        let min_key = if pairs.is_empty() {
            0
        } else {
            pairs[0].0
        };

        let header_off = file.alloc_aligned(GroupHeader::SIZE, 64)?;
        let header: &mut GroupHeader = unsafe { file.get_mut(header_off) };
        header.entries_off = entries_off;
        header.capacity = count as u32;
        header.count.store(count as u32, Ordering::Relaxed);
        header.min_key = min_key;
        header.set_model(model);
        file.persist(header_off, GroupHeader::SIZE as usize);

        Ok(Self {
            header_off,
            write_lock: Mutex::new(()),
            max_entries,
        })
    }

    pub fn header_offset(&self) -> Offset {
        self.header_off
    }

    /// Wrap an already-persisted group header without allocating or
    /// touching its contents — used to reconstruct a [`Group`] handle
    /// from a recovered directory entry (§9 Open Question #2).
    pub fn from_header_offset(header_off: Offset, max_entries: usize) -> Self {
        Self {
            header_off,
            write_lock: Mutex::new(()),
            max_entries,
        }
    }

    fn header<'a>(&self, file: &'a PmFile) -> &'a GroupHeader {
        unsafe { file.get(self.header_off) }
    }

    fn header_mut<'a>(&self, file: &'a PmFile) -> &'a mut GroupHeader {
        unsafe { file.get_mut(self.header_off) }
    }

    pub fn min_key(&self, file: &PmFile) -> u64 {
        self.header(file).min_key
    }

    pub fn len(&self, file: &PmFile) -> usize {
        self.header(file).count.load(Ordering::Acquire) as usize
    }

    /// `fast_fail` (§4.4): true when this group cannot possibly hold
    /// `key`, letting a two-phase caller skip the slow predict+correct
    /// path entirely.
    pub fn fast_fail(&self, file: &PmFile, key: u64) -> bool {
        let h = self.header(file);
        h.count.load(Ordering::Acquire) == 0 || key < h.min_key
    }

    fn entry_at<'a>(&self, file: &'a PmFile, i: usize) -> &'a PointerBEntry {
        let h = self.header(file);
        unsafe { file.get(Offset::new(h.entries_off.get() + i as u64 * PointerBEntry::SIZE)) }
    }

    fn entry_at_mut<'a>(&self, file: &'a PmFile, i: usize) -> &'a mut PointerBEntry {
        let h = self.header(file);
        unsafe { file.get_mut(Offset::new(h.entries_off.get() + i as u64 * PointerBEntry::SIZE)) }
    }

    fn entry_offset(&self, file: &PmFile, i: usize) -> Offset {
        let h = self.header(file);
        Offset::new(h.entries_off.get() + i as u64 * PointerBEntry::SIZE)
    }

    /// Exponential/bounded search (§4.4 "Search detail floor"): predict
    /// with the linear model, then widen a window left or right by
    /// doubling until it brackets `key`, then binary- or linear-search
    /// inside the bracket. Returns the rightmost index whose `entry_key
    /// <= key`, or 0 when no such index exists.
    fn locate(&self, file: &PmFile, key: u64) -> usize {
        let m = self.len(file);
        if m == 0 {
            return 0;
        }
        let model = self.header(file).model();
        let predicted = model.predict(key).clamp(0.0, (m - 1) as f64) as usize;

        let entry_key_at = |i: usize| self.entry_at(file, i).entry_key();

        let (mut lo, mut hi);
        if entry_key_at(predicted) > key {
            let mut bound = 1usize;
            loop {
                if predicted < bound || entry_key_at(predicted - bound) <= key || bound >= m {
                    break;
                }
                bound *= 2;
            }
            lo = predicted.saturating_sub(bound.min(predicted));
            hi = predicted;
        } else {
            let mut bound = 1usize;
            loop {
                if predicted + bound >= m || entry_key_at(predicted + bound) > key {
                    break;
                }
                bound *= 2;
            }
            lo = predicted;
            hi = (predicted + bound).min(m - 1);
        }

        if hi - lo + 1 >= 6 {
            while lo < hi {
                let mid = lo + (hi - lo + 1) / 2;
                if entry_key_at(mid) <= key {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
        } else {
            while lo < hi && entry_key_at(lo + 1) <= key {
                lo += 1;
            }
            while lo > 0 && entry_key_at(lo) > key {
                lo -= 1;
            }
        }
        lo
    }

    pub fn get(&self, file: &PmFile, key: u64) -> FindOutcome {
        if self.fast_fail(file, key) {
            return FindOutcome::NotFound;
        }
        let i = self.locate(file, key);
        self.entry_at(file, i).get(file, key)
    }

    pub fn update(&self, file: &PmFile, key: u64, value: u64) -> FindOutcome {
        if self.fast_fail(file, key) {
            return FindOutcome::NotFound;
        }
        let i = self.locate(file, key);
        self.entry_at(file, i).update(file, key, value)
    }

    pub fn delete(&self, file: &PmFile, key: u64) -> FindOutcome {
        let _guard = self.write_lock.lock();
        if self.fast_fail(file, key) {
            return FindOutcome::NotFound;
        }
        let i = self.locate(file, key);
        let off = self.entry_offset(file, i);
        self.entry_at_mut(file, i).delete(file, off, key)
    }

    /// `put` (§4.4): predict + correct to the owning BEntry, delegate.
    /// Propagates `Full` once the BEntry is saturated and the group is
    /// already at `max_entries`.
    pub fn put(&self, pool: &PmPool, key: u64, value: u64) -> Result<GroupPut> {
        let _guard = self.write_lock.lock();
        let file = pool.file(Region::Common);
        let m = self.len(file);
        if m == 0 {
            return Ok(GroupPut::Full);
        }
        let i = self.locate(file, key);
        let off = self.entry_offset(file, i);
        let entry = self.entry_at_mut(file, i);
        match entry.put(file, off, key, value) {
            Ok(_) => {
                if key < self.min_key(file) {
                    let header = self.header_mut(file);
                    header.min_key = key;
                    file.persist(self.header_off, GroupHeader::SIZE as usize);
                }
                Ok(GroupPut::Ok)
            }
            Err(_) => Ok(GroupPut::Full),
        }
    }

    /// Every `(entry_key, bucket_offset)` pair across every BEntry,
    /// resolved through a bucket chain's own key/value pairs. Backs tree
    /// expansion's entry iterator (§4.6).
    pub fn iter_entries<'a>(&'a self, file: &'a PmFile) -> impl Iterator<Item = &'a PointerBEntry> + 'a {
        let m = self.len(file);
        (0..m).map(move |i| self.entry_at(file, i))
    }

    /// Collect every `(key, value)` pair resident under this group, in
    /// bucket-chain iteration order (not necessarily sorted). Backs both
    /// `scan` and tree/group expansion.
    pub fn collect_all(&self, file: &PmFile) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for entry in self.iter_entries(file) {
            for (_, bucket_off) in entry.triples() {
                let mut head = Some(bucket_off);
                while let Some(b_off) = head {
                    let bucket: &Bucket = unsafe { file.get(b_off) };
                    if !bucket.is_valid() {
                        break;
                    }
                    let n = bucket.len();
                    let mut remaining = n;
                    bucket.scan_local(None, &mut out, &mut remaining);
                    let next = bucket.next();
                    head = if next.is_null() { None } else { Some(next) };
                }
            }
        }
        out
    }

    /// `scan` (§4.4): starting at the BEntry located for `start_key`,
    /// collect up to `remaining` ascending pairs, walking forward through
    /// subsequent BEntries and their bucket chains as needed.
    pub fn scan(&self, file: &PmFile, start_key: u64, remaining: &mut usize, out: &mut Vec<(u64, u64)>) {
        let m = self.len(file);
        if m == 0 || *remaining == 0 {
            return;
        }
        let start_i = self.locate(file, start_key);
        for i in start_i..m {
            if *remaining == 0 {
                return;
            }
            let entry = self.entry_at(file, i);
            let mut local: Vec<(u64, u64)> = Vec::new();
            for (_, bucket_off) in entry.triples() {
                let mut head = Some(bucket_off);
                while let Some(b_off) = head {
                    let bucket: &Bucket = unsafe { file.get(b_off) };
                    if !bucket.is_valid() {
                        break;
                    }
                    let mut rem = bucket.len();
                    bucket.scan_local(None, &mut local, &mut rem);
                    let next = bucket.next();
                    head = if next.is_null() { None } else { Some(next) };
                }
            }
            local.sort_unstable_by_key(|(k, _)| *k);
            for (k, v) in local {
                if k < start_key || *remaining == 0 {
                    continue;
                }
                out.push((k, v));
                *remaining -= 1;
            }
        }
    }

    /// `expand` (§4.4): flatten every bucket slot into one sorted set of
    /// pairs, rebuild a larger Pointer-BEntry array, refit the model,
    /// persist the new array, and return the fresh [`Group`] handle. The
    /// caller (Learned Group's owner) is responsible for retiring the old
    /// array once the switch is published.
    pub fn expand(&self, pool: &PmPool, new_max_entries: usize) -> Result<Self> {
        let file = pool.file(Region::Common);
        let mut all = self.collect_all(file);
        all.sort_unstable_by_key(|(k, _)| *k);
        all.dedup_by_key(|(k, _)| *k);
        Group::bulk_load(pool, &all, new_max_entries)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PmSizes;
    use proptest::prelude::*;

    fn pool() -> PmPool {
        PmPool::anonymous(PmSizes::new(1 << 24, 1 << 24).with_clevel(1 << 24)).unwrap()
    }

    #[test]
    fn bulk_load_then_point_lookups() {
        let pool = pool();
        let pairs: Vec<(u64, u64)> = (0..500u64).map(|k| (k, k * 10)).collect();
        let group = Group::bulk_load(&pool, &pairs, DEFAULT_MAX_ENTRIES).unwrap();
        let file = pool.file(Region::Common);
        for (k, v) in &pairs {
            assert!(matches!(group.get(file, *k), FindOutcome::Found(val) if val == *v));
        }
        assert!(matches!(group.get(file, 99999), FindOutcome::NotFound));
    }

    #[test]
    fn put_update_delete_roundtrip() {
        let pool = pool();
        let pairs: Vec<(u64, u64)> = (0..50u64).map(|k| (k, k)).collect();
        let group = Group::bulk_load(&pool, &pairs, DEFAULT_MAX_ENTRIES).unwrap();
        let file = pool.file(Region::Common);

        matches!(group.put(&pool, 1000, 9999), Ok(GroupPut::Ok) | Ok(GroupPut::Full));
        assert!(matches!(group.update(file, 5, 555), FindOutcome::Found(5)));
        assert!(matches!(group.get(file, 5), FindOutcome::Found(555)));
        assert!(matches!(group.delete(file, 5), FindOutcome::Found(555)));
        assert!(matches!(group.get(file, 5), FindOutcome::NotFound));
    }

    #[test]
    fn scan_returns_ascending_pairs_from_start_key() {
        let pool = pool();
        let pairs: Vec<(u64, u64)> = (0..200u64).map(|k| (k, k)).collect();
        let group = Group::bulk_load(&pool, &pairs, DEFAULT_MAX_ENTRIES).unwrap();
        let file = pool.file(Region::Common);
        let mut out = Vec::new();
        let mut remaining = 10;
        group.scan(file, 50, &mut remaining, &mut out);
        assert_eq!(out.len(), 10);
        assert_eq!(out[0].0, 50);
        assert!(out.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn expand_preserves_all_keys() {
        let pool = pool();
        let pairs: Vec<(u64, u64)> = (0..300u64).map(|k| (k, k * 2)).collect();
        let group = Group::bulk_load(&pool, &pairs, DEFAULT_MAX_ENTRIES).unwrap();
        let expanded = group.expand(&pool, DEFAULT_MAX_ENTRIES * 2).unwrap();
        let file = pool.file(Region::Common);
        for (k, v) in &pairs {
            assert!(matches!(expanded.get(file, *k), FindOutcome::Found(val) if val == *v));
        }
    }

    proptest! {
        /// Invariant 3 (§8): BEntries within a group stay strictly sorted
        /// by `entry_key` after bulk-loading an arbitrary distinct,
        /// sorted key set.
        #[test]
        fn bentries_strictly_sorted_by_entry_key(
            mut keys in prop::collection::hash_set(0u64..5000, 1..200)
        ) {
            let pool = pool();
            let mut sorted: Vec<u64> = keys.drain().collect();
            sorted.sort_unstable();
            let pairs: Vec<(u64, u64)> = sorted.into_iter().map(|k| (k, k)).collect();
            let group = Group::bulk_load(&pool, &pairs, DEFAULT_MAX_ENTRIES).unwrap();
            let file = pool.file(Region::Common);
            let keys: Vec<u64> = group.iter_entries(file).map(|e| e.entry_key()).collect();
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
