//! Tree Driver (§4.6, C6): top-level `letree` API. Owns the PM pool, the
//! root RMI, and the group array; performs tree expansion when a group
//! overflows.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bucket::FindOutcome;
use crate::config::{PmSizes, StoreConfig};
use crate::directory;
use crate::error::{Error, Result};
use crate::group::{Group, GroupPut};
use crate::model::TwoStageRmi;
use crate::pmem::{PmPool, Region};

/// Outcome of `put` (§6 library API: `Inserted | Updated`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    Inserted,
    Updated,
}

/// A consistent, atomically-swapped snapshot of (root model, group array)
/// (§3 "Root RMI... rebuilt atomically during tree expansion"). Readers
/// acquire an `Arc<RootState>` once per operation and see a stable view
/// even while a concurrent expansion builds the next one.
struct RootState {
    model: TwoStageRmi,
    groups: Vec<Arc<Group>>,
    min_entries_per_group: usize,
}

impl RootState {
    fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Root predict + linear correction leftward (§4.6 `put`/`get`:
    /// "locate group (root predict -> linear correct leftward)").
    fn locate_group(&self, file: &crate::pmem::PmFile, key: u64) -> usize {
        let n = self.groups.len();
        if n == 0 {
            return 0;
        }
        let predicted = self.model.predict(key, n).min(n - 1);
        let mut idx = predicted;
        while idx > 0 && self.groups[idx].min_key(file) > key {
            idx -= 1;
        }
        while idx + 1 < n && self.groups[idx + 1].min_key(file) <= key {
            idx += 1;
        }
        idx
    }
}

/// A write diverted into the overflow buffer while an expansion is in
/// flight (§9 Open Question #3). Keyed by key in [`ExpansionGate::overflow`]
/// so a later write to the same key during the same expansion simply
/// overwrites the earlier one (last-write-wins), rather than accumulating
/// a replay log of stale writes.
#[derive(Debug, Clone, Copy)]
enum OverflowOp {
    Put(u64),
    Delete,
}

/// Single atomic "is expanding" flag plus the two valid write policies
/// from §5/§9: block-on-condvar, or divert into an in-memory overflow
/// buffer consulted by readers and replayed once expansion publishes.
struct ExpansionGate {
    expanding: AtomicBool,
    cond: Condvar,
    cond_lock: Mutex<()>,
    overflow: Mutex<HashMap<u64, OverflowOp>>,
}

impl ExpansionGate {
    fn new() -> Self {
        Self {
            expanding: AtomicBool::new(false),
            cond: Condvar::new(),
            cond_lock: Mutex::new(()),
            overflow: Mutex::new(HashMap::new()),
        }
    }

    fn is_expanding(&self) -> bool {
        self.expanding.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> bool {
        self.expanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn finish(&self) {
        self.expanding.store(false, Ordering::Release);
        let _guard = self.cond_lock.lock();
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.cond_lock.lock();
        while self.is_expanding() {
            self.cond.wait(&mut guard);
        }
    }
}

/// Top-level persistent, learned-index key-value store (§6).
pub struct LeTree {
    pool: PmPool,
    config: StoreConfig,
    root: RwLock<Arc<RootState>>,
    gate: ExpansionGate,
    generation: AtomicU64,
}

impl LeTree {
    /// `init` (§4.6): on a fresh PM directory, allocate one empty group
    /// with one dummy BEntry and persist it. On a reopened directory
    /// whose files carry a previously published root directory (SPEC_FULL
    /// §3, §9 Open Question #2), recover the group array instead and
    /// re-fit the Root RMI in memory from the recovered min-keys — the
    /// RMI itself is never persisted.
    pub fn init(pm_dir: &Path, sizes: PmSizes, config: StoreConfig) -> Result<Self> {
        let pool = PmPool::open(pm_dir, sizes)?;
        let reopened = pool.file(Region::Common).existed();
        Self::from_pool(pool, config, reopened)
    }

    /// In-memory store for tests and benches. Always starts fresh: an
    /// anonymous mapping has nothing to recover.
    pub fn init_anonymous(sizes: PmSizes, config: StoreConfig) -> Result<Self> {
        let pool = PmPool::anonymous(sizes)?;
        Self::from_pool(pool, config, false)
    }

    fn from_pool(pool: PmPool, config: StoreConfig, reopened: bool) -> Result<Self> {
        let file = pool.file(Region::Common);
        let recovered = directory::recover(file)?;

        let (root, generation) = match recovered {
            Some(rec) => {
                info!(
                    groups = rec.groups.len(),
                    "letree recovered group directory from clean shutdown"
                );
                let groups: Vec<Arc<Group>> = rec.groups.into_iter().map(Arc::new).collect();
                let group_points: Vec<(u64, usize)> = groups
                    .iter()
                    .enumerate()
                    .map(|(i, g)| (g.min_key(file), i))
                    .collect();
                let model = TwoStageRmi::train(&group_points, config.root_error_bound);
                (
                    RootState {
                        model,
                        groups,
                        min_entries_per_group: rec.min_entries_per_group,
                    },
                    1,
                )
            }
            None => {
                if reopened {
                    warn!("reopened PM files carry no published root directory; starting fresh");
                }
                let group = Group::bulk_load(&pool, &[], config.max_entries_per_group)?;
                info!("letree initialized with one empty group");
                (
                    RootState {
                        model: TwoStageRmi::train(&[(0, 0)], config.root_error_bound),
                        groups: vec![Arc::new(group)],
                        min_entries_per_group: config.min_entries_per_group,
                    },
                    0,
                )
            }
        };

        let min_entries_per_group = root.min_entries_per_group;
        let groups_snapshot = root.groups.clone();
        let store = Self {
            pool,
            config,
            root: RwLock::new(Arc::new(root)),
            gate: ExpansionGate::new(),
            generation: AtomicU64::new(generation),
        };
        if generation == 0 {
            // First-ever init of this PM directory: publish the initial
            // (empty) group immediately so a `put`-only workload — one
            // that never triggers `bulk_load` or tree expansion — is
            // still recoverable after a clean shutdown.
            store.publish_directory(&groups_snapshot, min_entries_per_group)?;
        }
        Ok(store)
    }

    /// Write the current group array to the `common` file's root
    /// directory slot (SPEC_FULL §3), bumping the generation counter.
    /// Called at the end of every publish point: `bulk_load` and tree
    /// expansion. Per §4.1's durability rule, `directory::publish` itself
    /// flushes every field but `generation` first and the generation
    /// last, so a crash mid-publish leaves the previous generation
    /// authoritative.
    fn publish_directory(&self, groups: &[Arc<Group>], min_entries_per_group: usize) -> Result<()> {
        let gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let offsets: Vec<crate::offset::Offset> = groups.iter().map(|g| g.header_offset()).collect();
        directory::publish(
            self.pool.file(Region::Common),
            &offsets,
            min_entries_per_group,
            self.config.max_entries_per_group,
            gen,
        )
    }

    /// `bulk_load` (§4.6): fit the stage-1 root model first, assign each
    /// pair to a group by `predict / min_entries_per_group`, pre-count
    /// per group, then load each group.
    pub fn bulk_load(&mut self, sorted_pairs: &[(u64, u64)]) -> Result<()> {
        if sorted_pairs.is_empty() {
            return Ok(());
        }
        debug_assert!(
            sorted_pairs.windows(2).all(|w| w[0].0 < w[1].0),
            "bulk_load precondition: sorted and distinct"
        );

        let stage1_points: Vec<(u64, usize)> = sorted_pairs
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (*k, i))
            .collect();
        let stage1 = TwoStageRmi::train(&stage1_points, self.config.root_error_bound);

        let n = sorted_pairs.len();
        let min_per_group = self.config.min_entries_per_group.max(1);
        let group_count = (n + min_per_group - 1) / min_per_group;

        let mut assignments: Vec<usize> = Vec::with_capacity(n);
        for (k, _) in sorted_pairs {
            let g = stage1.predict(*k, n) / min_per_group;
            assignments.push(g.min(group_count.saturating_sub(1)));
        }

        let mut groups: Vec<Arc<Group>> = Vec::with_capacity(group_count);
        let mut start = 0;
        for g in 0..group_count {
            let end = assignments
                .iter()
                .rposition(|&a| a == g)
                .map(|p| p + 1)
                .unwrap_or(start);
            let slice = &sorted_pairs[start..end.max(start)];
            let group = Group::bulk_load(&self.pool, slice, self.config.max_entries_per_group)?;
            groups.push(Arc::new(group));
            start = end.max(start);
        }
        if groups.is_empty() {
            groups.push(Arc::new(Group::bulk_load(&self.pool, &[], self.config.max_entries_per_group)?));
        }

        let group_points: Vec<(u64, usize)> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.min_key(self.pool.file(Region::Common)), i))
            .collect();
        let root_model = TwoStageRmi::train(&group_points, self.config.root_error_bound);

        self.publish_directory(&groups, min_per_group)?;
        *self.root.write() = Arc::new(RootState {
            model: root_model,
            groups,
            min_entries_per_group: min_per_group,
        });
        self.pool.publish();
        info!(count = n, "bulk_load complete");
        Ok(())
    }

    fn snapshot(&self) -> Arc<RootState> {
        self.root.read().clone()
    }

    /// Whether `key` currently resolves to a value: consult the overflow
    /// buffer first (it reflects writes diverted during an in-flight
    /// expansion), then fall back to the pre-expansion group snapshot.
    /// Used by `put`/`update`/`delete`'s overflow path to decide
    /// `Inserted` vs `Updated` and `NotFound` without touching any group.
    fn overflow_or_group_contains(&self, key: u64) -> bool {
        match self.gate.overflow.lock().get(&key) {
            Some(OverflowOp::Put(_)) => return true,
            Some(OverflowOp::Delete) => return false,
            None => {}
        }
        let state = self.snapshot();
        let file = self.pool.file(Region::Common);
        let idx = state.locate_group(file, key);
        matches!(state.groups[idx].get(file, key), FindOutcome::Found(_))
    }

    /// `put` (§4.6): locate group, put; on `Full`, expand the tree and
    /// retry.
    pub fn put(&self, key: u64, value: u64) -> Result<PutResult> {
        if self.config.use_tmp_write_buffer && self.gate.is_expanding() {
            let existed = self.overflow_or_group_contains(key);
            self.gate.overflow.lock().insert(key, OverflowOp::Put(value));
            return Ok(if existed {
                PutResult::Updated
            } else {
                PutResult::Inserted
            });
        }
        if !self.config.use_tmp_write_buffer {
            self.gate.wait();
        }

        loop {
            let state = self.snapshot();
            let file = self.pool.file(Region::Common);
            let idx = state.locate_group(file, key);
            let existed = matches!(state.groups[idx].get(file, key), FindOutcome::Found(_));
            match state.groups[idx].put(&self.pool, key, value)? {
                GroupPut::Ok => {
                    return Ok(if existed {
                        PutResult::Updated
                    } else {
                        PutResult::Inserted
                    });
                }
                GroupPut::Full => {
                    self.expand_tree()?;
                }
            }
        }
    }

    /// `get` (§4.6): two-phase fast_find (predict-only, `fast_fail`) then
    /// slow_find (predict + correct). Per §9 Open Question #3, a reader
    /// checks the overflow buffer first whenever the expansion gate is
    /// active — a `put`/`update`/`delete` diverted there during an
    /// in-flight expansion isn't visible in any group yet.
    pub fn get(&self, key: u64) -> Option<u64> {
        if self.config.use_tmp_write_buffer && self.gate.is_expanding() {
            match self.gate.overflow.lock().get(&key) {
                Some(OverflowOp::Put(v)) => return Some(*v),
                Some(OverflowOp::Delete) => return None,
                None => {}
            }
        }
        let state = self.snapshot();
        let file = self.pool.file(Region::Common);
        let idx = state.locate_group(file, key);
        let group = &state.groups[idx];
        if group.fast_fail(file, key) {
            return None;
        }
        match group.get(file, key) {
            FindOutcome::Found(v) => Some(v),
            FindOutcome::NotFound => None,
        }
    }

    pub fn update(&self, key: u64, value: u64) -> Result<()> {
        if self.config.use_tmp_write_buffer && self.gate.is_expanding() {
            if !self.overflow_or_group_contains(key) {
                return Err(Error::NotFound);
            }
            self.gate.overflow.lock().insert(key, OverflowOp::Put(value));
            return Ok(());
        }
        if !self.config.use_tmp_write_buffer {
            self.gate.wait();
        }
        let state = self.snapshot();
        let file = self.pool.file(Region::Common);
        let idx = state.locate_group(file, key);
        match state.groups[idx].update(file, key, value) {
            FindOutcome::Found(_) => Ok(()),
            FindOutcome::NotFound => Err(Error::NotFound),
        }
    }

    pub fn delete(&self, key: u64) -> Result<()> {
        if self.config.use_tmp_write_buffer && self.gate.is_expanding() {
            if !self.overflow_or_group_contains(key) {
                return Err(Error::NotFound);
            }
            self.gate.overflow.lock().insert(key, OverflowOp::Delete);
            return Ok(());
        }
        if !self.config.use_tmp_write_buffer {
            self.gate.wait();
        }
        let state = self.snapshot();
        let file = self.pool.file(Region::Common);
        let idx = state.locate_group(file, key);
        match state.groups[idx].delete(file, key) {
            FindOutcome::Found(_) => Ok(()),
            FindOutcome::NotFound => Err(Error::NotFound),
        }
    }

    /// `scan(k, len)` (§6): returns ≤ `len` ascending pairs starting at
    /// the group containing `k`, walking forward through later groups as
    /// needed. Per §9 Open Question #3, pending overflow writes/deletes
    /// diverted during an in-flight expansion are merged in (last-write
    /// wins) before the result is truncated to `len`.
    pub fn scan(&self, key: u64, len: usize) -> Vec<(u64, u64)> {
        let state = self.snapshot();
        let file = self.pool.file(Region::Common);
        let mut out = Vec::with_capacity(len.min(1024));
        let mut remaining = len;
        let start_idx = state.locate_group(file, key);
        for idx in start_idx..state.group_count() {
            if remaining == 0 {
                break;
            }
            let start_key = if idx == start_idx { key } else { 0 };
            state.groups[idx].scan(file, start_key, &mut remaining, &mut out);
        }

        if self.config.use_tmp_write_buffer && self.gate.is_expanding() {
            let overflow = self.gate.overflow.lock();
            if !overflow.is_empty() {
                let mut merged: std::collections::BTreeMap<u64, u64> =
                    out.into_iter().collect();
                for (k, op) in overflow.iter() {
                    if *k < key {
                        continue;
                    }
                    match op {
                        OverflowOp::Put(v) => {
                            merged.insert(*k, *v);
                        }
                        OverflowOp::Delete => {
                            merged.remove(k);
                        }
                    }
                }
                drop(overflow);
                out = merged.into_iter().take(len).collect();
            } else {
                return out;
            }
        }
        out
    }

    /// `expand_tree` (§4.6 state machine, Steady -> Expanding -> Steady).
    pub fn expand_tree(&self) -> Result<()> {
        if !self.gate.try_begin() {
            // Another writer is already expanding; wait for it and let
            // the caller retry against the fresh layout.
            self.gate.wait();
            return Ok(());
        }
        let result = self.do_expand();
        self.gate.finish();
        let replay: Vec<(u64, OverflowOp)> =
            std::mem::take(&mut *self.gate.overflow.lock()).into_iter().collect();
        for (k, op) in replay {
            match op {
                OverflowOp::Put(v) => {
                    let _ = self.put(k, v);
                }
                OverflowOp::Delete => {
                    let _ = self.delete(k);
                }
            }
        }
        result
    }

    fn do_expand(&self) -> Result<()> {
        let old_state = self.snapshot();
        let file = self.pool.file(Region::Common);

        let mut all: Vec<(u64, u64)> = Vec::new();
        for group in &old_state.groups {
            all.extend(group.collect_all(file));
        }
        all.sort_unstable_by_key(|(k, _)| *k);
        all.dedup_by_key(|(k, _)| *k);

        let total = all.len();
        let min_per_group = old_state.min_entries_per_group.max(1);
        let new_group_count = ((total + min_per_group - 1) / min_per_group).max(1);

        let stage1_points: Vec<(u64, usize)> =
            all.iter().enumerate().map(|(i, (k, _))| (*k, i)).collect();
        let stage1 = TwoStageRmi::train(&stage1_points, self.config.root_error_bound);

        let mut assignments = vec![0usize; total];
        for (i, (k, _)) in all.iter().enumerate() {
            let g = stage1.predict(*k, total) / min_per_group;
            assignments[i] = g.min(new_group_count - 1);
        }

        let mut new_groups = Vec::with_capacity(new_group_count);
        let mut start = 0;
        for g in 0..new_group_count {
            let end = assignments
                .iter()
                .rposition(|&a| a == g)
                .map(|p| p + 1)
                .unwrap_or(start);
            let slice = &all[start..end.max(start)];
            let group = Group::bulk_load(&self.pool, slice, self.config.max_entries_per_group)?;
            new_groups.push(Arc::new(group));
            start = end.max(start);
        }

        let group_points: Vec<(u64, usize)> = new_groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.min_key(self.pool.file(Region::Common)), i))
            .collect();
        let new_root_model = TwoStageRmi::train(&group_points, self.config.root_error_bound);

        self.publish_directory(&new_groups, min_per_group)?;

        let new_state = Arc::new(RootState {
            model: new_root_model,
            groups: new_groups,
            min_entries_per_group: min_per_group,
        });

        // Publish: the new state becomes authoritative only after this
        // store; a crash before it leaves the old root in place and the
        // new layout is simply discarded on next open (§4.6 failure
        // policy).
        *self.root.write() = new_state;
        self.pool.file(Region::Common).fence();

        debug!(
            old_groups = old_state.group_count(),
            new_groups = new_group_count,
            total,
            "tree expansion published"
        );
        warn!(total, "tree expansion rebuilt root RMI and group array");
        Ok(())
    }
}
