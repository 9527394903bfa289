//! Store-wide configuration.
//!
//! The original source gates behavior with compile-time flags
//! (`MULTI_THREAD`, `USE_TMP_WRITE_BUFFER`, `BUF_SORT`, ...). Per the
//! redesign notes those become fields on an explicit config value instead
//! of global `cfg!`/env-var state, so tests can instantiate independent
//! stores with independent policies.

/// Per-file byte budgets for the logical PM regions (§6). `common` and
/// `data` share one physical file and bump cursor — spec.md's `data`
/// region names no allocation discipline distinct from `common`'s, so this
/// crate doesn't give it a separate mapping (see SPEC_FULL.md §6).
#[derive(Debug, Clone, Copy)]
pub struct PmSizes {
    /// `common` — model metadata, group directory, BEntry arrays.
    pub common: u64,
    /// `data` — C-level buckets, folded into the same file as `common`.
    pub data: u64,
    /// `clevel` — dedicated bucket pool, kept separate so bucket-heavy
    /// workloads don't fragment metadata. `None` folds bucket allocation
    /// into `common` instead.
    pub clevel: Option<u64>,
}

impl PmSizes {
    pub fn new(common: u64, data: u64) -> Self {
        Self {
            common,
            data,
            clevel: None,
        }
    }

    pub fn with_clevel(mut self, clevel: u64) -> Self {
        self.clevel = Some(clevel);
        self
    }
}

/// Build-time options from spec §6, expressed as runtime configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `MULTI_THREAD` — enable per-group locks and expansion coordination.
    /// When `false`, the tree assumes single-threaded access and skips
    /// locking entirely.
    pub multi_thread: bool,
    /// `USE_TMP_WRITE_BUFFER` — on expansion, divert new writes to a
    /// temporary in-memory buffer instead of blocking writers on a condvar.
    pub use_tmp_write_buffer: bool,
    /// `BUF_SORT` — kept for parity with the option table; the canonical
    /// bucket variant this crate implements is always unsorted (Open
    /// Question #1), so this flag currently has no effect and is reserved.
    pub buf_sort: bool,
    /// Target number of B-level entries a Learned Group holds before it
    /// signals overflow upward (§4.4, `max_entry_count` ≈ 1024).
    pub max_entries_per_group: usize,
    /// Target entries-per-group used when sizing a tree expansion (§4.6).
    pub min_entries_per_group: usize,
    /// Desired average prediction error bound for the root RMI (§4.5).
    pub root_error_bound: usize,
    /// Desired average prediction error bound for a Learned Group's linear
    /// model (§4.4, design default 4-16).
    pub group_error_bound: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            multi_thread: true,
            use_tmp_write_buffer: true,
            buf_sort: false,
            max_entries_per_group: 1024,
            min_entries_per_group: 256,
            root_error_bound: 32,
            group_error_bound: 8,
        }
    }
}

impl StoreConfig {
    pub fn single_threaded() -> Self {
        Self {
            multi_thread: false,
            use_tmp_write_buffer: false,
            ..Self::default()
        }
    }
}
