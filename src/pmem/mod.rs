//! PM allocator and durability primitives (C1, §4.1).
//!
//! A [`PmPool`] owns the three logical PM regions from §6's on-disk layout:
//! `common` (model metadata, group directory, BEntry arrays), `data`
//! (C-level buckets), and an optional dedicated `clevel` bucket pool.

pub mod allocator;
pub mod durable;

use std::path::Path;

pub use allocator::PmFile;
pub use durable::{CpuDurable, Durable, NoopDurable, CACHE_LINE_SIZE};

use crate::config::PmSizes;
use crate::error::Result;

/// Which logical region an [`crate::offset::Offset`] resolves against.
/// BEntry arrays and the group directory live in `Common`; buckets live
/// in `Clevel` (or `Common` when no dedicated bucket pool was configured).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Common,
    Clevel,
}

/// The PM regions backing a store.
pub struct PmPool {
    pub common: PmFile,
    pub clevel: PmFile,
    clevel_configured: bool,
}

impl PmPool {
    /// Map the three files described by `sizes` under `dir` (§6: `common`,
    /// `data` merged into `common`'s allocator role, `clevel`). When
    /// `sizes.clevel` is `None`, buckets are allocated out of `common`
    /// instead of a dedicated file.
    pub fn open(dir: &Path, sizes: PmSizes) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let common = PmFile::open("common", &dir.join("common.pm"), sizes.common + sizes.data)?;
        let clevel = match sizes.clevel {
            Some(size) => PmFile::open("clevel", &dir.join("clevel.pm"), size)?,
            None => PmFile::open("clevel", &dir.join("clevel.pm"), 0)?,
        };
        Ok(Self {
            common,
            clevel,
            clevel_configured: sizes.clevel.is_some(),
        })
    }

    /// All-in-memory pool for tests and benches: no files touch disk.
    pub fn anonymous(sizes: PmSizes) -> Result<Self> {
        let common = PmFile::map_anonymous("common", sizes.common + sizes.data)?;
        let clevel = PmFile::map_anonymous("clevel", sizes.clevel.unwrap_or(0))?;
        Ok(Self {
            common,
            clevel,
            clevel_configured: sizes.clevel.is_some(),
        })
    }

    /// Resolve which file backs `region`: buckets go to the dedicated
    /// `clevel` file when one was configured, else fall back to `common`.
    /// Keyed on configuration rather than capacity: the reserved header
    /// and root slot mean even an "unconfigured" file maps a few nonzero
    /// bytes, so capacity alone can't distinguish the two cases.
    pub fn file(&self, region: Region) -> &PmFile {
        match region {
            Region::Common => &self.common,
            Region::Clevel if self.clevel_configured => &self.clevel,
            Region::Clevel => &self.common,
        }
    }

    pub fn publish(&mut self) {
        self.common.publish_cursor();
        self.clevel.publish_cursor();
    }
}
