//! A persistent, learned-index key-value store for byte-addressable
//! persistent memory: an RMI-learned root over a write-friendly
//! three-level structure (groups of Pointer-BEntries over unsorted
//! buckets).

pub mod bentry;
pub mod bucket;
pub mod config;
pub mod directory;
pub mod error;
pub mod group;
pub mod model;
pub mod offset;
pub mod pmem;
pub mod tree;

pub use config::{PmSizes, StoreConfig};
pub use error::{Error, Result};
pub use offset::Offset;
pub use tree::{LeTree, PutResult};
