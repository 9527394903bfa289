use thiserror::Error;

/// Error taxonomy surfaced across the public API.
///
/// `Full` and `AlreadyExists` are deliberately absent: per the durability
/// discipline, `Full` is always resolved (bucket split, BEntry split, group
/// expansion, or tree expansion) before an operation returns, and
/// `AlreadyExists` is folded into `put`'s `Updated` result.
#[derive(Error, Debug)]
pub enum Error {
    /// Key absent; returned to the caller unchanged.
    #[error("key not found")]
    NotFound,
    /// The PM file has no remaining room. Fatal: the store does not attempt
    /// online recovery from allocator exhaustion.
    #[error("PM capacity exhausted for region `{0}`")]
    CapacityExhausted(&'static str),
    /// An invariant was violated while reading persisted structures on
    /// open/recovery. Unrecoverable: aborts load.
    #[error("corruption detected during recovery: {0}")]
    Corruption(String),
    /// Propagated I/O failure mapping or growing a backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Internal signal returned by a `put` at the bucket/BEntry/group layer.
/// Never escapes the crate's public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Full {
    Full,
}
