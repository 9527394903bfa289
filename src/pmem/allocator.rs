//! Bump allocator over a memory-mapped PM file (§4.1, C1).

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::offset::Offset;
use crate::pmem::durable::{CpuDurable, Durable, NoopDurable};

const MAGIC: u64 = 0x6c65_7472_6565_0001; // "letree" + version tag
const HEADER_SIZE: u64 = 64;

/// Bytes reserved immediately after the file header for a single
/// tree-level "root directory" record (see [`crate::directory`]). Bump
/// allocation never touches this region: it is addressed directly via
/// [`PmFile::root_slot`], not through `alloc`, so its offset is stable
/// and known on every reopen without needing to persist a pointer to a
/// pointer.
const ROOT_SLOT_SIZE: u64 = 64;

/// The file header cache line: magic (validates the file), and the
/// high-water mark recorded at the last publish point. Recovery resets
/// the bump cursor to `used`, per §6: "on open, the cursor is reset to
/// end-of-used-area recorded in that header."
#[repr(C)]
struct FileHeader {
    magic: u64,
    used: u64,
}

/// A single logical PM file (`common`, `data`, or `clevel`): a raw mapping
/// with a monotonic bump cursor and no on-disk free list. Freed regions
/// are retracted if they were the most recent allocation, otherwise
/// leaked until the next tree expansion rewrites the file (§6).
pub struct PmFile {
    mmap: MmapMut,
    base: *mut u8,
    len: u64,
    cursor: AtomicU64,
    durable: Arc<dyn Durable>,
    name: &'static str,
    existed: bool,
}

// SAFETY: all mutation through `PmFile` goes through `alloc`'s atomic
// fetch-add for cursor movement, and through caller-side locking (the
// Learned Group mutex) for concurrent writes to the same bytes. The raw
// `base` pointer is stable for the lifetime of the mapping.
unsafe impl Send for PmFile {}
unsafe impl Sync for PmFile {}

impl PmFile {
    /// Map or create `path` with `size` bytes of capacity (§4.1 `map`).
    /// Failure to map is fatal, per spec: it returns `Err`, and the only
    /// sane caller response is to abort store construction.
    pub fn open(name: &'static str, path: &Path, size: u64) -> Result<Self> {
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size.max(HEADER_SIZE + ROOT_SLOT_SIZE))?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let len = size.max(HEADER_SIZE + ROOT_SLOT_SIZE);

        let durable: Arc<dyn Durable> = Arc::new(CpuDurable::default());
        let mut pm = Self {
            mmap,
            base,
            len,
            cursor: AtomicU64::new(HEADER_SIZE + ROOT_SLOT_SIZE),
            durable,
            name,
            existed,
        };

        if existed {
            pm.recover()?;
        } else {
            pm.init_header();
        }
        Ok(pm)
    }

    /// In-memory mapping for tests: same allocator semantics, no real
    /// file or durability backend (Design Notes: "one no-op backend for
    /// in-memory testing").
    pub fn map_anonymous(name: &'static str, size: u64) -> Result<Self> {
        let len = size.max(HEADER_SIZE + ROOT_SLOT_SIZE);
        let mut mmap = MmapMut::map_anon(len as usize)?;
        let base = mmap.as_mut_ptr();
        let mut pm = Self {
            mmap,
            base,
            len,
            cursor: AtomicU64::new(HEADER_SIZE + ROOT_SLOT_SIZE),
            durable: Arc::new(NoopDurable::default()),
            name,
            existed: false,
        };
        pm.init_header();
        Ok(pm)
    }

    /// Whether this mapping pre-existed on disk (a reopen) versus was
    /// freshly created by this call to [`PmFile::open`]. Anonymous
    /// mappings are always fresh. Callers use this to decide whether to
    /// attempt recovery from the root directory slot (§9 Open Question
    /// #2: clean-shutdown reopen) or to perform first-time initialization.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// The fixed, never-bump-allocated slot reserved for a single
    /// tree-level "root directory" record. Always at the same offset for
    /// a given file, so it can be located on reopen without persisting a
    /// pointer to a pointer.
    pub fn root_slot(&self) -> Offset {
        Offset::new(HEADER_SIZE)
    }

    /// Byte size of the reserved root-directory slot.
    pub const ROOT_SLOT_SIZE: u64 = ROOT_SLOT_SIZE;

    fn header(&self) -> &FileHeader {
        unsafe { &*(self.base as *const FileHeader) }
    }

    fn header_mut(&mut self) -> &mut FileHeader {
        unsafe { &mut *(self.base as *mut FileHeader) }
    }

    fn init_header(&mut self) {
        let cursor = self.cursor.load(Ordering::Relaxed);
        let durable = self.durable.clone();
        let base = self.base;
        let header = self.header_mut();
        header.used = cursor;
        header.magic = MAGIC;
        durable.persist(base, HEADER_SIZE as usize);
    }

    fn recover(&mut self) -> Result<()> {
        let (magic, used) = {
            let header = self.header();
            (header.magic, header.used)
        };
        if magic != MAGIC {
            return Err(Error::Corruption(format!(
                "PM file `{}`: bad header magic",
                self.name
            )));
        }
        if used < HEADER_SIZE + ROOT_SLOT_SIZE || used > self.len {
            return Err(Error::Corruption(format!(
                "PM file `{}`: header cursor {} out of range [{}, {}]",
                self.name, used, HEADER_SIZE, self.len
            )));
        }
        self.cursor.store(used, Ordering::Relaxed);
        Ok(())
    }

    /// Record the current cursor as the new high-water mark and persist
    /// it. Called at publish points (end of bulk-load, end of tree
    /// expansion) — *not* after every allocation, which would turn every
    /// bump into a flush.
    pub fn publish_cursor(&mut self) {
        let cursor = self.cursor.load(Ordering::Acquire);
        let durable = self.durable.clone();
        let base = self.base;
        let header = self.header_mut();
        header.used = cursor;
        durable.persist(base, HEADER_SIZE as usize);
    }

    /// Bump-allocate `bytes` (§4.1 `alloc`). O(1): a single fetch-add on
    /// the atomic cursor, exactly per the concurrency model in §5.
    pub fn alloc(&self, bytes: u64) -> Result<Offset> {
        loop {
            let cur = self.cursor.load(Ordering::Relaxed);
            let next = cur
                .checked_add(bytes)
                .ok_or(Error::CapacityExhausted(self.name))?;
            if next > self.len {
                return Err(Error::CapacityExhausted(self.name));
            }
            if self
                .cursor
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Offset::new(cur));
            }
        }
    }

    /// `alloc`, padding the cursor to `align` first (§4.1 `alloc_aligned`).
    pub fn alloc_aligned(&self, bytes: u64, align: u64) -> Result<Offset> {
        debug_assert!(align.is_power_of_two());
        loop {
            let cur = self.cursor.load(Ordering::Relaxed);
            let padded = (cur + align - 1) & !(align - 1);
            let next = padded
                .checked_add(bytes)
                .ok_or(Error::CapacityExhausted(self.name))?;
            if next > self.len {
                return Err(Error::CapacityExhausted(self.name));
            }
            if self
                .cursor
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Offset::new(padded));
            }
        }
    }

    /// `free` (§4.1): retract the cursor if `(ptr, bytes)` was the most
    /// recent allocation, otherwise the bytes are leaked.
    pub fn free(&self, ptr: Offset, bytes: u64) {
        if ptr.is_null() {
            return;
        }
        let end = ptr.get() + bytes;
        let _ = self
            .cursor
            .compare_exchange(end, ptr.get(), Ordering::AcqRel, Ordering::Relaxed);
    }

    #[inline]
    unsafe fn ptr_at(&self, offset: Offset) -> *mut u8 {
        debug_assert!(!offset.is_null());
        debug_assert!(offset.get() < self.len);
        self.base.add(offset.get() as usize)
    }

    /// Resolve an [`Offset`] to a shared reference. The only place in the
    /// crate that casts a byte offset into a typed pointer.
    #[inline]
    pub unsafe fn get<T>(&self, offset: Offset) -> &T {
        &*(self.ptr_at(offset) as *const T)
    }

    /// Resolve an [`Offset`] to an exclusive reference.
    #[inline]
    pub unsafe fn get_mut<T>(&self, offset: Offset) -> &mut T {
        &mut *(self.ptr_at(offset) as *mut T)
    }

    /// `flush` (§4.1).
    pub fn flush(&self, offset: Offset, len: usize) {
        let ptr = unsafe { self.ptr_at(offset) };
        self.durable.flush(ptr, len);
    }

    /// `persist` = `flush` then `fence` (§4.1).
    pub fn persist(&self, offset: Offset, len: usize) {
        let ptr = unsafe { self.ptr_at(offset) };
        self.durable.persist(ptr, len);
    }

    /// `fence` (§4.1).
    pub fn fence(&self) {
        self.durable.fence();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> u64 {
        self.len
    }

    pub fn used(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }
}
