//! Persisted group directory (SPEC_FULL §3 "Group Directory", resolving
//! §9 Open Question #2: clean-shutdown reopen).
//!
//! The Root RMI itself is pure derived data and is never persisted — only
//! a directory of each Learned Group's header offset, its count, and the
//! configured `min_entries_per_group` survive a restart. On reopen the
//! driver re-fits the root model in memory from the directory's min-keys.
//! The directory lives in the `common` file's reserved root slot
//! ([`crate::pmem::PmFile::root_slot`]), so it is found without following
//! any other pointer.

use crate::error::{Error, Result};
use crate::group::Group;
use crate::offset::Offset;
use crate::pmem::PmFile;

const MAGIC: u64 = 0x6c65_7472_6565_4449; // "letreeDI"(rectory)

/// The record written to the `common` file's reserved root slot.
///
/// `generation` is written last and validates the rest of the record —
/// exactly the durability rule in §4.1: "a header field that atomically
/// 'validates' a structure... is always the last field flushed."
/// `generation == 0` means "no tree has ever been published here",
/// distinguishing a freshly created file from a corrupt one.
#[repr(C)]
struct DirectoryHeader {
    magic: u64,
    groups_off: Offset,
    group_count: u32,
    min_entries_per_group: u32,
    max_entries_per_group: u32,
    _pad: u32,
    generation: u64,
}

/// A recovered directory: enough to rebuild [`crate::tree::RootState`]
/// without re-running bulk_load.
pub struct RecoveredDirectory {
    pub groups: Vec<Group>,
    pub min_entries_per_group: usize,
    pub max_entries_per_group: usize,
}

/// Attempt to load a previously published directory from `file`'s root
/// slot. Returns `Ok(None)` when the file has never had one published
/// (a brand-new file, `generation == 0`), and `Err(Corruption)` when the
/// slot holds a nonzero generation but a bad magic (the one case that
/// indicates real on-disk damage rather than "nothing published yet").
pub fn recover(file: &PmFile) -> Result<Option<RecoveredDirectory>> {
    let header: &DirectoryHeader = unsafe { file.get(file.root_slot()) };
    if header.generation == 0 {
        return Ok(None);
    }
    if header.magic != MAGIC {
        return Err(Error::Corruption(
            "root directory slot: bad magic for nonzero generation".into(),
        ));
    }
    let count = header.group_count as usize;
    if count == 0 {
        return Err(Error::Corruption(
            "root directory slot: published generation with zero groups".into(),
        ));
    }
    let max_entries = header.max_entries_per_group as usize;
    let mut groups = Vec::with_capacity(count);
    for i in 0..count {
        let off: &Offset =
            unsafe { file.get(Offset::new(header.groups_off.get() + i as u64 * 8)) };
        groups.push(Group::from_header_offset(*off, max_entries));
    }
    Ok(Some(RecoveredDirectory {
        groups,
        min_entries_per_group: header.min_entries_per_group as usize,
        max_entries_per_group: max_entries,
    }))
}

/// Publish a fresh directory: allocate a new `groups_off` array (one
/// group-header [`Offset`] per entry), persist it, persist every
/// directory field except `generation`, then persist `generation` last.
/// The previous generation's array is simply superseded — never freed,
/// consistent with §6's "no on-disk free list."
pub fn publish(
    file: &PmFile,
    groups: &[Offset],
    min_entries_per_group: usize,
    max_entries_per_group: usize,
    generation: u64,
) -> Result<()> {
    let groups_off = file.alloc_aligned((groups.len() * 8) as u64, 8)?;
    for (i, off) in groups.iter().enumerate() {
        let slot: &mut Offset =
            unsafe { file.get_mut(Offset::new(groups_off.get() + i as u64 * 8)) };
        *slot = *off;
    }
    file.persist(groups_off, groups.len() * 8);

    let root_slot = file.root_slot();
    let header: &mut DirectoryHeader = unsafe { file.get_mut(root_slot) };
    header.magic = MAGIC;
    header.groups_off = groups_off;
    header.group_count = groups.len() as u32;
    header.min_entries_per_group = min_entries_per_group as u32;
    header.max_entries_per_group = max_entries_per_group as u32;
    let persisted_len = std::mem::size_of::<DirectoryHeader>() - std::mem::size_of::<u64>();
    file.persist(root_slot, persisted_len);

    header.generation = generation;
    let gen_off = Offset::new(root_slot.get() + std::mem::offset_of!(DirectoryHeader, generation) as u64);
    file.persist(gen_off, std::mem::size_of::<u64>());
    Ok(())
}
