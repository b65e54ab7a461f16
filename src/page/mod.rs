//! Page & Slotted Layout (C1).
//!
//! Fixed 4 KiB page container with a header and a slot directory growing
//! down from the end of the page. Free space is always contiguous between
//! the last payload and the slot directory.
//!
//! The header holds page id, page LSN, checksum, free-space pointer, slot
//! count and flags (spec §3); laid out as fixed-width little-endian fields
//! this comes to 24 bytes rather than the distilled spec's rounded "16" —
//! `page_id:u32 + page_lsn:u64 + checksum:u32 + free_space_ptr:u16 +
//! slot_count:u16 + flags:u16` alone is 22 bytes before 4-byte alignment.
//! Every field spec §3 names is present; see DESIGN.md.

mod row;

pub use row::{DataValue, Row};

use crate::error::{EngineError, Result};

pub const PAGE_SIZE: usize = 4096;
const HEADER_SIZE: usize = 24;
const SLOT_SIZE: usize = 4;

pub type PageId = u32;

/// Stable row identity: a slot number within a page. Stable across
/// `reorganize` (the slot number is preserved); only the slot's offset
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RowId {
    pub page_id: PageId,
    pub slot: u16,
}

impl RowId {
    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

/// A slot directory entry: 4 bytes, `offset: u16, length: u16`.
/// `length == 0` marks a deleted (tombstoned) slot; the slot number is never
/// reused until the whole page is emptied by `reorganize`.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u16,
    length: u16,
}

impl Slot {
    const SIZE: usize = SLOT_SIZE;

    fn is_deleted(&self) -> bool {
        self.length == 0
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            offset: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.offset.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
    }
}

/// A fixed-size 4 KiB page. Layout:
/// `[16-byte header | payload region (grows up) | ... free ... | slot directory (grows down)]`
#[derive(Clone)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id())
            .field("page_lsn", &self.page_lsn())
            .field("slot_count", &self.slot_count())
            .field("free_space", &self.free_space())
            .finish()
    }
}

impl Page {
    /// Allocate a fresh, zeroed page with the given id.
    pub fn new(page_id: PageId) -> Self {
        let mut page = Self {
            data: Box::new([0u8; PAGE_SIZE]),
        };
        page.set_page_id(page_id);
        page.set_free_space_pointer(HEADER_SIZE as u16);
        page.set_slot_count(0);
        page
    }

    /// Reconstitute a page from raw disk bytes (after a checksum check by
    /// the caller).
    pub fn from_bytes(bytes: [u8; PAGE_SIZE]) -> Self {
        Self {
            data: Box::new(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    // --- header accessors ---

    pub fn page_id(&self) -> PageId {
        u32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }

    fn set_page_id(&mut self, id: PageId) {
        self.data[0..4].copy_from_slice(&id.to_le_bytes());
    }

    pub fn page_lsn(&self) -> u64 {
        u64::from_le_bytes(self.data[4..12].try_into().unwrap())
    }

    pub fn set_page_lsn(&mut self, lsn: u64) {
        self.data[4..12].copy_from_slice(&lsn.to_le_bytes());
    }

    fn checksum_field(&self) -> u32 {
        u32::from_le_bytes(self.data[12..16].try_into().unwrap())
    }

    fn set_checksum_field(&mut self, checksum: u32) {
        self.data[12..16].copy_from_slice(&checksum.to_le_bytes());
    }

    fn free_space_pointer(&self) -> u16 {
        u16::from_le_bytes(self.data[16..18].try_into().unwrap())
    }

    fn set_free_space_pointer(&mut self, ptr: u16) {
        self.data[16..18].copy_from_slice(&ptr.to_le_bytes());
    }

    pub fn slot_count(&self) -> u16 {
        u16::from_le_bytes(self.data[18..20].try_into().unwrap())
    }

    fn set_slot_count(&mut self, count: u16) {
        self.data[18..20].copy_from_slice(&count.to_le_bytes());
    }

    pub fn flags(&self) -> u16 {
        u16::from_le_bytes(self.data[20..22].try_into().unwrap())
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.data[20..22].copy_from_slice(&flags.to_le_bytes());
    }

    /// Checksum covers bytes `[HEADER_SIZE .. page_size)`: the payload and
    /// slot directory, recomputed on eviction.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[HEADER_SIZE..])
    }

    /// Recompute and store the checksum; callers do this on eviction.
    pub fn refresh_checksum(&mut self) {
        let checksum = self.compute_checksum();
        self.set_checksum_field(checksum);
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum_field() == self.compute_checksum()
    }

    fn slot_dir_start(&self) -> usize {
        PAGE_SIZE - self.slot_count() as usize * Slot::SIZE
    }

    pub fn free_space(&self) -> usize {
        self.slot_dir_start().saturating_sub(self.free_space_pointer() as usize)
    }

    fn read_slot(&self, slot_no: u16) -> Option<Slot> {
        if slot_no >= self.slot_count() {
            return None;
        }
        let base = PAGE_SIZE - (slot_no as usize + 1) * Slot::SIZE;
        Some(Slot::read(&self.data[base..base + Slot::SIZE]))
    }

    fn write_slot(&mut self, slot_no: u16, slot: Slot) {
        let base = PAGE_SIZE - (slot_no as usize + 1) * Slot::SIZE;
        slot.write(&mut self.data[base..base + Slot::SIZE]);
    }

    /// Insert a new row payload, appending a new slot. Fails with `NoSpace`
    /// if `len(bytes) + 4 > free_space`.
    pub fn insert_row(&mut self, bytes: &[u8]) -> Result<u16> {
        let needed = bytes.len() + Slot::SIZE;
        if needed > self.free_space() {
            return Err(EngineError::NoSpace {
                requested: needed,
                available: self.free_space(),
            });
        }
        let offset = self.free_space_pointer();
        self.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);

        let slot_no = self.slot_count();
        self.write_slot(
            slot_no,
            Slot {
                offset,
                length: bytes.len() as u16,
            },
        );
        self.set_slot_count(slot_no + 1);
        self.set_free_space_pointer(offset + bytes.len() as u16);
        Ok(slot_no)
    }

    pub fn read_row(&self, slot_no: u16) -> Result<&[u8]> {
        let slot = self
            .read_slot(slot_no)
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| EngineError::SlotNotFound(RowId::new(self.page_id(), slot_no)))?;
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        Ok(&self.data[start..end])
    }

    /// Mark a slot's length as zero. Space is reclaimed only by
    /// `reorganize`; the slot number itself is never reused before that.
    pub fn delete_row(&mut self, slot_no: u16) -> Result<()> {
        let mut slot = self
            .read_slot(slot_no)
            .ok_or_else(|| EngineError::SlotNotFound(RowId::new(self.page_id(), slot_no)))?;
        slot.length = 0;
        self.write_slot(slot_no, slot);
        Ok(())
    }

    /// Update a slot's payload, keeping its slot number (and therefore its
    /// `RowId`) stable. A payload no longer than the slot's current
    /// capacity is overwritten in place; a longer one is relocated into
    /// the page's free space region instead, leaving the old bytes as
    /// garbage `reorganize` later reclaims. Fails with `NoSpace` only if
    /// the page has no room left for the larger payload at all.
    pub fn update_row_in_place(&mut self, slot_no: u16, bytes: &[u8]) -> Result<()> {
        let slot = self
            .read_slot(slot_no)
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| EngineError::SlotNotFound(RowId::new(self.page_id(), slot_no)))?;

        if bytes.len() <= slot.length as usize {
            let start = slot.offset as usize;
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
            self.write_slot(
                slot_no,
                Slot {
                    offset: slot.offset,
                    length: bytes.len() as u16,
                },
            );
            return Ok(());
        }

        if bytes.len() > self.free_space() {
            return Err(EngineError::NoSpace {
                requested: bytes.len(),
                available: self.free_space(),
            });
        }
        let offset = self.free_space_pointer();
        self.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        self.write_slot(
            slot_no,
            Slot {
                offset,
                length: bytes.len() as u16,
            },
        );
        self.set_free_space_pointer(offset + bytes.len() as u16);
        Ok(())
    }

    /// Compact payloads toward the start of the page, dropping tombstoned
    /// slots' space while preserving slot numbers for surviving rows.
    pub fn reorganize(&mut self) {
        let slot_count = self.slot_count();
        let mut entries: Vec<(u16, Vec<u8>)> = Vec::new();
        for slot_no in 0..slot_count {
            if let Some(slot) = self.read_slot(slot_no) {
                if !slot.is_deleted() {
                    let start = slot.offset as usize;
                    let end = start + slot.length as usize;
                    entries.push((slot_no, self.data[start..end].to_vec()));
                }
            }
        }

        let mut write_ptr = HEADER_SIZE as u16;
        for (slot_no, bytes) in entries {
            self.data[write_ptr as usize..write_ptr as usize + bytes.len()]
                .copy_from_slice(&bytes);
            self.write_slot(
                slot_no,
                Slot {
                    offset: write_ptr,
                    length: bytes.len() as u16,
                },
            );
            write_ptr += bytes.len() as u16;
        }
        self.set_free_space_pointer(write_ptr);

        // Slots that were already deleted keep their zero-length tombstone;
        // the page is considered fully empty (and slot numbers reusable)
        // only once every slot is a tombstone.
        if (0..slot_count).all(|s| self.read_slot(s).map(|sl| sl.is_deleted()).unwrap_or(true)) {
            self.set_slot_count(0);
            self.set_free_space_pointer(HEADER_SIZE as u16);
        }
    }
}
