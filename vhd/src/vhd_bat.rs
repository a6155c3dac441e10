// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, ByteOrder};
use remain::sorted;
use thiserror::Error;

use crate::{align_up, SECTOR_SIZE};

// On-disk marker of a block that has no storage yet.
pub const BAT_ENTRY_UNALLOCATED: u32 = 0xFFFF_FFFF;
pub const BAT_ENTRY_SIZE: u64 = size_of::<u32>() as u64;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdBatError {
    #[error("Failed to read BAT at offset {1:#x}: {0}")]
    ReadBat(#[source] io::Error, u64),
    #[error("Failed to write BAT at offset {1:#x}: {0}")]
    WriteBat(#[source] io::Error, u64),
}

pub type Result<T> = std::result::Result<T, VhdBatError>;

/// One slot of the block allocation table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatEntry {
    Unallocated,
    /// Sector number where the block's bitmap starts.
    Allocated(u32),
}

impl BatEntry {
    pub fn from_raw(raw: u32) -> BatEntry {
        if raw == BAT_ENTRY_UNALLOCATED {
            BatEntry::Unallocated
        } else {
            BatEntry::Allocated(raw)
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            BatEntry::Unallocated => BAT_ENTRY_UNALLOCATED,
            BatEntry::Allocated(sector) => sector,
        }
    }

    /// Builds an entry pointing at a sector aligned file offset.
    pub fn at_offset(offset: u64) -> BatEntry {
        BatEntry::Allocated((offset / SECTOR_SIZE) as u32)
    }

    pub fn sector(self) -> Option<u32> {
        match self {
            BatEntry::Unallocated => None,
            BatEntry::Allocated(sector) => Some(sector),
        }
    }

    /// File offset of the block's bitmap.
    pub fn file_offset(self) -> Option<u64> {
        self.sector().map(|s| s as u64 * SECTOR_SIZE)
    }

    pub fn is_allocated(self) -> bool {
        self != BatEntry::Unallocated
    }

    pub fn encode(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, self.to_raw());
        buf
    }
}

/// File offset of the table slot holding entry `index`.
pub fn entry_offset(table_offset: u64, index: u32) -> u64 {
    table_offset + index as u64 * BAT_ENTRY_SIZE
}

/// Bytes the table occupies on disk, rounded to whole sectors.
pub fn table_size(entries: u32) -> u64 {
    align_up(entries as u64 * BAT_ENTRY_SIZE, SECTOR_SIZE)
}

pub fn decode_entries(buf: &[u8]) -> Vec<BatEntry> {
    buf.chunks_exact(BAT_ENTRY_SIZE as usize)
        .map(|raw| BatEntry::from_raw(BigEndian::read_u32(raw)))
        .collect()
}

pub fn encode_entries(entries: &[BatEntry]) -> Vec<u8> {
    let mut buf = vec![0u8; entries.len() * BAT_ENTRY_SIZE as usize];
    for (raw, entry) in buf
        .chunks_exact_mut(BAT_ENTRY_SIZE as usize)
        .zip(entries.iter())
    {
        BigEndian::write_u32(raw, entry.to_raw());
    }
    buf
}

/// Reads `count` entries starting at `table_offset`. Entries are not
/// validated here, a bad pointer is rejected when it is dereferenced.
pub fn load_bat(file: &File, table_offset: u64, count: u32) -> Result<Vec<BatEntry>> {
    let mut buf = vec![0u8; count as usize * BAT_ENTRY_SIZE as usize];
    file.read_exact_at(&mut buf, table_offset)
        .map_err(|e| VhdBatError::ReadBat(e, table_offset))?;
    Ok(decode_entries(&buf))
}

/// Writes the whole table back.
pub fn save_bat(file: &File, table_offset: u64, entries: &[BatEntry]) -> Result<()> {
    file.write_all_at(&encode_entries(entries), table_offset)
        .map_err(|e| VhdBatError::WriteBat(e, table_offset))
}

/// Writes a single slot.
pub fn save_entry(file: &File, table_offset: u64, index: u32, entry: BatEntry) -> Result<()> {
    let offset = entry_offset(table_offset, index);
    file.write_all_at(&entry.encode(), offset)
        .map_err(|e| VhdBatError::WriteBat(e, offset))
}

#[cfg(test)]
mod unit_tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn sentinel_is_not_an_offset() {
        assert_eq!(BatEntry::from_raw(0xFFFF_FFFF), BatEntry::Unallocated);
        assert_eq!(BatEntry::Unallocated.file_offset(), None);
        assert_eq!(BatEntry::from_raw(4).file_offset(), Some(2048));
        assert_eq!(BatEntry::at_offset(2048), BatEntry::Allocated(4));
        assert_eq!(BatEntry::Allocated(4).encode(), [0, 0, 0, 4]);
        assert_eq!(BatEntry::Unallocated.encode(), [0xff; 4]);
    }

    #[test]
    fn table_sizes() {
        assert_eq!(table_size(1), 512);
        assert_eq!(table_size(128), 512);
        assert_eq!(table_size(129), 1024);
        assert_eq!(entry_offset(1536, 3), 1548);
    }

    #[test]
    fn load_save_table() {
        let file = TempFile::new().unwrap().into_file();
        let mut entries = vec![BatEntry::Unallocated; 6];
        entries[1] = BatEntry::Allocated(4);
        entries[4] = BatEntry::Allocated(4101);
        save_bat(&file, 1536, &entries).unwrap();
        assert_eq!(load_bat(&file, 1536, 6).unwrap(), entries);

        save_entry(&file, 1536, 2, BatEntry::Allocated(8198)).unwrap();
        entries[2] = BatEntry::Allocated(8198);
        assert_eq!(load_bat(&file, 1536, 6).unwrap(), entries);

        let mut raw = [0u8; 4];
        file.read_exact_at(&mut raw, 1536 + 8).unwrap();
        assert_eq!(raw, [0x00, 0x00, 0x20, 0x06]);
    }

    #[test]
    fn load_past_end_fails() {
        let file = TempFile::new().unwrap().into_file();
        assert!(matches!(
            load_bat(&file, 1536, 4),
            Err(VhdBatError::ReadBat(_, 1536))
        ));
    }
}
