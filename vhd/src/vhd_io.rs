// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::os::unix::fs::FileExt;

use crate::vec_cache::{CacheMap, Cacheable};
use crate::vhd::{IoStatus, Result, Vhd, VhdError};
use crate::vhd_bat::{table_size, BatEntry};
use crate::vhd_bitmap::SectorBitmap;
use crate::vhd_dynamic_header::{BlockLayout, DYNAMIC_HEADER_SIZE};
use crate::vhd_footer::FOOTER_SIZE;
use crate::SECTOR_SIZE;

/// Position of a logical offset inside the block structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockAddress {
    pub block: u32,
    pub sector: u32,
}

impl BlockAddress {
    pub fn resolve(offset: u64, layout: &BlockLayout) -> BlockAddress {
        let block_size = layout.block_size as u64;
        BlockAddress {
            block: (offset / block_size) as u32,
            sector: ((offset % block_size) / SECTOR_SIZE) as u32,
        }
    }

    /// Clips `len` so the request does not cross the end of the block.
    pub fn clip(&self, len: usize, layout: &BlockLayout) -> usize {
        let left = (layout.sectors_per_block - self.sector) as u64 * SECTOR_SIZE;
        std::cmp::min(len as u64, left) as usize
    }

    /// Bytes a caller has to supply before and after a `len` byte write at
    /// this address to cover the whole block.
    pub fn padding(&self, len: usize, layout: &BlockLayout) -> (usize, usize) {
        let pre_read = self.sector as usize * SECTOR_SIZE as usize;
        let post_read = layout.block_size as usize - len - pre_read;
        (pre_read, post_read)
    }
}

/// File offset of `sector` inside the block whose bitmap starts at `block_offset`.
pub(crate) fn payload_offset(block_offset: u64, layout: &BlockLayout, sector: u32) -> u64 {
    block_offset + layout.bitmap_size() + sector as u64 * SECTOR_SIZE
}

impl Vhd {
    /// Rejects requests that are not sector aligned or leave the disk.
    pub(crate) fn check_request(&self, offset: u64, len: usize) -> Result<()> {
        if offset % SECTOR_SIZE != 0 || len as u64 % SECTOR_SIZE != 0 {
            return Err(VhdError::Unaligned { offset, len });
        }
        match offset.checked_add(len as u64) {
            Some(end) if offset < self.size() && end <= self.size() => Ok(()),
            _ => Err(VhdError::OutOfRange { offset, len }),
        }
    }

    /// True if the byte range `[start, end)` covers the backup footer, the
    /// dynamic header, the allocation table or a parent locator.
    pub(crate) fn overlaps_metadata(&self, start: u64, end: u64) -> bool {
        let sparse = match self.sparse.as_ref() {
            Some(sparse) => sparse,
            None => return false,
        };
        let header = &sparse.header;
        let table_offset = header.table_offset();
        let mut regions = vec![
            (0, FOOTER_SIZE as u64),
            (self.footer.data_offset(), DYNAMIC_HEADER_SIZE as u64),
            (table_offset, table_size(header.max_table_entries())),
        ];
        regions.extend(
            header
                .locators()
                .iter()
                .filter(|l| !l.is_empty())
                .map(|l| (l.data_offset, l.data_space as u64)),
        );
        regions
            .into_iter()
            .any(|(offset, len)| start < offset.saturating_add(len) && offset < end)
    }

    /// Looks up the table entry for `block`, rejecting indexes past the
    /// table and pointers outside the data area.
    pub(crate) fn block_entry(&self, block: u32) -> Result<BatEntry> {
        let entry = self
            .bat
            .read()
            .unwrap()
            .get(block as usize)
            .copied()
            .ok_or_else(|| {
                VhdError::CorruptImage(format!("block {block} is beyond the allocation table"))
            })?;

        if let Some(offset) = entry.file_offset() {
            let end = offset + self.layout()?.stride();
            if end > self.eof() {
                return Err(VhdError::CorruptImage(format!(
                    "block {block} at {offset:#x} extends past the end of data {:#x}",
                    self.eof()
                )));
            }
            if self.overlaps_metadata(offset, end) {
                return Err(VhdError::CorruptImage(format!(
                    "block {block} at {offset:#x} overlaps image metadata"
                )));
            }
        }
        Ok(entry)
    }

    /// Runs `f` against the cached bitmap of `block`, loading it from
    /// `block_offset` on a miss.
    pub(crate) fn with_bitmap<R, F>(&self, block: u32, block_offset: u64, f: F) -> Result<R>
    where
        F: FnOnce(&mut SectorBitmap) -> Result<R>,
    {
        let mut cache = self.bitmaps.lock().unwrap();
        if let Some(bitmap) = cache.get_mut(block) {
            return f(bitmap);
        }

        let mut bits = vec![0u8; self.layout()?.bitmap_size() as usize];
        self.file
            .read_exact_at(&mut bits, block_offset)
            .map_err(VhdError::ReadBitmap)?;
        let mut bitmap = SectorBitmap::from_vec(bits);
        let result = f(&mut bitmap);
        self.cache_bitmap(&mut cache, block, bitmap)?;
        result
    }

    pub(crate) fn cache_bitmap(
        &self,
        cache: &mut CacheMap<SectorBitmap>,
        block: u32,
        bitmap: SectorBitmap,
    ) -> Result<()> {
        cache
            .insert(block, bitmap, |index, evicted| {
                self.store_bitmap(index, &evicted)
            })
            .map_err(VhdError::WriteBitmap)
    }

    /// Writes back a bitmap evicted from the cache.
    pub(crate) fn store_bitmap(&self, block: u32, bitmap: &SectorBitmap) -> io::Result<()> {
        let entry = self.bat.read().unwrap().get(block as usize).copied();
        match entry.and_then(BatEntry::file_offset) {
            Some(offset) => self.file.write_all_at(bitmap.as_bytes(), offset),
            None => {
                warn!("Dropping bitmap of unallocated block {}", block);
                Ok(())
            }
        }
    }

    /// Reads from a sparse image. The request is clipped to the block and to
    /// the run of sectors sharing the same presence bit.
    pub(crate) fn read_sparse(&self, offset: u64, buf: &mut [u8]) -> Result<IoStatus> {
        let layout = self.layout()?;
        let addr = BlockAddress::resolve(offset, &layout);
        let len = addr.clip(buf.len(), &layout);

        let block_offset = match self.block_entry(addr.block)?.file_offset() {
            Some(block_offset) => block_offset,
            None => return Ok(IoStatus::not_allocated(len)),
        };

        let max_sectors = (len as u64 / SECTOR_SIZE) as u32;
        let (present, run) = self.with_bitmap(addr.block, block_offset, |bitmap| {
            Ok(bitmap.run(addr.sector, max_sectors))
        })?;
        let len = run as usize * SECTOR_SIZE as usize;
        if !present {
            return Ok(IoStatus::not_allocated(len));
        }

        self.file
            .read_exact_at(
                &mut buf[..len],
                payload_offset(block_offset, &layout, addr.sector),
            )
            .map_err(VhdError::ReadData)?;
        Ok(IoStatus::Done(len))
    }

    /// Writes into a block that already has storage. The bitmap is only
    /// persisted when one of its bits changed.
    pub(crate) fn write_in_place(
        &self,
        addr: BlockAddress,
        block_offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let layout = self.layout()?;
        self.file
            .write_all_at(data, payload_offset(block_offset, &layout, addr.sector))
            .map_err(VhdError::WriteData)?;

        let sectors = (data.len() as u64 / SECTOR_SIZE) as u32;
        self.with_bitmap(addr.block, block_offset, |bitmap| {
            if bitmap.set_range(addr.sector, sectors) || bitmap.dirty() {
                self.file
                    .write_all_at(bitmap.as_bytes(), block_offset)
                    .map_err(VhdError::WriteBitmap)?;
                bitmap.mark_clean();
            }
            Ok(data.len())
        })
    }

    /// Persists every cached bitmap that has not reached the disk yet.
    pub(crate) fn flush_bitmaps(&self) -> Result<()> {
        let bat = self.bat.read().unwrap().clone();
        let mut cache = self.bitmaps.lock().unwrap();
        for (block, entry) in bat.iter().enumerate() {
            let offset = match entry.file_offset() {
                Some(offset) => offset,
                None => continue,
            };
            if let Some(bitmap) = cache.get_mut(block as u32) {
                if bitmap.dirty() {
                    self.file
                        .write_all_at(bitmap.as_bytes(), offset)
                        .map_err(VhdError::WriteBitmap)?;
                    bitmap.mark_clean();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn resolve_offsets() {
        let layout = BlockLayout::new(2 << 20);
        let addr = BlockAddress::resolve(4 << 20, &layout);
        assert_eq!(addr, BlockAddress { block: 2, sector: 0 });

        let addr = BlockAddress::resolve((2 << 20) + 3 * 512, &layout);
        assert_eq!(addr, BlockAddress { block: 1, sector: 3 });
        assert_eq!(payload_offset(1 << 20, &layout, 3), (1 << 20) + 512 + 1536);
    }

    #[test]
    fn clip_to_block() {
        let layout = BlockLayout::new(4096);
        let addr = BlockAddress { block: 0, sector: 6 };
        assert_eq!(addr.clip(4096, &layout), 1024);
        assert_eq!(addr.clip(512, &layout), 512);
        assert_eq!(addr.padding(512, &layout), (3072, 512));
        assert_eq!(BlockAddress { block: 3, sector: 0 }.padding(4096, &layout), (0, 0));
    }
}
