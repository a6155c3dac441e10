// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::os::unix::fs::FileExt;

use serde::Serialize;

use crate::vhd::{Result, Vhd, VhdError};
use crate::vhd_bat::{self, BatEntry};
use crate::vhd_bitmap::SectorBitmap;
use crate::vhd_footer::DiskType;
use crate::{is_zeroed, Progress, SECTOR_SIZE};

/// Read access to the image a differencing image is layered on.
pub trait ParentReader: Send + Sync {
    /// Fills `buf` with the parent's content at `address`. Ranges without
    /// data read as zeroes.
    fn read_at(&self, address: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl ParentReader for Vhd {
    fn read_at(&self, address: u64, buf: &mut [u8]) -> io::Result<()> {
        self.read_zero_filled(address, buf).map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("Failed reading parent at offset {}: {}", address, e),
            )
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    pub allocated_before: u32,
    pub blocks_freed: u32,
    pub blocks_moved: u32,
    pub bytes_reclaimed: u64,
}

impl Vhd {
    /// Frees blocks that add nothing over what a read would return without
    /// them, then packs the remaining blocks towards the start of the data
    /// area and shrinks the file.
    ///
    /// A block is redundant when every sector it marks present is zero, or,
    /// with `parent` given, equal to the parent's content. Differencing
    /// images without a parent only give up blocks with no present sector.
    pub fn compact(&mut self, parent: Option<&dyn ParentReader>) -> Result<CompactStats> {
        self.compact_with_progress(parent, &mut |_| {})
    }

    /// Like [`Vhd::compact`], calling `progress` with the completed
    /// percentage as the work advances. The last call reports 100.
    pub fn compact_with_progress(
        &mut self,
        parent: Option<&dyn ParentReader>,
        progress: &mut dyn FnMut(u32),
    ) -> Result<CompactStats> {
        let mut progress = Progress::new(progress);
        let stats = self.compact_blocks(parent, &mut progress)?;
        progress.set(100);
        Ok(stats)
    }

    fn compact_blocks(
        &mut self,
        parent: Option<&dyn ParentReader>,
        progress: &mut Progress<'_>,
    ) -> Result<CompactStats> {
        self.check_writable()?;
        let layout = self.layout()?;
        if self.expansion_in_flight() {
            return Err(VhdError::AllocationInProgress);
        }
        let differencing = self.disk_type() == DiskType::Differencing;
        if parent.is_some() && !differencing {
            return Err(VhdError::UnsupportedConfiguration(
                "only differencing images can be compared against a parent",
            ));
        }
        if parent.is_some() && self.parent_uuid() == Some(self.uuid()) {
            return Err(VhdError::UnsupportedConfiguration(
                "image is its own parent",
            ));
        }

        self.flush_bitmaps()?;

        let stride = layout.stride();
        let eof = self.eof();
        let mut bat = self.bat.read().unwrap().clone();
        let mut stats = CompactStats::default();

        let start = match bat.iter().filter_map(|e| e.file_offset()).min() {
            Some(start) => start,
            None => return Ok(stats),
        };
        stats.allocated_before = bat.iter().filter(|e| e.is_allocated()).count() as u32;

        // Slot k of the data area holds the block stored at start + k * stride.
        let mut slots: Vec<Option<u32>> = vec![None; stats.allocated_before as usize];
        for (block, entry) in bat.iter().enumerate() {
            let offset = match entry.file_offset() {
                Some(offset) => offset,
                None => continue,
            };
            let delta = offset - start;
            let slot = (delta / stride) as usize;
            if delta % stride != 0
                || offset + stride > eof
                || self.overlaps_metadata(offset, offset + stride)
                || slot >= slots.len()
                || slots[slot].is_some()
            {
                return Err(VhdError::CorruptImage(format!(
                    "block {block} at {offset:#x} does not fit a packed data area, repair the image"
                )));
            }
            slots[slot] = Some(block as u32);
        }

        let table_offset = self.table_offset()?;
        let size = self.size();
        let mut buf = vec![0u8; stride as usize];
        let mut reference = vec![0u8; layout.block_size as usize];
        let total = slots.len() as u64;
        for (index, slot) in slots.iter_mut().enumerate() {
            progress.step(0, 50, index as u64, total);
            let block = match *slot {
                Some(block) => block,
                None => continue,
            };
            let block_offset = start + index as u64 * stride;
            self.file
                .read_exact_at(&mut buf, block_offset)
                .map_err(VhdError::ReadData)?;

            let block_start = block as u64 * layout.block_size as u64;
            let left = size.checked_sub(block_start).ok_or_else(|| {
                VhdError::CorruptImage(format!(
                    "block {block} starts past the end of the disk at {block_start:#x}"
                ))
            })?;
            let in_range = std::cmp::min(layout.block_size as u64, left) as usize;
            let (bits, payload) = buf.split_at(layout.bitmap_size() as usize);
            let bitmap = SectorBitmap::from_vec(bits[..layout.bitmap_bytes as usize].to_vec());
            let payload = &payload[..in_range];

            let redundant = match parent {
                Some(parent) => {
                    parent
                        .read_at(block_start, &mut reference[..in_range])
                        .map_err(VhdError::ReadData)?;
                    present_sectors_match(&bitmap, payload, Some(&reference[..in_range]))
                }
                None if differencing => !has_present_sector(&bitmap, in_range),
                None => present_sectors_match(&bitmap, payload, None),
            };

            if redundant {
                debug!("Freeing redundant block {} at {:#x}", block, block_offset);
                bat[block as usize] = BatEntry::Unallocated;
                self.bitmaps.lock().unwrap().remove(block);
                *slot = None;
                stats.blocks_freed += 1;
            }
        }

        if stats.blocks_freed == 0 && start + slots.len() as u64 * stride == eof {
            return Ok(stats);
        }

        // Freed entries reach the disk before any block moves.
        *self.bat.write().unwrap() = bat.clone();
        vhd_bat::save_bat(&self.file, table_offset, &bat).map_err(VhdError::Bat)?;

        let mut top = slots.len();
        for free in 0..slots.len() {
            progress.step(50, 100, free as u64, total);
            if slots[free].is_some() {
                continue;
            }
            while top > free && slots[top - 1].is_none() {
                top -= 1;
            }
            if top <= free {
                break;
            }
            let used = top - 1;
            let block = match slots[used].take() {
                Some(block) => block,
                None => break,
            };

            let source = start + used as u64 * stride;
            let target = start + free as u64 * stride;
            self.file
                .read_exact_at(&mut buf, source)
                .map_err(VhdError::ReadData)?;
            self.file
                .write_all_at(&buf, target)
                .map_err(VhdError::WriteData)?;

            let entry = BatEntry::at_offset(target);
            self.bat.write().unwrap()[block as usize] = entry;
            vhd_bat::save_entry(&self.file, table_offset, block, entry).map_err(VhdError::Bat)?;
            slots[free] = Some(block);
            stats.blocks_moved += 1;
            debug!("Moved block {} from {:#x} to {:#x}", block, source, target);

            while top > 0 && slots[top - 1].is_none() {
                top -= 1;
            }
            self.set_end_of_data(start + top as u64 * stride)?;
        }

        while top > 0 && slots[top - 1].is_none() {
            top -= 1;
        }
        let new_eof = start + top as u64 * stride;
        if new_eof != self.eof() {
            self.set_end_of_data(new_eof)?;
        }
        stats.bytes_reclaimed = eof - new_eof;

        Vhd::flush(self)?;
        info!(
            "Compacted image: {} blocks freed, {} moved, {} bytes reclaimed",
            stats.blocks_freed, stats.blocks_moved, stats.bytes_reclaimed
        );
        Ok(stats)
    }
}

fn has_present_sector(bitmap: &SectorBitmap, len: usize) -> bool {
    let sectors = (len as u64 / SECTOR_SIZE) as u32;
    (0..sectors).any(|s| bitmap.is_set(s))
}

/// True when every sector marked present in `bitmap` carries the same bytes
/// in `payload` as in `reference`, or zeroes without a reference.
fn present_sectors_match(bitmap: &SectorBitmap, payload: &[u8], reference: Option<&[u8]>) -> bool {
    payload
        .chunks(SECTOR_SIZE as usize)
        .enumerate()
        .all(|(sector, data)| {
            if !bitmap.is_set(sector as u32) {
                return true;
            }
            match reference {
                Some(reference) => {
                    let start = sector * SECTOR_SIZE as usize;
                    data == &reference[start..start + data.len()]
                }
                None => is_zeroed(data),
            }
        })
}

#[cfg(test)]
mod unit_tests {
    use std::fs::File;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::vhd::{CreateOptions, IoStatus, ParentInfo};
    use crate::vhd_dynamic_header::{DynamicHeader, DYNAMIC_HEADER_SIZE};
    use crate::ImageConfig;

    const BLOCK: u64 = 64 * 1024;
    const STRIDE: u64 = BLOCK + 512;

    fn image(disk_type: DiskType, parent: Option<ParentInfo>) -> (File, Vhd) {
        let file = TempFile::new().unwrap().into_file();
        let mut options = CreateOptions::new(disk_type, 16 * BLOCK);
        options.block_size = BLOCK as u32;
        options.parent = parent;
        let vhd = Vhd::create(file.try_clone().unwrap(), &options).unwrap();
        (file, vhd)
    }

    fn fill(vhd: &Vhd, block: u64, byte: u8) {
        let data = vec![byte; BLOCK as usize];
        assert_eq!(vhd.write(block * BLOCK, &data).unwrap(), IoStatus::Done(BLOCK as usize));
    }

    fn read_block(vhd: &Vhd, block: u64) -> Vec<u8> {
        let mut buf = vec![0xeeu8; BLOCK as usize];
        vhd.read_zero_filled(block * BLOCK, &mut buf).unwrap();
        buf
    }

    fn file_size(file: &File) -> u64 {
        file.metadata().unwrap().len()
    }

    #[test]
    fn frees_zero_blocks_and_packs() {
        let (file, mut vhd) = image(DiskType::Dynamic, None);
        for (block, byte) in [(0, 1u8), (3, 0), (5, 2), (7, 0), (9, 3)] {
            fill(&vhd, block, byte);
        }
        let before = file_size(&file);
        let start = vhd.bat.read().unwrap()[0].file_offset().unwrap();

        let stats = vhd.compact(None).unwrap();
        assert_eq!(
            stats,
            CompactStats {
                allocated_before: 5,
                blocks_freed: 2,
                blocks_moved: 1,
                bytes_reclaimed: 2 * STRIDE,
            }
        );
        assert_eq!(file_size(&file), before - 2 * STRIDE);
        assert_eq!(vhd.eof(), start + 3 * STRIDE);
        assert_eq!(vhd.allocated_blocks(), 3);

        // Block 9 filled the hole block 3 left behind.
        let bat = vhd_bat::load_bat(&file, 1536, 16).unwrap();
        assert_eq!(bat[3], BatEntry::Unallocated);
        assert_eq!(bat[9].file_offset(), Some(start + STRIDE));

        drop(vhd);
        let vhd = Vhd::new(file, ImageConfig::default()).unwrap();
        assert_eq!(read_block(&vhd, 0), vec![1u8; BLOCK as usize]);
        assert_eq!(read_block(&vhd, 5), vec![2u8; BLOCK as usize]);
        assert_eq!(read_block(&vhd, 9), vec![3u8; BLOCK as usize]);
        assert!(is_zeroed(&read_block(&vhd, 3)));
        let mut buf = vec![0u8; 512];
        assert_eq!(
            vhd.read(7 * BLOCK, &mut buf).unwrap(),
            IoStatus::not_allocated(512)
        );
    }

    #[test]
    fn compact_reports_progress() {
        let (_file, mut vhd) = image(DiskType::Dynamic, None);
        for (block, byte) in [(0, 1u8), (3, 0), (5, 2), (7, 0), (9, 3)] {
            fill(&vhd, block, byte);
        }

        let mut seen = Vec::new();
        let stats = vhd
            .compact_with_progress(None, &mut |p: u32| seen.push(p))
            .unwrap();
        assert_eq!(stats.blocks_freed, 2);
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.contains(&50));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        // An image with nothing to do still finishes at 100.
        let (_file, mut empty) = image(DiskType::Dynamic, None);
        let mut seen = Vec::new();
        empty
            .compact_with_progress(None, &mut |p: u32| seen.push(p))
            .unwrap();
        assert_eq!(seen, vec![100]);
    }

    #[test]
    fn partially_written_zero_block_is_freed() {
        let (_file, mut vhd) = image(DiskType::Dynamic, None);
        vhd.write(0, &[0u8; 1024]).unwrap();
        vhd.write(BLOCK + 512, &[4u8; 512]).unwrap();

        let stats = vhd.compact(None).unwrap();
        assert_eq!(stats.blocks_freed, 1);
        assert_eq!(stats.blocks_moved, 1);
        let mut buf = vec![0u8; 512];
        assert_eq!(vhd.read(BLOCK + 512, &mut buf).unwrap(), IoStatus::Done(512));
        assert_eq!(buf, vec![4u8; 512]);
        assert_eq!(vhd.read(BLOCK, &mut buf).unwrap(), IoStatus::not_allocated(512));
    }

    #[test]
    fn nothing_to_do() {
        let (file, mut vhd) = image(DiskType::Dynamic, None);
        assert_eq!(vhd.compact(None).unwrap(), CompactStats::default());
        fill(&vhd, 2, 9);
        let before = file_size(&file);
        let stats = vhd.compact(None).unwrap();
        assert_eq!(stats.allocated_before, 1);
        assert_eq!(stats.blocks_freed + stats.blocks_moved, 0);
        assert_eq!(file_size(&file), before);
    }

    #[test]
    fn differencing_against_parent() {
        let (_base_file, base) = image(DiskType::Dynamic, None);
        fill(&base, 0, 7);
        fill(&base, 1, 7);
        fill(&base, 4, 7);

        let parent = ParentInfo {
            uuid: base.uuid(),
            timestamp: base.timestamp(),
            path: "/images/base.vhd".into(),
        };
        let (_file, mut child) = image(DiskType::Differencing, Some(parent));
        fill(&child, 0, 7);
        fill(&child, 1, 8);
        // Zeroes over parent data change what a read returns.
        child.write(4 * BLOCK, &[0u8; 512]).unwrap();

        // Without the parent only blocks without present sectors may go.
        let stats = child.compact(None).unwrap();
        assert_eq!(stats.blocks_freed, 0);

        let stats = child.compact(Some(&base)).unwrap();
        assert_eq!(stats.blocks_freed, 1);
        assert_eq!(child.allocated_blocks(), 2);
        let mut buf = vec![0u8; 512];
        assert_eq!(child.read(0, &mut buf).unwrap(), IoStatus::not_allocated(512));
        assert_eq!(child.read(BLOCK, &mut buf).unwrap(), IoStatus::Done(512));
        assert_eq!(buf, vec![8u8; 512]);
        assert_eq!(child.read(4 * BLOCK, &mut buf).unwrap(), IoStatus::Done(512));
    }

    #[test]
    fn rejects_unsupported_images() {
        let (_file, mut fixed) = image(DiskType::Fixed, None);
        assert!(matches!(fixed.compact(None), Err(VhdError::Unsupported(_))));

        let (_file, mut dynamic) = image(DiskType::Dynamic, None);
        let (_other_file, other) = image(DiskType::Dynamic, None);
        assert!(matches!(
            dynamic.compact(Some(&other)),
            Err(VhdError::UnsupportedConfiguration(_))
        ));

        let uuid = uuid::Uuid::new_v4();
        let parent = ParentInfo {
            uuid,
            timestamp: 0,
            path: "/images/self.vhd".into(),
        };
        let (_file, mut child) = image(DiskType::Differencing, Some(parent));
        child.set_uuid(uuid).unwrap();
        assert!(matches!(
            child.compact(Some(&other)),
            Err(VhdError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn rejects_unpacked_layout() {
        let (file, vhd) = image(DiskType::Dynamic, None);
        fill(&vhd, 0, 1);
        fill(&vhd, 1, 0);
        let second = vhd.bat.read().unwrap()[1].file_offset().unwrap();
        drop(vhd);

        // Shift block 1 by one sector so it no longer sits on a slot.
        vhd_bat::save_entry(&file, 1536, 1, BatEntry::at_offset(second - 512)).unwrap();
        let before = file_size(&file);
        let mut vhd = Vhd::new(file.try_clone().unwrap(), ImageConfig::default()).unwrap();
        assert!(matches!(vhd.compact(None), Err(VhdError::CorruptImage(_))));
        assert_eq!(file_size(&file), before);
        assert_eq!(vhd.allocated_blocks(), 2);
    }

    #[test]
    fn entry_past_the_disk_is_corrupt() {
        let (file, vhd) = image(DiskType::Dynamic, None);
        fill(&vhd, 0, 1);
        fill(&vhd, 1, 2);
        let second = vhd.bat.read().unwrap()[1].file_offset().unwrap();
        drop(vhd);

        // Widen the table past the 16 blocks the disk covers and move block
        // 1 into one of the extra entries.
        let mut buf = vec![0u8; DYNAMIC_HEADER_SIZE];
        file.read_exact_at(&mut buf, 512).unwrap();
        let mut header = DynamicHeader::decode(&buf).unwrap();
        header.set_max_table_entries(20);
        header.refresh_checksum();
        file.write_all_at(&header.encode(), 512).unwrap();
        vhd_bat::save_entry(&file, 1536, 1, BatEntry::Unallocated).unwrap();
        vhd_bat::save_entry(&file, 1536, 18, BatEntry::at_offset(second)).unwrap();

        let before = file_size(&file);
        let mut vhd = Vhd::new(file.try_clone().unwrap(), ImageConfig::default()).unwrap();
        assert!(matches!(vhd.compact(None), Err(VhdError::CorruptImage(_))));
        assert_eq!(file_size(&file), before);
        assert_eq!(read_block(&vhd, 0), vec![1u8; BLOCK as usize]);
    }

    #[test]
    fn entry_inside_metadata_is_corrupt() {
        let (file, vhd) = image(DiskType::Dynamic, None);
        fill(&vhd, 0, 1);
        drop(vhd);

        vhd_bat::save_entry(&file, 1536, 0, BatEntry::at_offset(512)).unwrap();
        let mut vhd = Vhd::new(file.try_clone().unwrap(), ImageConfig::default()).unwrap();
        assert!(matches!(vhd.compact(None), Err(VhdError::CorruptImage(_))));
        assert_eq!(vhd_bat::load_bat(&file, 1536, 16).unwrap()[0].file_offset(), Some(512));
    }
}
