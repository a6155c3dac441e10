// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::fs::FileExt;

use crate::vhd::{Result, Vhd, VhdError};
use crate::vhd_bat::{self, BatEntry};
use crate::{align_up, Progress, SECTOR_SIZE, VHD_MAX_SIZE};

impl Vhd {
    /// Grows the virtual disk to `new_size` bytes. Shrinking is not
    /// supported.
    ///
    /// When the larger allocation table does not fit in front of the data
    /// area, the parent locators behind the table are moved up and the
    /// blocks they would overlap are appended at the end of the file.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        self.resize_with_progress(new_size, &mut |_| {})
    }

    /// Like [`Vhd::resize`], calling `progress` with the completed
    /// percentage as the work advances. The last call reports 100.
    pub fn resize_with_progress(
        &mut self,
        new_size: u64,
        progress: &mut dyn FnMut(u32),
    ) -> Result<()> {
        let mut progress = Progress::new(progress);
        self.resize_table(new_size, &mut progress)?;
        progress.set(100);
        Ok(())
    }

    fn resize_table(&mut self, new_size: u64, progress: &mut Progress<'_>) -> Result<()> {
        self.check_writable()?;
        let new_size = align_up(new_size, SECTOR_SIZE);
        let current = self.size();
        if new_size < current {
            return Err(VhdError::Shrink {
                current,
                requested: new_size,
            });
        }
        if new_size > VHD_MAX_SIZE {
            return Err(VhdError::TooLarge(new_size));
        }
        let layout = self.layout()?;
        if new_size == current {
            return Ok(());
        }

        // Pending metadata lands at its current location first.
        Vhd::flush(self)?;

        let table_offset = self.table_offset()?;
        let old_entries = self.bat.read().unwrap().len() as u32;
        let new_entries = div_round_up!(new_size, layout.block_size as u64) as u32;
        let old_table_end = table_offset + vhd_bat::table_size(old_entries);
        let new_table_end = table_offset + vhd_bat::table_size(new_entries);

        if new_table_end > old_table_end {
            self.make_room_for_table(old_table_end, new_table_end, layout.stride(), progress)?;
        }

        let mut bat = self.bat.write().unwrap();
        bat.resize(new_entries as usize, BatEntry::Unallocated);
        vhd_bat::save_bat(&self.file, table_offset, &bat).map_err(VhdError::Bat)?;
        drop(bat);

        if let Some(sparse) = self.sparse.as_mut() {
            sparse.header.set_max_table_entries(new_entries);
        }
        self.mark_header_dirty()?;
        self.set_size(new_size);
        Vhd::flush(self)?;

        info!(
            "Resized image from {} to {} bytes, {} blocks",
            current, new_size, new_entries
        );
        Ok(())
    }

    /// Clears `[old_table_end, new_table_end)` and whatever the moved parent
    /// locators need behind it.
    fn make_room_for_table(
        &mut self,
        old_table_end: u64,
        new_table_end: u64,
        stride: u64,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let first_block = self
            .bat
            .read()
            .unwrap()
            .iter()
            .filter_map(|e| e.file_offset())
            .min()
            .unwrap_or_else(|| self.eof());

        // Locators living between the table and the first block follow the
        // table, in their current order.
        let mut moved = Vec::new();
        let mut data_start = new_table_end;
        if let Some(sparse) = &self.sparse {
            let mut preamble: Vec<(usize, u64, u32)> = sparse
                .header
                .locators()
                .iter()
                .enumerate()
                .filter(|(_, l)| !l.is_empty() && l.data_offset < first_block)
                .map(|(i, l)| (i, l.data_offset, l.data_space))
                .collect();
            preamble.sort_by_key(|(_, offset, _)| *offset);

            for (index, offset, space) in preamble {
                let mut data = vec![0u8; space as usize];
                self.file
                    .read_exact_at(&mut data, offset)
                    .map_err(VhdError::ReadHeader)?;
                moved.push((index, data_start, data));
                data_start += align_up(space as u64, SECTOR_SIZE);
            }
        }

        let mut overlapping: Vec<(usize, u64)> = self
            .bat
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(block, e)| e.file_offset().map(|offset| (block, offset)))
            .filter(|(_, offset)| *offset < data_start)
            .collect();
        overlapping.sort_by_key(|(_, offset)| *offset);

        let table_offset = self.table_offset()?;
        let mut eof = std::cmp::max(self.eof(), data_start);
        let mut buf = vec![0u8; stride as usize];
        let total = overlapping.len() as u64;
        for (done, (block, offset)) in overlapping.into_iter().enumerate() {
            progress.step(0, 90, done as u64, total);
            self.file
                .read_exact_at(&mut buf, offset)
                .map_err(VhdError::ReadData)?;
            self.file
                .write_all_at(&buf, eof)
                .map_err(VhdError::WriteData)?;
            let entry = BatEntry::at_offset(eof);
            self.bat.write().unwrap()[block] = entry;
            vhd_bat::save_entry(&self.file, table_offset, block as u32, entry)
                .map_err(VhdError::Bat)?;
            debug!("Moved block {} from {:#x} to {:#x}", block, offset, eof);
            eof += stride;
        }
        self.set_end_of_data(eof)?;

        // Nothing in the vacated range is referenced anymore.
        let zeroes = vec![0u8; stride as usize];
        let mut offset = old_table_end;
        while offset < data_start {
            let len = std::cmp::min(stride, data_start - offset) as usize;
            self.file
                .write_all_at(&zeroes[..len], offset)
                .map_err(VhdError::WriteData)?;
            offset += len as u64;
        }

        for (index, offset, data) in moved {
            self.file
                .write_all_at(&data, offset)
                .map_err(VhdError::WriteHeader)?;
            if let Some(sparse) = self.sparse.as_mut() {
                sparse.header.locator_mut(index).data_offset = offset;
            }
            debug!("Moved parent locator {} to {:#x}", index, offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use std::fs::File;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::vhd::{CreateOptions, IoStatus, ParentInfo};
    use crate::vhd_footer::{DiskType, Geometry};
    use crate::ImageConfig;

    const MIB: u64 = 1 << 20;
    const BLOCK: u64 = 64 * 1024;
    const STRIDE: u64 = BLOCK + 512;

    fn image(disk_type: DiskType, size: u64, block_size: u64) -> (File, Vhd) {
        let file = TempFile::new().unwrap().into_file();
        let mut options = CreateOptions::new(disk_type, size);
        options.block_size = block_size as u32;
        if disk_type == DiskType::Differencing {
            options.parent = Some(ParentInfo {
                uuid: uuid::Uuid::new_v4(),
                timestamp: 42,
                path: "/images/base.vhd".into(),
            });
        }
        let vhd = Vhd::create(file.try_clone().unwrap(), &options).unwrap();
        (file, vhd)
    }

    fn reopen(file: &File) -> Vhd {
        Vhd::new(file.try_clone().unwrap(), ImageConfig::default()).unwrap()
    }

    fn read_sector(vhd: &Vhd, offset: u64) -> (IoStatus, Vec<u8>) {
        let mut buf = vec![0u8; 512];
        let status = vhd.read(offset, &mut buf).unwrap();
        (status, buf)
    }

    #[test]
    fn grow_within_table() {
        let (file, mut vhd) = image(DiskType::Dynamic, 64 * MIB, 2 * MIB);
        vhd.write(63 * MIB, &[5u8; 512]).unwrap();
        let eof = vhd.eof();

        vhd.resize(100 * MIB).unwrap();
        assert_eq!(vhd.size(), 100 * MIB);
        assert_eq!(vhd.eof(), eof);
        drop(vhd);

        let vhd = reopen(&file);
        assert_eq!(vhd.size(), 100 * MIB);
        assert_eq!(vhd.geometry(), Geometry::from_size(100 * MIB));
        assert_eq!(vhd.bat.read().unwrap().len(), 50);
        assert_eq!(read_sector(&vhd, 63 * MIB), (IoStatus::Done(512), vec![5u8; 512]));
        assert_eq!(read_sector(&vhd, 99 * MIB).0, IoStatus::not_allocated(512));
    }

    #[test]
    fn grow_relocates_leading_blocks() {
        let (file, mut vhd) = image(DiskType::Dynamic, 64 * BLOCK, BLOCK);
        vhd.write(0, &[1u8; 512]).unwrap();
        vhd.write(BLOCK, &[2u8; 512]).unwrap();
        assert_eq!(vhd.bat.read().unwrap()[0].file_offset(), Some(2048));
        let eof = vhd.eof();

        // 200 entries need two sectors of table, which reaches into block 0.
        vhd.resize(200 * BLOCK).unwrap();
        assert_eq!(vhd.bat.read().unwrap()[0].file_offset(), Some(eof));
        assert_eq!(vhd.bat.read().unwrap()[1].file_offset(), Some(2048 + STRIDE));
        assert_eq!(vhd.eof(), eof + STRIDE);
        assert_eq!(file.metadata().unwrap().len(), eof + STRIDE + 512);
        drop(vhd);

        let vhd = reopen(&file);
        assert_eq!(vhd.bat.read().unwrap().len(), 200);
        assert_eq!(read_sector(&vhd, 0), (IoStatus::Done(512), vec![1u8; 512]));
        assert_eq!(read_sector(&vhd, BLOCK), (IoStatus::Done(512), vec![2u8; 512]));
        assert_eq!(read_sector(&vhd, 150 * BLOCK).0, IoStatus::not_allocated(512));

        // The image keeps allocating after the moved block.
        vhd.write(199 * BLOCK, &[3u8; 512]).unwrap();
        assert_eq!(
            vhd.bat.read().unwrap()[199].file_offset(),
            Some(eof + STRIDE)
        );
    }

    #[test]
    fn grow_moves_parent_locators() {
        let (file, mut vhd) = image(DiskType::Differencing, 64 * BLOCK, BLOCK);
        let paths = vhd.parent_locator_paths().unwrap();
        vhd.write(0, &[6u8; 512]).unwrap();
        assert_eq!(vhd.bat.read().unwrap()[0].file_offset(), Some(4096));

        vhd.resize(200 * BLOCK).unwrap();
        let locators = vhd.sparse.as_ref().unwrap().header.locators().to_owned();
        assert_eq!(locators[0].data_offset, 2560);
        assert_eq!(locators[1].data_offset, 3584);
        // Block 0 overlapped the second locator's new home.
        assert!(vhd.bat.read().unwrap()[0].file_offset().unwrap() >= 4608);
        drop(vhd);

        let vhd = reopen(&file);
        assert_eq!(vhd.parent_locator_paths().unwrap(), paths);
        assert_eq!(vhd.parent_filename().unwrap(), "base.vhd");
        assert_eq!(read_sector(&vhd, 0), (IoStatus::Done(512), vec![6u8; 512]));
    }

    #[test]
    fn grow_empty_image_past_table() {
        let (file, mut vhd) = image(DiskType::Dynamic, 64 * BLOCK, BLOCK);
        vhd.resize(1000 * BLOCK).unwrap();
        assert_eq!(vhd.eof(), 1536 + 4096);
        drop(vhd);

        let vhd = reopen(&file);
        assert_eq!(vhd.eof(), 1536 + 4096);
        vhd.write(999 * BLOCK, &[1u8; 512]).unwrap();
        assert_eq!(read_sector(&vhd, 999 * BLOCK), (IoStatus::Done(512), vec![1u8; 512]));
    }

    #[test]
    fn rejected_resizes() {
        let (file, mut vhd) = image(DiskType::Dynamic, 64 * MIB, 2 * MIB);
        assert!(matches!(
            vhd.resize(32 * MIB),
            Err(VhdError::Shrink { .. })
        ));
        assert!(matches!(
            vhd.resize(VHD_MAX_SIZE + MIB),
            Err(VhdError::TooLarge(_))
        ));
        let before = file.metadata().unwrap().len();
        vhd.resize(64 * MIB).unwrap();
        assert_eq!(file.metadata().unwrap().len(), before);

        let (_file, mut fixed) = image(DiskType::Fixed, MIB, 2 * MIB);
        assert!(matches!(fixed.resize(2 * MIB), Err(VhdError::Unsupported(_))));
    }

    #[test]
    fn resize_reports_progress() {
        let (_file, mut vhd) = image(DiskType::Dynamic, 64 * BLOCK, BLOCK);
        vhd.write(0, &[1u8; 512]).unwrap();
        vhd.write(BLOCK, &[2u8; 512]).unwrap();

        let mut seen = Vec::new();
        vhd.resize_with_progress(200 * BLOCK, &mut |p: u32| seen.push(p))
            .unwrap();
        assert_eq!(seen, vec![0, 100]);

        let mut seen = Vec::new();
        assert!(vhd
            .resize_with_progress(100 * BLOCK, &mut |p: u32| seen.push(p))
            .is_err());
        assert!(seen.is_empty());
    }
}
