// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Offline consistency check and repair of VHD images.
//!
//! Works on the raw file, without opening it as an image, so it can deal
//! with damage that makes a regular open fail.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use serde::Serialize;

use crate::vhd::{Result, VhdError};
use crate::vhd_bat::{self, BatEntry, BAT_ENTRY_SIZE};
use crate::vhd_dynamic_header::{DynamicHeader, DYNAMIC_HEADER_SIZE};
use crate::vhd_footer::{VhdFooter, VhdFooterError, FOOTER_SIZE};

/// Findings of a repair pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub messages: Vec<String>,
    /// Table entries reset to unallocated.
    pub cleared_entries: Vec<u32>,
    pub footer_repaired: bool,
    pub header_repaired: bool,
    pub table_repaired: bool,
    /// False for a dry run or a consistent image.
    pub written: bool,
}

impl RepairReport {
    pub fn is_consistent(&self) -> bool {
        !(self.footer_repaired || self.header_repaired || self.table_repaired)
    }

    fn note(&mut self, message: String) {
        info!("{}", message);
        self.messages.push(message);
    }
}

/// Checks the image at `path` and fixes what it can. With `dry_run` the
/// file is opened read-only and only the report is produced.
pub fn repair<P: AsRef<Path>>(path: P, dry_run: bool) -> Result<RepairReport> {
    let file = OpenOptions::new()
        .read(true)
        .write(!dry_run)
        .open(path.as_ref())
        .map_err(VhdError::ReadFooter)?;
    repair_file(&file, dry_run)
}

fn read_at(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset)
        .map_err(VhdError::ReadFooter)?;
    Ok(buf)
}

/// Picks the footer to trust. A valid backup wins over the trailing copy,
/// it is written first on flush. Without any valid copy the one that still
/// decodes is used with a fresh checksum.
fn select_footer(trailing: &[u8], backup: &[u8], report: &mut RepairReport) -> Result<VhdFooter> {
    let backup_footer = VhdFooter::parse(backup)
        .ok()
        .filter(|f| f.disk_type().is_sparse());

    match (VhdFooter::parse(trailing), backup_footer) {
        (Ok(footer), None) => {
            if footer.disk_type().is_sparse() {
                report.note("Backup footer is invalid, rewriting it".to_owned());
                report.footer_repaired = true;
            }
            Ok(footer)
        }
        (Ok(footer), Some(backup)) => {
            if footer != backup {
                report.note("Footer copies differ, using the backup".to_owned());
                report.footer_repaired = true;
            }
            Ok(backup)
        }
        (Err(e), Some(backup)) => {
            report.note(format!("Trailing footer is invalid ({e}), using the backup"));
            report.footer_repaired = true;
            Ok(backup)
        }
        (Err(_), None) => {
            let mut footer = match VhdFooter::decode(trailing).or_else(|_| VhdFooter::decode(backup)) {
                Ok(footer) => footer,
                Err(VhdFooterError::UnsupportedDiskType(raw)) => {
                    return Err(VhdError::RepairImpossible(format!(
                        "disk type {raw} is not supported"
                    )))
                }
                Err(_) => {
                    return Err(VhdError::RepairImpossible(
                        "no valid VHD structures found".to_owned(),
                    ))
                }
            };
            report.note(format!(
                "Footer checksum is invalid (stored {:#x}, expected {:#x}), recomputing it",
                footer.checksum(),
                footer.computed_checksum()
            ));
            footer.refresh_checksum();
            report.footer_repaired = true;
            Ok(footer)
        }
    }
}

/// Checks the image in `file`. Every check runs even after a problem was
/// found; nothing is written before all of them are done.
pub fn repair_file(file: &File, dry_run: bool) -> Result<RepairReport> {
    let mut report = RepairReport::default();
    let file_size = file.metadata().map_err(VhdError::ReadFooter)?.len();
    if file_size < FOOTER_SIZE as u64 {
        return Err(VhdError::RepairImpossible(format!(
            "image must be at least {FOOTER_SIZE} bytes, got {file_size}"
        )));
    }

    let mut footer_offset = file_size - FOOTER_SIZE as u64;
    let trailing = read_at(file, footer_offset, FOOTER_SIZE)?;
    let backup = read_at(file, 0, FOOTER_SIZE)?;
    let footer = select_footer(&trailing, &backup, &mut report)?;

    let mut sparse = None;
    if footer.disk_type().is_sparse() {
        let header_offset = footer.data_offset();
        if header_offset.saturating_add(DYNAMIC_HEADER_SIZE as u64) > file_size {
            return Err(VhdError::RepairImpossible(format!(
                "dynamic header offset {header_offset:#x} is outside the image"
            )));
        }
        let mut header = DynamicHeader::decode(&read_at(file, header_offset, DYNAMIC_HEADER_SIZE)?)
            .map_err(|e| VhdError::RepairImpossible(format!("dynamic header: {e}")))?;
        if header.checksum() != header.computed_checksum() {
            report.note(format!(
                "Dynamic header checksum is invalid (stored {:#x}, expected {:#x}), recomputing it",
                header.checksum(),
                header.computed_checksum()
            ));
            header.refresh_checksum();
            report.header_repaired = true;
        }

        let table_offset = header.table_offset();
        let entries = header.max_table_entries();
        let table_end = table_offset
            .saturating_add(entries as u64 * BAT_ENTRY_SIZE);
        if table_end > file_size {
            return Err(VhdError::RepairImpossible(
                "block allocation table is not inside the image".to_owned(),
            ));
        }
        let mut bat = vhd_bat::load_bat(file, table_offset, entries).map_err(VhdError::Bat)?;
        footer_offset = check_table(&mut bat, &header, file_size, footer_offset, &mut report);
        sparse = Some((header_offset, header, bat));
    }

    if report.is_consistent() {
        report.note("Image is consistent, no repair required".to_owned());
        return Ok(report);
    }
    if dry_run {
        report.note("Dry run, nothing was written".to_owned());
        return Ok(report);
    }

    if let Some((header_offset, header, bat)) = &sparse {
        if report.table_repaired {
            report.note("Writing repaired block allocation table".to_owned());
            vhd_bat::save_bat(file, header.table_offset(), bat).map_err(VhdError::Bat)?;
        }
        if report.header_repaired {
            report.note("Writing repaired dynamic header".to_owned());
            file.write_all_at(&header.encode(), *header_offset)
                .map_err(VhdError::WriteHeader)?;
        }
    }
    if report.footer_repaired {
        report.note(format!("Writing repaired footer at {footer_offset:#x}"));
        if sparse.is_some() {
            file.write_all_at(&footer.encode(), 0)
                .map_err(VhdError::WriteFooter)?;
        }
        file.write_all_at(&footer.encode(), footer_offset)
            .map_err(VhdError::WriteFooter)?;
    }
    file.sync_all().map_err(VhdError::Sync)?;

    report.written = true;
    report.note("Image repaired".to_owned());
    Ok(report)
}

/// Clears entries pointing outside the data area or at a block another
/// entry already claims. Returns where the trailing footer belongs.
fn check_table(
    bat: &mut [BatEntry],
    header: &DynamicHeader,
    file_size: u64,
    mut footer_offset: u64,
    report: &mut RepairReport,
) -> u64 {
    let stride = header.layout().stride();
    let data_start = header.table_offset() + vhd_bat::table_size(header.max_table_entries());
    let in_bounds = |offset: u64| offset >= data_start && offset + stride <= file_size;
    let first = bat
        .iter()
        .filter_map(|e| e.file_offset())
        .filter(|offset| in_bounds(*offset))
        .min();
    debug!("First data block at {:?}", first);

    let mut claimed = HashSet::new();
    for (index, entry) in bat.iter_mut().enumerate() {
        let offset = match entry.file_offset() {
            Some(offset) => offset,
            None => continue,
        };

        if !in_bounds(offset) {
            report.note(format!(
                "Entry {index} points to invalid offset {offset:#x}, clearing it"
            ));
        } else if !claimed.insert((offset - first.unwrap_or(offset)) / stride) {
            report.note(format!(
                "Entry {index} points to an already referenced block, clearing it"
            ));
        } else {
            if offset + stride > footer_offset {
                report.note(format!(
                    "Entry {index} intersects with the footer, moving the footer"
                ));
                footer_offset = offset + stride;
                report.footer_repaired = true;
            }
            continue;
        }

        *entry = BatEntry::Unallocated;
        report.cleared_entries.push(index as u32);
        report.table_repaired = true;
    }
    footer_offset
}

#[cfg(test)]
mod unit_tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::vhd::{CreateOptions, IoStatus, Vhd};
    use crate::vhd_footer::DiskType;
    use crate::{ErrorClass, ImageConfig};

    const MIB: u64 = 1 << 20;

    fn image_with_blocks(blocks: &[u64]) -> (TempFile, u64) {
        let temp = TempFile::new().unwrap();
        let mut options = CreateOptions::new(DiskType::Dynamic, 16 * MIB);
        options.block_size = MIB as u32;
        let vhd = Vhd::create(temp.as_file().try_clone().unwrap(), &options).unwrap();
        for block in blocks {
            vhd.write(block * MIB, &[*block as u8 + 1; 512]).unwrap();
        }
        let eof = vhd.eof();
        drop(vhd);
        (temp, eof)
    }

    fn open(file: &File) -> Result<Vhd> {
        Vhd::new(file.try_clone().unwrap(), ImageConfig::default())
    }

    fn contents(file: &File) -> Vec<u8> {
        let size = file.metadata().unwrap().len();
        read_at(file, 0, size as usize).unwrap()
    }

    #[test]
    fn consistent_image() {
        let (temp, _) = image_with_blocks(&[0, 3]);
        let before = contents(temp.as_file());
        let report = repair(temp.as_path(), false).unwrap();
        assert!(report.is_consistent());
        assert!(!report.written);
        assert!(report.cleared_entries.is_empty());
        assert_eq!(contents(temp.as_file()), before);
    }

    #[test]
    fn trailing_footer_from_backup() {
        let (temp, eof) = image_with_blocks(&[1]);
        let file = temp.as_file();
        file.write_all_at(&[0u8; 8], eof).unwrap();
        assert_eq!(open(file).unwrap_err().class(), ErrorClass::CorruptImage);

        let before = contents(file);
        let report = repair_file(file, true).unwrap();
        assert!(report.footer_repaired);
        assert!(!report.written);
        assert_eq!(contents(file), before);

        let report = repair_file(file, false).unwrap();
        assert!(report.written);
        let vhd = open(file).unwrap();
        assert_eq!(vhd.eof(), eof);
        let mut buf = [0u8; 512];
        assert_eq!(vhd.read(MIB, &mut buf).unwrap(), IoStatus::Done(512));
        assert_eq!(buf, [2u8; 512]);
    }

    #[test]
    fn both_footers_damaged() {
        let (temp, eof) = image_with_blocks(&[]);
        let file = temp.as_file();
        // Flip a reserved byte in both copies.
        file.write_all_at(&[0x55], eof + 500).unwrap();
        file.write_all_at(&[0x55], 500).unwrap();

        let report = repair_file(file, false).unwrap();
        assert!(report.footer_repaired);
        assert!(!report.header_repaired);
        assert!(open(file).is_ok());
        assert!(repair_file(file, true).unwrap().is_consistent());
    }

    #[test]
    fn backup_is_authoritative() {
        let (temp, eof) = image_with_blocks(&[]);
        let file = temp.as_file();
        let mut stale = VhdFooter::parse(&read_at(file, eof, FOOTER_SIZE).unwrap()).unwrap();
        stale.set_unique_id(uuid::Uuid::new_v4());
        stale.refresh_checksum();
        file.write_all_at(&stale.encode(), eof).unwrap();

        let report = repair_file(file, false).unwrap();
        assert!(report.footer_repaired);
        assert_eq!(read_at(file, 0, FOOTER_SIZE).unwrap(), read_at(file, eof, FOOTER_SIZE).unwrap());
        assert_ne!(open(file).unwrap().uuid(), stale.unique_id());
    }

    #[test]
    fn header_checksum() {
        let (temp, _) = image_with_blocks(&[2]);
        let file = temp.as_file();
        file.write_all_at(&[0xaa], 512 + 1000).unwrap();
        assert_eq!(open(file).unwrap_err().class(), ErrorClass::InvalidHeader);

        let report = repair_file(file, false).unwrap();
        assert!(report.header_repaired);
        assert!(!report.table_repaired);
        assert!(open(file).is_ok());
    }

    #[test]
    fn bad_table_entries_are_cleared() {
        let (temp, eof) = image_with_blocks(&[0, 1]);
        let file = temp.as_file();
        let bat = vhd_bat::load_bat(file, 1536, 16).unwrap();
        // Past the end, inside the metadata, and a second reference to block 1.
        vhd_bat::save_entry(file, 1536, 5, BatEntry::at_offset(eof + 4 * MIB)).unwrap();
        vhd_bat::save_entry(file, 1536, 6, BatEntry::at_offset(512)).unwrap();
        vhd_bat::save_entry(file, 1536, 7, bat[1]).unwrap();
        // The footer checksum breaks as well, both get reported in one pass.
        file.write_all_at(&[0x55], eof + 500).unwrap();

        let report = repair_file(file, true).unwrap();
        assert_eq!(report.cleared_entries, vec![5, 6, 7]);
        assert!(report.table_repaired && report.footer_repaired);
        assert!(!report.written);

        let report = repair_file(file, false).unwrap();
        assert!(report.written);
        let vhd = open(file).unwrap();
        assert_eq!(vhd.allocated_blocks(), 2);
        let mut buf = [0u8; 512];
        assert_eq!(vhd.read(0, &mut buf).unwrap(), IoStatus::Done(512));
        assert_eq!(buf, [1u8; 512]);
        assert_eq!(vhd.read(7 * MIB, &mut buf).unwrap(), IoStatus::not_allocated(512));
    }

    #[test]
    fn block_over_footer_moves_footer() {
        let (temp, eof) = image_with_blocks(&[0]);
        let file = temp.as_file();
        // Shift the only block so that its end covers the trailing footer.
        let block = vhd_bat::load_bat(file, 1536, 16).unwrap()[0].file_offset().unwrap();
        vhd_bat::save_entry(file, 1536, 0, BatEntry::at_offset(block + 512)).unwrap();

        let report = repair_file(file, false).unwrap();
        assert!(report.footer_repaired);
        assert!(report.cleared_entries.is_empty());
        assert_eq!(file.metadata().unwrap().len(), eof + 1024);
        assert_eq!(open(file).unwrap().eof(), eof + 512);
    }

    #[test]
    fn unrepairable_files() {
        let temp = TempFile::new().unwrap();
        let file = temp.as_file();
        assert!(matches!(repair_file(file, true), Err(VhdError::RepairImpossible(_))));

        file.write_all_at(&[0x11u8; 4096], 0).unwrap();
        let err = repair_file(file, false).unwrap_err();
        assert!(matches!(err, VhdError::RepairImpossible(_)));
        assert_eq!(err.class(), ErrorClass::CorruptImage);
        assert_eq!(contents(file), vec![0x11u8; 4096]);
    }

    #[test]
    fn fixed_image_footer() {
        let temp = TempFile::new().unwrap();
        let file = temp.as_file();
        drop(Vhd::create(file.try_clone().unwrap(), &CreateOptions::new(DiskType::Fixed, MIB)).unwrap());
        assert!(repair_file(file, true).unwrap().is_consistent());

        file.write_all_at(&[0x55], MIB + 500).unwrap();
        let report = repair_file(file, false).unwrap();
        assert!(report.footer_repaired);
        assert!(open(file).is_ok());
    }
}
