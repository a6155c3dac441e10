// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use remain::sorted;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::SECTOR_SIZE;

pub const FOOTER_SIZE: usize = 512;
pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
// Reserved feature bit, always set by writers.
pub const FOOTER_FEATURES: u32 = 0x0000_0002;
pub const FOOTER_VERSION: u32 = 0x0001_0000;
// Data offset stored by images without a dynamic header.
pub const FOOTER_DATA_OFFSET_NONE: u64 = u64::MAX;
pub const CREATOR_APPLICATION: [u8; 4] = *b"clhv";
pub const CREATOR_VERSION: u32 = 0x0001_0000;
// "Wi2k"
pub const CREATOR_HOST_OS: u32 = 0x5769_326B;
// Seconds between the Unix epoch and 2000-01-01 00:00:00 UTC.
pub const VHD_EPOCH_OFFSET: u64 = 946_684_800;

const DISK_TYPE_FIXED: u32 = 2;
const DISK_TYPE_DYNAMIC: u32 = 3;
const DISK_TYPE_DIFFERENCING: u32 = 4;

// Field offsets inside the footer.
const FEATURES_OFFSET: usize = 8;
const VERSION_OFFSET: usize = 12;
const DATA_OFFSET_OFFSET: usize = 16;
const TIMESTAMP_OFFSET: usize = 24;
const CREATOR_APP_OFFSET: usize = 28;
const CREATOR_VERSION_OFFSET: usize = 32;
const CREATOR_OS_OFFSET: usize = 36;
const ORIGINAL_SIZE_OFFSET: usize = 40;
const CURRENT_SIZE_OFFSET: usize = 48;
const CYLINDERS_OFFSET: usize = 56;
const HEADS_OFFSET: usize = 58;
const SECTORS_OFFSET: usize = 59;
const DISK_TYPE_OFFSET: usize = 60;
const CHECKSUM_OFFSET: usize = 64;
const UNIQUE_ID_OFFSET: usize = 68;
const SAVED_STATE_OFFSET: usize = 84;
const RESERVED_OFFSET: usize = 85;

// CHS limits used when deriving the geometry.
const MAX_CHS_SECTORS: u64 = 65535 * 16 * 255;
const LARGE_CHS_SECTORS: u64 = 65535 * 16 * 63;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdFooterError {
    #[error("Footer checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Invalid footer cookie")]
    InvalidCookie,
    #[error("Footer is truncated to {0} bytes")]
    Truncated(usize),
    #[error("Unsupported disk type {0}")]
    UnsupportedDiskType(u32),
    #[error("Unsupported footer version {0:#x}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, VhdFooterError>;

/// One's complement of the byte sum of `buf`, skipping the 4 byte checksum
/// field at `checksum_offset`.
pub fn checksum(buf: &[u8], checksum_offset: usize) -> u32 {
    let field = checksum_offset..checksum_offset + 4;
    let sum = buf
        .iter()
        .enumerate()
        .filter(|(i, _)| !field.contains(i))
        .fold(0u32, |acc, (_, b)| acc.wrapping_add(*b as u32));
    !sum
}

/// Converts a point in time to the on-disk timestamp format.
pub fn vhd_timestamp(time: SystemTime) -> u32 {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.saturating_sub(VHD_EPOCH_OFFSET) as u32
}

pub fn system_time(timestamp: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(VHD_EPOCH_OFFSET + timestamp as u64)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    pub fn from_raw(raw: u32) -> Option<DiskType> {
        match raw {
            DISK_TYPE_FIXED => Some(DiskType::Fixed),
            DISK_TYPE_DYNAMIC => Some(DiskType::Dynamic),
            DISK_TYPE_DIFFERENCING => Some(DiskType::Differencing),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            DiskType::Fixed => DISK_TYPE_FIXED,
            DiskType::Dynamic => DISK_TYPE_DYNAMIC,
            DiskType::Differencing => DISK_TYPE_DIFFERENCING,
        }
    }

    /// Dynamic and differencing images carry a dynamic header and a BAT.
    pub fn is_sparse(self) -> bool {
        self != DiskType::Fixed
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiskType::Fixed => write!(f, "fixed"),
            DiskType::Dynamic => write!(f, "dynamic"),
            DiskType::Differencing => write!(f, "differencing"),
        }
    }
}

/// Advisory CHS geometry stored in the footer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl Geometry {
    /// Derives the geometry for a disk of `size` bytes, capping at the
    /// largest CHS addressable disk.
    pub fn from_size(size: u64) -> Geometry {
        let total_sectors = std::cmp::min(size / SECTOR_SIZE, MAX_CHS_SECTORS);

        let (sectors_per_track, heads, cylinder_times_heads) = if total_sectors
            >= LARGE_CHS_SECTORS
        {
            (255, 16, total_sectors / 255)
        } else {
            let mut sectors_per_track = 17;
            let mut cylinder_times_heads = total_sectors / sectors_per_track;
            let mut heads = std::cmp::max(div_round_up!(cylinder_times_heads, 1024), 4);

            if cylinder_times_heads >= heads * 1024 || heads > 16 {
                sectors_per_track = 31;
                heads = 16;
                cylinder_times_heads = total_sectors / sectors_per_track;
            }
            if cylinder_times_heads >= heads * 1024 {
                sectors_per_track = 63;
                heads = 16;
                cylinder_times_heads = total_sectors / sectors_per_track;
            }
            (sectors_per_track, heads, cylinder_times_heads)
        };

        Geometry {
            cylinders: (cylinder_times_heads / heads) as u16,
            heads: heads as u8,
            sectors: sectors_per_track as u8,
        }
    }
}

/// The 512 byte metadata record found at the end of every image, and
/// mirrored at offset 0 of sparse images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VhdFooter {
    features: u32,
    version: u32,
    data_offset: u64,
    timestamp: u32,
    creator_application: [u8; 4],
    creator_version: u32,
    creator_host_os: u32,
    original_size: u64,
    current_size: u64,
    geometry: Geometry,
    disk_type: DiskType,
    checksum: u32,
    unique_id: Uuid,
    saved_state: u8,
    reserved: Vec<u8>,
}

impl VhdFooter {
    /// Builds a fresh footer with a valid checksum.
    pub fn new(disk_type: DiskType, size: u64, unique_id: Uuid, timestamp: u32) -> VhdFooter {
        let data_offset = if disk_type.is_sparse() {
            FOOTER_SIZE as u64
        } else {
            FOOTER_DATA_OFFSET_NONE
        };
        let mut footer = VhdFooter {
            features: FOOTER_FEATURES,
            version: FOOTER_VERSION,
            data_offset,
            timestamp,
            creator_application: CREATOR_APPLICATION,
            creator_version: CREATOR_VERSION,
            creator_host_os: CREATOR_HOST_OS,
            original_size: size,
            current_size: size,
            geometry: Geometry::from_size(size),
            disk_type,
            checksum: 0,
            unique_id,
            saved_state: 0,
            reserved: vec![0; FOOTER_SIZE - RESERVED_OFFSET],
        };
        footer.refresh_checksum();
        footer
    }

    /// Returns true if `buf` starts with the footer cookie.
    pub fn has_cookie(buf: &[u8]) -> bool {
        buf.len() >= FOOTER_COOKIE.len() && &buf[..FOOTER_COOKIE.len()] == FOOTER_COOKIE
    }

    /// Decodes the structure without verifying the checksum.
    pub fn decode(buf: &[u8]) -> Result<VhdFooter> {
        if buf.len() < FOOTER_SIZE {
            return Err(VhdFooterError::Truncated(buf.len()));
        }
        if !VhdFooter::has_cookie(buf) {
            return Err(VhdFooterError::InvalidCookie);
        }

        let version = BigEndian::read_u32(&buf[VERSION_OFFSET..]);
        if version >> 16 != FOOTER_VERSION >> 16 {
            return Err(VhdFooterError::UnsupportedVersion(version));
        }

        let raw_type = BigEndian::read_u32(&buf[DISK_TYPE_OFFSET..]);
        let disk_type =
            DiskType::from_raw(raw_type).ok_or(VhdFooterError::UnsupportedDiskType(raw_type))?;

        let mut creator_application = [0u8; 4];
        creator_application.copy_from_slice(&buf[CREATOR_APP_OFFSET..CREATOR_APP_OFFSET + 4]);
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&buf[UNIQUE_ID_OFFSET..UNIQUE_ID_OFFSET + 16]);

        Ok(VhdFooter {
            features: BigEndian::read_u32(&buf[FEATURES_OFFSET..]),
            version,
            data_offset: BigEndian::read_u64(&buf[DATA_OFFSET_OFFSET..]),
            timestamp: BigEndian::read_u32(&buf[TIMESTAMP_OFFSET..]),
            creator_application,
            creator_version: BigEndian::read_u32(&buf[CREATOR_VERSION_OFFSET..]),
            creator_host_os: BigEndian::read_u32(&buf[CREATOR_OS_OFFSET..]),
            original_size: BigEndian::read_u64(&buf[ORIGINAL_SIZE_OFFSET..]),
            current_size: BigEndian::read_u64(&buf[CURRENT_SIZE_OFFSET..]),
            geometry: Geometry {
                cylinders: BigEndian::read_u16(&buf[CYLINDERS_OFFSET..]),
                heads: buf[HEADS_OFFSET],
                sectors: buf[SECTORS_OFFSET],
            },
            disk_type,
            checksum: BigEndian::read_u32(&buf[CHECKSUM_OFFSET..]),
            unique_id: Uuid::from_bytes(unique_id),
            saved_state: buf[SAVED_STATE_OFFSET],
            reserved: buf[RESERVED_OFFSET..FOOTER_SIZE].to_vec(),
        })
    }

    /// Decodes the structure and rejects it unless the stored checksum matches.
    pub fn parse(buf: &[u8]) -> Result<VhdFooter> {
        let footer = VhdFooter::decode(buf)?;
        let computed = checksum(&buf[..FOOTER_SIZE], CHECKSUM_OFFSET);
        if computed != footer.checksum {
            return Err(VhdFooterError::ChecksumMismatch {
                stored: footer.checksum,
                computed,
            });
        }
        Ok(footer)
    }

    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[..FOOTER_COOKIE.len()].copy_from_slice(FOOTER_COOKIE);
        BigEndian::write_u32(&mut buf[FEATURES_OFFSET..], self.features);
        BigEndian::write_u32(&mut buf[VERSION_OFFSET..], self.version);
        BigEndian::write_u64(&mut buf[DATA_OFFSET_OFFSET..], self.data_offset);
        BigEndian::write_u32(&mut buf[TIMESTAMP_OFFSET..], self.timestamp);
        buf[CREATOR_APP_OFFSET..CREATOR_APP_OFFSET + 4].copy_from_slice(&self.creator_application);
        BigEndian::write_u32(&mut buf[CREATOR_VERSION_OFFSET..], self.creator_version);
        BigEndian::write_u32(&mut buf[CREATOR_OS_OFFSET..], self.creator_host_os);
        BigEndian::write_u64(&mut buf[ORIGINAL_SIZE_OFFSET..], self.original_size);
        BigEndian::write_u64(&mut buf[CURRENT_SIZE_OFFSET..], self.current_size);
        BigEndian::write_u16(&mut buf[CYLINDERS_OFFSET..], self.geometry.cylinders);
        buf[HEADS_OFFSET] = self.geometry.heads;
        buf[SECTORS_OFFSET] = self.geometry.sectors;
        BigEndian::write_u32(&mut buf[DISK_TYPE_OFFSET..], self.disk_type.raw());
        BigEndian::write_u32(&mut buf[CHECKSUM_OFFSET..], self.checksum);
        buf[UNIQUE_ID_OFFSET..UNIQUE_ID_OFFSET + 16].copy_from_slice(self.unique_id.as_bytes());
        buf[SAVED_STATE_OFFSET] = self.saved_state;
        let reserved = std::cmp::min(self.reserved.len(), FOOTER_SIZE - RESERVED_OFFSET);
        buf[RESERVED_OFFSET..RESERVED_OFFSET + reserved].copy_from_slice(&self.reserved[..reserved]);
        buf
    }

    /// Checksum of the current field values.
    pub fn computed_checksum(&self) -> u32 {
        checksum(&self.encode(), CHECKSUM_OFFSET)
    }

    pub fn refresh_checksum(&mut self) {
        self.checksum = self.computed_checksum();
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn disk_type(&self) -> DiskType {
        self.disk_type
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn saved_state(&self) -> bool {
        self.saved_state != 0
    }

    /// Updates the size dependent fields. The checksum is left stale.
    pub(crate) fn set_current_size(&mut self, size: u64, geometry: Geometry) {
        self.current_size = size;
        self.geometry = geometry;
    }

    pub(crate) fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = geometry;
    }

    pub(crate) fn set_unique_id(&mut self, unique_id: Uuid) {
        self.unique_id = unique_id;
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn valid_footer_bytes() -> Vec<u8> {
        let mut buf = vec![
            0x63, 0x6f, 0x6e, 0x65, 0x63, 0x74, 0x69, 0x78, // cookie "conectix"
            0x00, 0x00, 0x00, 0x02, // features
            0x00, 0x01, 0x00, 0x00, // version
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, // data offset
            0x2c, 0x5d, 0x3e, 0x10, // timestamp
            0x76, 0x62, 0x6f, 0x78, // creator application "vbox"
            0x00, 0x06, 0x00, 0x01, // creator version
            0x57, 0x69, 0x32, 0x6b, // creator host os "Wi2k"
            0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, // original size
            0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, // current size
            0x03, 0xc3, // cylinders
            0x08, // heads
            0x11, // sectors per track
            0x00, 0x00, 0x00, 0x03, // disk type
            0x00, 0x00, 0x00, 0x00, // checksum, filled in below
            0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x47, 0x18, // unique id
            0x89, 0x9a, 0xab, 0xbc, 0xcd, 0xde, 0xef, 0xf0, //
            0x00, // saved state
        ];
        buf.resize(FOOTER_SIZE, 0);
        let sum = checksum(&buf, CHECKSUM_OFFSET);
        BigEndian::write_u32(&mut buf[CHECKSUM_OFFSET..], sum);
        buf
    }

    #[test]
    fn parse_valid_footer() {
        let buf = valid_footer_bytes();
        let footer = VhdFooter::parse(&buf).unwrap();
        assert_eq!(footer.disk_type(), DiskType::Dynamic);
        assert_eq!(footer.data_offset(), 512);
        assert_eq!(footer.current_size(), 64 << 20);
        assert_eq!(
            footer.geometry(),
            Geometry {
                cylinders: 963,
                heads: 8,
                sectors: 17
            }
        );
        assert!(!footer.saved_state());
    }

    #[test]
    fn reencode_preserves_bytes() {
        let mut buf = valid_footer_bytes();
        // Unknown data in the reserved area must survive.
        buf[300] = 0x5a;
        let sum = checksum(&buf, CHECKSUM_OFFSET);
        BigEndian::write_u32(&mut buf[CHECKSUM_OFFSET..], sum);

        let footer = VhdFooter::parse(&buf).unwrap();
        assert_eq!(footer.encode().to_vec(), buf);
    }

    #[test]
    fn reject_bad_cookie() {
        let mut buf = valid_footer_bytes();
        buf[0] = b'x';
        assert!(matches!(
            VhdFooter::parse(&buf),
            Err(VhdFooterError::InvalidCookie)
        ));
    }

    #[test]
    fn reject_bad_checksum() {
        let mut buf = valid_footer_bytes();
        buf[CURRENT_SIZE_OFFSET + 3] ^= 0x01;
        assert!(matches!(
            VhdFooter::parse(&buf),
            Err(VhdFooterError::ChecksumMismatch { .. })
        ));
        // Decoding alone does not look at the checksum.
        assert!(VhdFooter::decode(&buf).is_ok());
    }

    #[test]
    fn reject_unknown_disk_type_and_version() {
        let mut buf = valid_footer_bytes();
        BigEndian::write_u32(&mut buf[DISK_TYPE_OFFSET..], 7);
        assert!(matches!(
            VhdFooter::decode(&buf),
            Err(VhdFooterError::UnsupportedDiskType(7))
        ));

        let mut buf = valid_footer_bytes();
        BigEndian::write_u32(&mut buf[VERSION_OFFSET..], 0x0002_0000);
        assert!(matches!(
            VhdFooter::decode(&buf),
            Err(VhdFooterError::UnsupportedVersion(0x0002_0000))
        ));
    }

    #[test]
    fn reject_truncated() {
        let buf = valid_footer_bytes();
        assert!(matches!(
            VhdFooter::parse(&buf[..100]),
            Err(VhdFooterError::Truncated(100))
        ));
    }

    #[test]
    fn new_footer_is_sealed() {
        let id = Uuid::new_v4();
        let footer = VhdFooter::new(DiskType::Fixed, 10 << 20, id, 1234);
        let buf = footer.encode();
        let parsed = VhdFooter::parse(&buf).unwrap();
        assert_eq!(parsed.unique_id(), id);
        assert_eq!(parsed.data_offset(), FOOTER_DATA_OFFSET_NONE);
        assert_eq!(parsed.original_size(), 10 << 20);
        assert_eq!(parsed, footer);
    }

    #[test]
    fn geometry_ladder() {
        assert_eq!(
            Geometry::from_size(64 << 20),
            Geometry {
                cylinders: 963,
                heads: 8,
                sectors: 17
            }
        );
        // Needs more than 16 heads at 17 sectors per track.
        assert_eq!(Geometry::from_size(1 << 30).sectors, 63);
        // Capped at the largest CHS disk.
        assert_eq!(
            Geometry::from_size(2 << 40),
            Geometry {
                cylinders: 65535,
                heads: 16,
                sectors: 255
            }
        );
    }

    #[test]
    fn timestamp_epoch() {
        let t = system_time(0);
        assert_eq!(vhd_timestamp(t), 0);
        assert_eq!(
            t.duration_since(UNIX_EPOCH).unwrap().as_secs(),
            VHD_EPOCH_OFFSET
        );
        assert_eq!(vhd_timestamp(UNIX_EPOCH), 0);
    }
}
