// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::vhd_footer::checksum;
use crate::{SECTOR_SIZE, VHD_MAX_SECTORS};

pub const DYNAMIC_HEADER_SIZE: usize = 1024;
pub const DYNAMIC_HEADER_COOKIE: &[u8; 8] = b"cxsparse";
pub const DYNAMIC_HEADER_VERSION: u32 = 0x0001_0000;
pub const MAX_PARENT_LOCATORS: usize = 8;
// Code units available for the parent name, keeping one for the terminator.
pub const PARENT_NAME_MAX_UNITS: usize = 255;

// Parent locator platform codes
pub const PLATFORM_CODE_NONE: u32 = 0;
pub const PLATFORM_CODE_WI2R: u32 = 0x5769_3272;
pub const PLATFORM_CODE_WI2K: u32 = 0x5769_326B;
pub const PLATFORM_CODE_W2RU: u32 = 0x5732_7275;
pub const PLATFORM_CODE_W2KU: u32 = 0x5732_6B75;
pub const PLATFORM_CODE_MAC: u32 = 0x4D16_3220;
pub const PLATFORM_CODE_MACX: u32 = 0x4D16_3258;

// Data space reserved for each locator written at creation time.
pub const LOCATOR_DATA_SPACE: u32 = 512 * 2;

const DATA_OFFSET_OFFSET: usize = 8;
const TABLE_OFFSET_OFFSET: usize = 16;
const VERSION_OFFSET: usize = 24;
const MAX_TABLE_ENTRIES_OFFSET: usize = 28;
const BLOCK_SIZE_OFFSET: usize = 32;
const CHECKSUM_OFFSET: usize = 36;
const PARENT_UUID_OFFSET: usize = 40;
const PARENT_TIMESTAMP_OFFSET: usize = 56;
const RESERVED1_OFFSET: usize = 60;
const PARENT_NAME_OFFSET: usize = 64;
const PARENT_NAME_UNITS: usize = 256;
const LOCATORS_OFFSET: usize = 576;
const LOCATOR_SIZE: usize = 24;
const RESERVED2_OFFSET: usize = 768;

#[sorted]
#[derive(Error, Debug)]
pub enum VhdDynamicHeaderError {
    #[error("Dynamic header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Invalid block size {0}")]
    InvalidBlockSize(u32),
    #[error("Invalid dynamic header cookie")]
    InvalidCookie,
    #[error("Parent name is longer than {PARENT_NAME_MAX_UNITS} UTF-16 code units")]
    ParentNameTooLong,
    #[error("Too many block allocation table entries: {0}")]
    TooManyEntries(u32),
    #[error("Dynamic header is truncated to {0} bytes")]
    Truncated(usize),
    #[error("Unsupported dynamic header version {0:#x}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, VhdDynamicHeaderError>;

/// Sizes derived from the block size of a sparse image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u32,
    pub sectors_per_block: u32,
    pub bitmap_bytes: u32,
    pub bitmap_sectors: u32,
}

impl BlockLayout {
    pub fn new(block_size: u32) -> BlockLayout {
        let sectors_per_block = block_size / SECTOR_SIZE as u32;
        let bitmap_bytes = div_round_up!(sectors_per_block, 8);
        BlockLayout {
            block_size,
            sectors_per_block,
            bitmap_bytes,
            bitmap_sectors: div_round_up!(bitmap_bytes, SECTOR_SIZE as u32),
        }
    }

    /// Size of the on-disk bitmap region, rounded to whole sectors.
    pub fn bitmap_size(&self) -> u64 {
        self.bitmap_sectors as u64 * SECTOR_SIZE
    }

    /// Bytes one allocated block occupies in the file, bitmap included.
    pub fn stride(&self) -> u64 {
        self.bitmap_size() + self.block_size as u64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParentLocator {
    pub code: u32,
    pub data_space: u32,
    pub data_length: u32,
    pub reserved: u32,
    pub data_offset: u64,
}

impl ParentLocator {
    fn decode(buf: &[u8]) -> ParentLocator {
        ParentLocator {
            code: BigEndian::read_u32(&buf[0..]),
            data_space: BigEndian::read_u32(&buf[4..]),
            data_length: BigEndian::read_u32(&buf[8..]),
            reserved: BigEndian::read_u32(&buf[12..]),
            data_offset: BigEndian::read_u64(&buf[16..]),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..], self.code);
        BigEndian::write_u32(&mut buf[4..], self.data_space);
        BigEndian::write_u32(&mut buf[8..], self.data_length);
        BigEndian::write_u32(&mut buf[12..], self.reserved);
        BigEndian::write_u64(&mut buf[16..], self.data_offset);
    }

    pub fn is_empty(&self) -> bool {
        self.code == PLATFORM_CODE_NONE
    }
}

/// Encodes `path` the way the locator `code` stores it, or None for
/// platform codes this crate does not write.
pub fn encode_locator_path(code: u32, path: &str) -> Option<Vec<u8>> {
    match code {
        PLATFORM_CODE_W2KU | PLATFORM_CODE_W2RU => {
            let mut data = Vec::with_capacity(path.len() * 2);
            for unit in path.encode_utf16() {
                let mut le = [0u8; 2];
                LittleEndian::write_u16(&mut le, unit);
                data.extend_from_slice(&le);
            }
            Some(data)
        }
        PLATFORM_CODE_WI2K | PLATFORM_CODE_WI2R => Some(path.as_bytes().to_vec()),
        _ => None,
    }
}

pub fn decode_locator_path(code: u32, data: &[u8]) -> Option<String> {
    match code {
        PLATFORM_CODE_W2KU | PLATFORM_CODE_W2RU => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(LittleEndian::read_u16)
                .take_while(|u| *u != 0)
                .collect();
            Some(String::from_utf16_lossy(&units))
        }
        PLATFORM_CODE_WI2K | PLATFORM_CODE_WI2R | PLATFORM_CODE_MACX => {
            let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
            Some(String::from_utf8_lossy(&data[..end]).into_owned())
        }
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicHeader {
    data_offset: u64,
    table_offset: u64,
    version: u32,
    max_table_entries: u32,
    block_size: u32,
    checksum: u32,
    parent_uuid: Uuid,
    parent_timestamp: u32,
    reserved1: u32,
    parent_name: [u16; PARENT_NAME_UNITS],
    locators: [ParentLocator; MAX_PARENT_LOCATORS],
    reserved2: Vec<u8>,
}

impl DynamicHeader {
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> DynamicHeader {
        let mut header = DynamicHeader {
            data_offset: u64::MAX,
            table_offset,
            version: DYNAMIC_HEADER_VERSION,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_uuid: Uuid::nil(),
            parent_timestamp: 0,
            reserved1: 0,
            parent_name: [0; PARENT_NAME_UNITS],
            locators: [ParentLocator::default(); MAX_PARENT_LOCATORS],
            reserved2: vec![0; DYNAMIC_HEADER_SIZE - RESERVED2_OFFSET],
        };
        header.refresh_checksum();
        header
    }

    /// Decodes and validates the structure, except for the checksum.
    pub fn decode(buf: &[u8]) -> Result<DynamicHeader> {
        if buf.len() < DYNAMIC_HEADER_SIZE {
            return Err(VhdDynamicHeaderError::Truncated(buf.len()));
        }
        if &buf[..DYNAMIC_HEADER_COOKIE.len()] != DYNAMIC_HEADER_COOKIE {
            return Err(VhdDynamicHeaderError::InvalidCookie);
        }

        let version = BigEndian::read_u32(&buf[VERSION_OFFSET..]);
        if version >> 16 != DYNAMIC_HEADER_VERSION >> 16 {
            return Err(VhdDynamicHeaderError::UnsupportedVersion(version));
        }

        let block_size = BigEndian::read_u32(&buf[BLOCK_SIZE_OFFSET..]);
        if !block_size.is_power_of_two() || (block_size as u64) < SECTOR_SIZE {
            return Err(VhdDynamicHeaderError::InvalidBlockSize(block_size));
        }

        // A few sectors are always taken by the footers and headers.
        let max_table_entries = BigEndian::read_u32(&buf[MAX_TABLE_ENTRIES_OFFSET..]);
        if max_table_entries as u64 > VHD_MAX_SECTORS - 2 {
            return Err(VhdDynamicHeaderError::TooManyEntries(max_table_entries));
        }

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&buf[PARENT_UUID_OFFSET..PARENT_UUID_OFFSET + 16]);

        let mut parent_name = [0u16; PARENT_NAME_UNITS];
        BigEndian::read_u16_into(
            &buf[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_UNITS * 2],
            &mut parent_name,
        );

        let mut locators = [ParentLocator::default(); MAX_PARENT_LOCATORS];
        for (i, locator) in locators.iter_mut().enumerate() {
            let start = LOCATORS_OFFSET + i * LOCATOR_SIZE;
            *locator = ParentLocator::decode(&buf[start..start + LOCATOR_SIZE]);
        }

        Ok(DynamicHeader {
            data_offset: BigEndian::read_u64(&buf[DATA_OFFSET_OFFSET..]),
            table_offset: BigEndian::read_u64(&buf[TABLE_OFFSET_OFFSET..]),
            version,
            max_table_entries,
            block_size,
            checksum: BigEndian::read_u32(&buf[CHECKSUM_OFFSET..]),
            parent_uuid: Uuid::from_bytes(parent_uuid),
            parent_timestamp: BigEndian::read_u32(&buf[PARENT_TIMESTAMP_OFFSET..]),
            reserved1: BigEndian::read_u32(&buf[RESERVED1_OFFSET..]),
            parent_name,
            locators,
            reserved2: buf[RESERVED2_OFFSET..DYNAMIC_HEADER_SIZE].to_vec(),
        })
    }

    pub fn parse(buf: &[u8]) -> Result<DynamicHeader> {
        let header = DynamicHeader::decode(buf)?;
        let computed = checksum(&buf[..DYNAMIC_HEADER_SIZE], CHECKSUM_OFFSET);
        if computed != header.checksum {
            return Err(VhdDynamicHeaderError::ChecksumMismatch {
                stored: header.checksum,
                computed,
            });
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; DYNAMIC_HEADER_SIZE] {
        let mut buf = [0u8; DYNAMIC_HEADER_SIZE];
        buf[..DYNAMIC_HEADER_COOKIE.len()].copy_from_slice(DYNAMIC_HEADER_COOKIE);
        BigEndian::write_u64(&mut buf[DATA_OFFSET_OFFSET..], self.data_offset);
        BigEndian::write_u64(&mut buf[TABLE_OFFSET_OFFSET..], self.table_offset);
        BigEndian::write_u32(&mut buf[VERSION_OFFSET..], self.version);
        BigEndian::write_u32(&mut buf[MAX_TABLE_ENTRIES_OFFSET..], self.max_table_entries);
        BigEndian::write_u32(&mut buf[BLOCK_SIZE_OFFSET..], self.block_size);
        BigEndian::write_u32(&mut buf[CHECKSUM_OFFSET..], self.checksum);
        buf[PARENT_UUID_OFFSET..PARENT_UUID_OFFSET + 16]
            .copy_from_slice(self.parent_uuid.as_bytes());
        BigEndian::write_u32(&mut buf[PARENT_TIMESTAMP_OFFSET..], self.parent_timestamp);
        BigEndian::write_u32(&mut buf[RESERVED1_OFFSET..], self.reserved1);
        BigEndian::write_u16_into(
            &self.parent_name,
            &mut buf[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_UNITS * 2],
        );
        for (i, locator) in self.locators.iter().enumerate() {
            let start = LOCATORS_OFFSET + i * LOCATOR_SIZE;
            locator.encode(&mut buf[start..start + LOCATOR_SIZE]);
        }
        let reserved = std::cmp::min(self.reserved2.len(), DYNAMIC_HEADER_SIZE - RESERVED2_OFFSET);
        buf[RESERVED2_OFFSET..RESERVED2_OFFSET + reserved]
            .copy_from_slice(&self.reserved2[..reserved]);
        buf
    }

    pub fn computed_checksum(&self) -> u32 {
        checksum(&self.encode(), CHECKSUM_OFFSET)
    }

    pub fn refresh_checksum(&mut self) {
        self.checksum = self.computed_checksum();
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.block_size)
    }

    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    pub fn max_table_entries(&self) -> u32 {
        self.max_table_entries
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn parent_uuid(&self) -> Uuid {
        self.parent_uuid
    }

    pub fn parent_timestamp(&self) -> u32 {
        self.parent_timestamp
    }

    pub fn parent_name(&self) -> String {
        let len = self
            .parent_name
            .iter()
            .position(|u| *u == 0)
            .unwrap_or(PARENT_NAME_UNITS);
        String::from_utf16_lossy(&self.parent_name[..len])
    }

    pub fn locators(&self) -> &[ParentLocator; MAX_PARENT_LOCATORS] {
        &self.locators
    }

    pub(crate) fn set_max_table_entries(&mut self, entries: u32) {
        self.max_table_entries = entries;
    }

    pub(crate) fn set_parent_uuid(&mut self, uuid: Uuid) {
        self.parent_uuid = uuid;
    }

    pub(crate) fn set_parent_timestamp(&mut self, timestamp: u32) {
        self.parent_timestamp = timestamp;
    }

    pub(crate) fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > PARENT_NAME_MAX_UNITS {
            return Err(VhdDynamicHeaderError::ParentNameTooLong);
        }
        self.parent_name = [0; PARENT_NAME_UNITS];
        self.parent_name[..units.len()].copy_from_slice(&units);
        Ok(())
    }

    pub(crate) fn locator_mut(&mut self, index: usize) -> &mut ParentLocator {
        &mut self.locators[index]
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn sealed(mut buf: Vec<u8>) -> Vec<u8> {
        let sum = checksum(&buf, CHECKSUM_OFFSET);
        BigEndian::write_u32(&mut buf[CHECKSUM_OFFSET..], sum);
        buf
    }

    fn header_bytes() -> Vec<u8> {
        let mut buf = vec![
            0x63, 0x78, 0x73, 0x70, 0x61, 0x72, 0x73, 0x65, // cookie "cxsparse"
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // data offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, // table offset
            0x00, 0x01, 0x00, 0x00, // version
            0x00, 0x00, 0x00, 0x20, // max table entries
            0x00, 0x20, 0x00, 0x00, // block size
            0x00, 0x00, 0x00, 0x00, // checksum
        ];
        buf.resize(DYNAMIC_HEADER_SIZE, 0);
        sealed(buf)
    }

    #[test]
    fn parse_header() {
        let header = DynamicHeader::parse(&header_bytes()).unwrap();
        assert_eq!(header.table_offset(), 1536);
        assert_eq!(header.max_table_entries(), 32);
        assert_eq!(header.block_size(), 2 << 20);
        assert!(header.parent_uuid().is_nil());
        assert!(header.locators().iter().all(|l| l.is_empty()));
        assert_eq!(header.encode().to_vec(), header_bytes());
    }

    #[test]
    fn layout_of_default_block() {
        let layout = BlockLayout::new(2 << 20);
        assert_eq!(layout.sectors_per_block, 4096);
        assert_eq!(layout.bitmap_bytes, 512);
        assert_eq!(layout.bitmap_sectors, 1);
        assert_eq!(layout.stride(), (2 << 20) + 512);

        // Small blocks still get a whole bitmap sector.
        let layout = BlockLayout::new(4096);
        assert_eq!(layout.bitmap_bytes, 1);
        assert_eq!(layout.bitmap_size(), 512);
    }

    #[test]
    fn reject_corruption() {
        let mut buf = header_bytes();
        buf[BLOCK_SIZE_OFFSET + 3] = 1;
        assert!(matches!(
            DynamicHeader::parse(&sealed(buf)),
            Err(VhdDynamicHeaderError::InvalidBlockSize(_))
        ));

        let mut buf = header_bytes();
        BigEndian::write_u32(&mut buf[MAX_TABLE_ENTRIES_OFFSET..], u32::MAX);
        assert!(matches!(
            DynamicHeader::parse(&sealed(buf)),
            Err(VhdDynamicHeaderError::TooManyEntries(_))
        ));

        let mut buf = header_bytes();
        buf[PARENT_TIMESTAMP_OFFSET] = 1;
        assert!(matches!(
            DynamicHeader::parse(&buf),
            Err(VhdDynamicHeaderError::ChecksumMismatch { .. })
        ));

        let mut buf = header_bytes();
        buf[1] = 0;
        assert!(matches!(
            DynamicHeader::parse(&buf),
            Err(VhdDynamicHeaderError::InvalidCookie)
        ));
    }

    #[test]
    fn parent_fields() {
        let mut header = DynamicHeader::new(1536, 8, 2 << 20);
        let parent = Uuid::new_v4();
        header.set_parent_uuid(parent);
        header.set_parent_timestamp(42);
        header.set_parent_name("base-image.vhd").unwrap();
        *header.locator_mut(0) = ParentLocator {
            code: PLATFORM_CODE_W2KU,
            data_space: LOCATOR_DATA_SPACE,
            data_length: 0,
            reserved: 0,
            data_offset: 2048,
        };
        header.refresh_checksum();

        let parsed = DynamicHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed.parent_uuid(), parent);
        assert_eq!(parsed.parent_timestamp(), 42);
        assert_eq!(parsed.parent_name(), "base-image.vhd");
        assert_eq!(parsed.locators()[0].data_offset, 2048);
        assert!(parsed.locators()[1].is_empty());

        assert!(matches!(
            header.set_parent_name(&"x".repeat(300)),
            Err(VhdDynamicHeaderError::ParentNameTooLong)
        ));
    }

    #[test]
    fn locator_paths() {
        let data = encode_locator_path(PLATFORM_CODE_W2KU, "/images/base.vhd").unwrap();
        assert_eq!(data.len(), 32);
        assert_eq!(&data[..4], &[b'/', 0, b'i', 0]);
        assert_eq!(
            decode_locator_path(PLATFORM_CODE_W2KU, &data).unwrap(),
            "/images/base.vhd"
        );
        let data = encode_locator_path(PLATFORM_CODE_WI2R, "base.vhd").unwrap();
        assert_eq!(decode_locator_path(PLATFORM_CODE_WI2R, &data).unwrap(), "base.vhd");
        assert!(encode_locator_path(PLATFORM_CODE_MAC, "base.vhd").is_none());
    }
}
