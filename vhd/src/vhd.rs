// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AllocationMode, ImageConfig};
use crate::raw_sync::RawFileSync;
use crate::vec_cache::CacheMap;
use crate::vhd_bat::{self, BatEntry, VhdBatError};
use crate::vhd_bitmap::SectorBitmap;
use crate::vhd_dynamic_header::{
    decode_locator_path, encode_locator_path, BlockLayout, DynamicHeader, ParentLocator,
    VhdDynamicHeaderError, DYNAMIC_HEADER_SIZE, LOCATOR_DATA_SPACE, PLATFORM_CODE_W2KU,
    PLATFORM_CODE_W2RU, PLATFORM_CODE_WI2K, PLATFORM_CODE_WI2R,
};
use crate::vhd_expansion::{ExpansionSlot, PreparedWrite};
use crate::vhd_footer::{vhd_timestamp, DiskType, Geometry, VhdFooter, VhdFooterError, FOOTER_SIZE};
use crate::vhd_io::BlockAddress;
use crate::{align_up, DEFAULT_BLOCK_SIZE, SECTOR_SIZE, VHD_MAX_SIZE};

#[sorted]
#[derive(Error, Debug)]
pub enum VhdError {
    #[error("A block allocation is already in flight")]
    AllocationInProgress,
    #[error("Block allocation table I/O failed: {0}")]
    Bat(#[source] VhdBatError),
    #[error("Corrupt image: {0}")]
    CorruptImage(String),
    #[error("Failed to create image: {0}")]
    CreateImage(#[source] io::Error),
    #[error("Block allocation failed and was rolled back: {0}")]
    ExpansionFailed(#[source] io::Error),
    #[error("Image is damaged and needs to be repaired")]
    ImageDamaged,
    #[error("Invalid dynamic header: {0}")]
    InvalidDynamicHeader(#[source] VhdDynamicHeaderError),
    #[error("Invalid footer: {0}")]
    InvalidFooter(#[source] VhdFooterError),
    #[error("Invalid disk geometry {0:?}")]
    InvalidGeometry(Geometry),
    #[error("Request of {len} bytes at offset {offset:#x} is beyond the end of the disk")]
    OutOfRange { offset: u64, len: usize },
    #[error("Parent path does not fit the image metadata: {0}")]
    ParentNameTooLong(String),
    #[error("Failed to read sector bitmap: {0}")]
    ReadBitmap(#[source] io::Error),
    #[error("Failed to read data: {0}")]
    ReadData(#[source] io::Error),
    #[error("Failed to read footer: {0}")]
    ReadFooter(#[source] io::Error),
    #[error("Failed to read dynamic header: {0}")]
    ReadHeader(#[source] io::Error),
    #[error("Image is opened read-only")]
    ReadOnly,
    #[error("Failed to reopen image for writing: {0}")]
    Reopen(#[source] io::Error),
    #[error("Image cannot be repaired: {0}")]
    RepairImpossible(String),
    #[error("Failed to change the image file size: {0}")]
    SetFileSize(#[source] io::Error),
    #[error("Shrinking from {current} to {requested} bytes is not supported")]
    Shrink { current: u64, requested: u64 },
    #[error("Failed to sync image file: {0}")]
    Sync(#[source] io::Error),
    #[error("Size {0} exceeds the largest supported disk")]
    TooLarge(u64),
    #[error("Request of {len} bytes at offset {offset:#x} is not sector aligned")]
    Unaligned { offset: u64, len: usize },
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(&'static str),
    #[error("Failed to write sector bitmap: {0}")]
    WriteBitmap(#[source] io::Error),
    #[error("Failed to write data: {0}")]
    WriteData(#[source] io::Error),
    #[error("Failed to write footer: {0}")]
    WriteFooter(#[source] io::Error),
    #[error("Failed to write dynamic header: {0}")]
    WriteHeader(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VhdError>;

/// Coarse classification of [`VhdError`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// A metadata structure failed validation while parsing.
    InvalidHeader,
    /// Metadata parsed fine but references something impossible.
    CorruptImage,
    /// The file layer reported an error.
    Io,
    /// A rollback could not restore the image, it needs a repair.
    Unrecoverable,
    /// The caller asked for something the image cannot do in its state.
    InvalidRequest,
    Unsupported,
}

impl VhdError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VhdError::InvalidFooter(VhdFooterError::UnsupportedDiskType(_)) => {
                ErrorClass::Unsupported
            }
            VhdError::InvalidDynamicHeader(_) | VhdError::InvalidFooter(_) => {
                ErrorClass::InvalidHeader
            }
            VhdError::CorruptImage(_) | VhdError::RepairImpossible(_) => ErrorClass::CorruptImage,
            VhdError::ImageDamaged => ErrorClass::Unrecoverable,
            VhdError::AllocationInProgress
            | VhdError::InvalidGeometry(_)
            | VhdError::OutOfRange { .. }
            | VhdError::ParentNameTooLong(_)
            | VhdError::ReadOnly
            | VhdError::Shrink { .. }
            | VhdError::TooLarge(_)
            | VhdError::Unaligned { .. } => ErrorClass::InvalidRequest,
            VhdError::Unsupported(_) | VhdError::UnsupportedConfiguration(_) => {
                ErrorClass::Unsupported
            }
            VhdError::Bat(_)
            | VhdError::CreateImage(_)
            | VhdError::ExpansionFailed(_)
            | VhdError::ReadBitmap(_)
            | VhdError::ReadData(_)
            | VhdError::ReadFooter(_)
            | VhdError::ReadHeader(_)
            | VhdError::Reopen(_)
            | VhdError::SetFileSize(_)
            | VhdError::Sync(_)
            | VhdError::WriteBitmap(_)
            | VhdError::WriteData(_)
            | VhdError::WriteFooter(_)
            | VhdError::WriteHeader(_) => ErrorClass::Io,
        }
    }
}

/// Outcome of a single read or write request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    /// `len` bytes were transferred.
    Done(usize),
    /// The first `len` bytes of the request have no data in this image. The
    /// caller supplies zeroes or reads them from the parent image. A refused
    /// partial write also reports how many bytes before and after it are
    /// needed to write the whole block instead.
    BlockNotAllocated {
        len: usize,
        pre_read: usize,
        post_read: usize,
    },
}

impl IoStatus {
    pub(crate) fn not_allocated(len: usize) -> IoStatus {
        IoStatus::BlockNotAllocated {
            len,
            pre_read: 0,
            post_read: 0,
        }
    }

    /// Number of bytes of the request this status covers.
    pub fn len(&self) -> usize {
        match self {
            IoStatus::Done(len) | IoStatus::BlockNotAllocated { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity of the parent of a differencing image.
#[derive(Clone, Debug)]
pub struct ParentInfo {
    pub uuid: Uuid,
    pub timestamp: u32,
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub disk_type: DiskType,
    pub size: u64,
    pub block_size: u32,
    pub uuid: Option<Uuid>,
    pub parent: Option<ParentInfo>,
}

impl CreateOptions {
    pub fn new(disk_type: DiskType, size: u64) -> CreateOptions {
        CreateOptions {
            disk_type,
            size,
            block_size: DEFAULT_BLOCK_SIZE,
            uuid: None,
            parent: None,
        }
    }
}

/// Metadata only sparse images carry.
pub(crate) struct SparseMetadata {
    pub header: DynamicHeader,
    pub layout: BlockLayout,
}

/// An opened VHD image.
///
/// Reads and in-place writes only need `&self` and may run concurrently.
/// Block allocations are serialized by a single permit. Operations that
/// restructure the file take `&mut self`.
pub struct Vhd {
    pub(crate) file: File,
    path: Option<PathBuf>,
    pub(crate) config: ImageConfig,
    pub(crate) footer: VhdFooter,
    logical_geometry: Option<Geometry>,
    pub(crate) sparse: Option<SparseMetadata>,
    header_dirty: AtomicBool,
    pending_locators: Mutex<Vec<(u64, Vec<u8>)>>,
    pub(crate) bat: RwLock<Vec<BatEntry>>,
    pub(crate) eof: AtomicU64,
    pub(crate) permit: Mutex<ExpansionSlot>,
    pub(crate) expansion_sequence: AtomicU64,
    pub(crate) bitmaps: Mutex<CacheMap<SectorBitmap>>,
    pub(crate) damaged: AtomicBool,
    pub(crate) sync_io: Mutex<RawFileSync>,
    current_offset: u64,
}

impl fmt::Debug for Vhd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Vhd")
            .field("path", &self.path)
            .field("disk_type", &self.disk_type())
            .field("size", &self.size())
            .field("eof", &self.eof())
            .finish_non_exhaustive()
    }
}

fn file_is_writable(file: &File) -> io::Result<bool> {
    // SAFETY: FFI call with a valid file descriptor
    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_ACCMODE != libc::O_RDONLY)
}

fn read_footer_at(file: &File, offset: u64) -> Result<[u8; FOOTER_SIZE]> {
    let mut buf = [0u8; FOOTER_SIZE];
    file.read_exact_at(&mut buf, offset)
        .map_err(VhdError::ReadFooter)?;
    Ok(buf)
}

/// Path of `target` relative to the directory `base`.
fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

impl Vhd {
    /// Opens an image from an already opened file.
    pub fn new(file: File, config: ImageConfig) -> Result<Vhd> {
        let file_size = file.metadata().map_err(VhdError::ReadFooter)?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(VhdError::InvalidFooter(VhdFooterError::Truncated(
                file_size as usize,
            )));
        }
        let eof = file_size - FOOTER_SIZE as u64;

        let footer = match VhdFooter::parse(&read_footer_at(&file, eof)?) {
            Ok(footer) => footer,
            Err(e) => {
                let backup = VhdFooter::parse(&read_footer_at(&file, 0)?);
                if matches!(&backup, Ok(b) if b.disk_type().is_sparse()) {
                    return Err(VhdError::CorruptImage(format!(
                        "trailing footer is invalid ({e}) but its backup is intact, repair the image"
                    )));
                }
                return Err(VhdError::InvalidFooter(e));
            }
        };

        let (sparse, bat) = if footer.disk_type().is_sparse() {
            let (metadata, bat) = Vhd::load_sparse(&file, &footer, file_size)?;
            (Some(metadata), bat)
        } else {
            if footer.current_size() > eof {
                return Err(VhdError::CorruptImage(format!(
                    "fixed image of {} bytes stored in {} bytes",
                    footer.current_size(),
                    eof
                )));
            }
            (None, Vec::new())
        };

        Vhd::assemble(file, config, footer, sparse, bat, eof)
    }

    /// Opens the image at `path`, read-only if `config` says so.
    pub fn open<P: AsRef<Path>>(path: P, config: ImageConfig) -> Result<Vhd> {
        let file = OpenOptions::new()
            .read(true)
            .write(!config.readonly)
            .open(path.as_ref())
            .map_err(VhdError::ReadFooter)?;
        let mut vhd = Vhd::new(file, config)?;
        vhd.path = Some(path.as_ref().to_path_buf());
        Ok(vhd)
    }

    fn load_sparse(
        file: &File,
        footer: &VhdFooter,
        file_size: u64,
    ) -> Result<(SparseMetadata, Vec<BatEntry>)> {
        let header_offset = footer.data_offset();
        if header_offset.saturating_add(DYNAMIC_HEADER_SIZE as u64) > file_size {
            return Err(VhdError::CorruptImage(format!(
                "dynamic header offset {header_offset:#x} is outside the file"
            )));
        }
        let mut buf = [0u8; DYNAMIC_HEADER_SIZE];
        file.read_exact_at(&mut buf, header_offset)
            .map_err(VhdError::ReadHeader)?;
        let header = DynamicHeader::parse(&buf).map_err(VhdError::InvalidDynamicHeader)?;

        let table_end = header
            .table_offset()
            .saturating_add(vhd_bat::table_size(header.max_table_entries()));
        if table_end > file_size {
            return Err(VhdError::CorruptImage(format!(
                "block allocation table ends at {table_end:#x}, past the end of the file"
            )));
        }
        let bat = vhd_bat::load_bat(file, header.table_offset(), header.max_table_entries())
            .map_err(VhdError::Bat)?;

        let layout = header.layout();
        Ok((SparseMetadata { header, layout }, bat))
    }

    fn assemble(
        file: File,
        config: ImageConfig,
        footer: VhdFooter,
        sparse: Option<SparseMetadata>,
        bat: Vec<BatEntry>,
        eof: u64,
    ) -> Result<Vhd> {
        let sync_io = RawFileSync::new(file.as_raw_fd()).map_err(VhdError::CreateImage)?;
        let bitmaps = CacheMap::new(config.bitmap_cache_size);
        Ok(Vhd {
            file,
            path: None,
            config,
            footer,
            logical_geometry: None,
            sparse,
            header_dirty: AtomicBool::new(false),
            pending_locators: Mutex::new(Vec::new()),
            bat: RwLock::new(bat),
            eof: AtomicU64::new(eof),
            permit: Mutex::new(None),
            expansion_sequence: AtomicU64::new(0),
            bitmaps: Mutex::new(bitmaps),
            damaged: AtomicBool::new(false),
            sync_io: Mutex::new(sync_io),
            current_offset: 0,
        })
    }

    /// Returns true if `file` carries a footer cookie at its end or, for
    /// sparse images, at its start.
    pub fn probe(file: &File) -> Result<bool> {
        let file_size = file.metadata().map_err(VhdError::ReadFooter)?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Ok(false);
        }
        let trailing = read_footer_at(file, file_size - FOOTER_SIZE as u64)?;
        let backup = read_footer_at(file, 0)?;
        Ok(VhdFooter::has_cookie(&trailing) || VhdFooter::has_cookie(&backup))
    }

    /// Creates a new image in `file`, which is expected to be empty.
    pub fn create(file: File, options: &CreateOptions) -> Result<Vhd> {
        Vhd::create_image(file, None, options)
    }

    /// Creates a new image file at `path`.
    pub fn create_path<P: AsRef<Path>>(path: P, options: &CreateOptions) -> Result<Vhd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())
            .map_err(VhdError::CreateImage)?;
        Vhd::create_image(file, Some(path.as_ref().to_path_buf()), options)
    }

    fn create_image(file: File, path: Option<PathBuf>, options: &CreateOptions) -> Result<Vhd> {
        let size = align_up(options.size, SECTOR_SIZE);
        if size > VHD_MAX_SIZE {
            return Err(VhdError::TooLarge(size));
        }
        let block_size = options.block_size;
        if !block_size.is_power_of_two() || (block_size as u64) < SECTOR_SIZE {
            return Err(VhdError::UnsupportedConfiguration(
                "block size must be a power of two of at least one sector",
            ));
        }
        match (options.disk_type, &options.parent) {
            (DiskType::Differencing, None) => {
                return Err(VhdError::UnsupportedConfiguration(
                    "a differencing image needs a parent",
                ))
            }
            (DiskType::Fixed | DiskType::Dynamic, Some(_)) => {
                return Err(VhdError::UnsupportedConfiguration(
                    "only differencing images have a parent",
                ))
            }
            _ => (),
        }

        let uuid = options.uuid.unwrap_or_else(Uuid::new_v4);
        let footer = VhdFooter::new(
            options.disk_type,
            size,
            uuid,
            vhd_timestamp(SystemTime::now()),
        );

        if options.disk_type == DiskType::Fixed {
            file.set_len(size + FOOTER_SIZE as u64)
                .map_err(VhdError::CreateImage)?;
            file.write_all_at(&footer.encode(), size)
                .map_err(VhdError::CreateImage)?;
            info!("Created fixed image of {} bytes", size);
            let mut vhd = Vhd::assemble(file, ImageConfig::default(), footer, None, Vec::new(), size)?;
            vhd.path = path;
            return Ok(vhd);
        }

        let entries = div_round_up!(size, block_size as u64) as u32;
        let table_offset = (FOOTER_SIZE + DYNAMIC_HEADER_SIZE) as u64;
        let mut eof = table_offset + vhd_bat::table_size(entries);
        let mut header = DynamicHeader::new(table_offset, entries, block_size);

        if let Some(parent) = &options.parent {
            header.set_parent_uuid(parent.uuid);
            header.set_parent_timestamp(parent.timestamp);
            for (index, code) in [PLATFORM_CODE_W2KU, PLATFORM_CODE_W2RU]
                .into_iter()
                .enumerate()
            {
                *header.locator_mut(index) = ParentLocator {
                    code,
                    data_space: LOCATOR_DATA_SPACE,
                    data_length: 0,
                    reserved: 0,
                    data_offset: eof,
                };
                eof += LOCATOR_DATA_SPACE as u64;
            }
        }
        header.refresh_checksum();

        // Zero filled metadata area, the table starts out unallocated.
        file.set_len(eof + FOOTER_SIZE as u64)
            .map_err(VhdError::CreateImage)?;
        let bat = vec![BatEntry::Unallocated; entries as usize];
        vhd_bat::save_bat(&file, table_offset, &bat).map_err(VhdError::Bat)?;
        file.write_all_at(&header.encode(), FOOTER_SIZE as u64)
            .map_err(VhdError::CreateImage)?;
        file.write_all_at(&footer.encode(), 0)
            .map_err(VhdError::CreateImage)?;
        file.write_all_at(&footer.encode(), eof)
            .map_err(VhdError::CreateImage)?;

        let layout = header.layout();
        let mut vhd = Vhd::assemble(
            file,
            ImageConfig::default(),
            footer,
            Some(SparseMetadata { header, layout }),
            bat,
            eof,
        )?;
        vhd.path = path;

        if let Some(parent) = &options.parent {
            vhd.set_parent_filename(&parent.path)?;
            vhd.flush()?;
        }

        info!(
            "Created {} image of {} bytes with {} blocks of {} bytes",
            options.disk_type, size, entries, block_size
        );
        Ok(vhd)
    }

    pub fn size(&self) -> u64 {
        self.footer.current_size()
    }

    pub fn geometry(&self) -> Geometry {
        self.footer.geometry()
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type()
    }

    pub fn uuid(&self) -> Uuid {
        self.footer.unique_id()
    }

    pub fn timestamp(&self) -> u32 {
        self.footer.timestamp()
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn block_size(&self) -> Option<u32> {
        self.sparse.as_ref().map(|s| s.layout.block_size)
    }

    pub fn parent_uuid(&self) -> Option<Uuid> {
        self.sparse.as_ref().map(|s| s.header.parent_uuid())
    }

    pub fn parent_timestamp(&self) -> Option<u32> {
        self.sparse.as_ref().map(|s| s.header.parent_timestamp())
    }

    /// File name of the parent recorded in the dynamic header.
    pub fn parent_filename(&self) -> Option<String> {
        if self.disk_type() != DiskType::Differencing {
            return None;
        }
        self.sparse.as_ref().map(|s| s.header.parent_name())
    }

    /// Decodes the paths stored by the parent locators.
    pub fn parent_locator_paths(&self) -> Result<Vec<String>> {
        let sparse = match &self.sparse {
            Some(sparse) => sparse,
            None => return Ok(Vec::new()),
        };
        let mut paths = Vec::new();
        for locator in sparse.header.locators().iter().filter(|l| !l.is_empty()) {
            let mut data = vec![0u8; locator.data_length as usize];
            self.file
                .read_exact_at(&mut data, locator.data_offset)
                .map_err(VhdError::ReadHeader)?;
            if let Some(path) = decode_locator_path(locator.code, &data) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Offset right behind the last block, where the trailing footer lives.
    pub fn eof(&self) -> u64 {
        self.eof.load(Ordering::SeqCst)
    }

    /// Size of the image file, trailing footer included.
    pub fn file_size(&self) -> u64 {
        self.eof() + FOOTER_SIZE as u64
    }

    pub fn is_readonly(&self) -> bool {
        self.config.readonly
    }

    pub fn allocated_blocks(&self) -> usize {
        self.bat
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.is_allocated())
            .count()
    }

    /// True once a rollback failed to restore the image.
    pub fn is_damaged(&self) -> bool {
        self.damaged.load(Ordering::SeqCst)
    }

    pub(crate) fn layout(&self) -> Result<BlockLayout> {
        self.sparse
            .as_ref()
            .map(|s| s.layout)
            .ok_or(VhdError::Unsupported("fixed images have no blocks"))
    }

    pub(crate) fn table_offset(&self) -> Result<u64> {
        self.sparse
            .as_ref()
            .map(|s| s.header.table_offset())
            .ok_or(VhdError::Unsupported("fixed images have no allocation table"))
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.config.readonly {
            return Err(VhdError::ReadOnly);
        }
        if self.is_damaged() {
            return Err(VhdError::ImageDamaged);
        }
        Ok(())
    }

    fn sparse_mut(&mut self) -> Result<&mut SparseMetadata> {
        self.sparse
            .as_mut()
            .ok_or(VhdError::Unsupported("fixed images have no dynamic header"))
    }

    /// Reads at most `buf.len()` bytes at `offset`. The request is clipped
    /// to the containing block, callers loop for larger reads.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<IoStatus> {
        self.check_request(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(IoStatus::Done(0));
        }
        if self.sparse.is_none() {
            self.file
                .read_exact_at(buf, offset)
                .map_err(VhdError::ReadData)?;
            return Ok(IoStatus::Done(buf.len()));
        }
        self.read_sparse(offset, buf)
    }

    /// Writes at most `data.len()` bytes at `offset`, allocating with the
    /// configured allocation mode.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<IoStatus> {
        self.write_with_mode(offset, data, self.config.allocation)
    }

    pub fn write_with_mode(
        &self,
        offset: u64,
        data: &[u8],
        mode: AllocationMode,
    ) -> Result<IoStatus> {
        match self.prepare_write(offset, data, mode)? {
            PreparedWrite::Done(status) => Ok(status),
            PreparedWrite::Allocate(addr, data) => {
                self.allocate_sync(addr, data).map(IoStatus::Done)
            }
        }
    }

    /// Handles every write that does not need a new block.
    pub(crate) fn prepare_write<'a>(
        &self,
        offset: u64,
        data: &'a [u8],
        mode: AllocationMode,
    ) -> Result<PreparedWrite<'a>> {
        self.check_writable()?;
        self.check_request(offset, data.len())?;
        if data.is_empty() {
            return Ok(PreparedWrite::Done(IoStatus::Done(0)));
        }

        let layout = match &self.sparse {
            Some(sparse) => sparse.layout,
            None => {
                self.file
                    .write_all_at(data, offset)
                    .map_err(VhdError::WriteData)?;
                return Ok(PreparedWrite::Done(IoStatus::Done(data.len())));
            }
        };

        let addr = BlockAddress::resolve(offset, &layout);
        let data = &data[..addr.clip(data.len(), &layout)];
        match self.block_entry(addr.block)?.file_offset() {
            Some(block_offset) => {
                let len = self.write_in_place(addr, block_offset, data)?;
                Ok(PreparedWrite::Done(IoStatus::Done(len)))
            }
            None if mode == AllocationMode::FullBlockOnly
                && data.len() != layout.block_size as usize =>
            {
                let (pre_read, post_read) = addr.padding(data.len(), &layout);
                Ok(PreparedWrite::Done(IoStatus::BlockNotAllocated {
                    len: data.len(),
                    pre_read,
                    post_read,
                }))
            }
            None => Ok(PreparedWrite::Allocate(addr, data)),
        }
    }

    /// Persists the allocation table, pending metadata and both footer
    /// copies, then syncs the file.
    pub fn flush(&self) -> Result<()> {
        if self.config.readonly {
            return Ok(());
        }
        let slot = self.permit.lock().unwrap();
        if slot.is_some() {
            return Err(VhdError::AllocationInProgress);
        }

        let footer = self.footer.encode();
        if let Some(sparse) = &self.sparse {
            self.flush_bitmaps()?;
            vhd_bat::save_bat(
                &self.file,
                sparse.header.table_offset(),
                &self.bat.read().unwrap(),
            )
            .map_err(VhdError::Bat)?;

            let mut pending = self.pending_locators.lock().unwrap();
            for (offset, data) in pending.iter() {
                self.file
                    .write_all_at(data, *offset)
                    .map_err(VhdError::WriteHeader)?;
            }
            pending.clear();

            if self.header_dirty.load(Ordering::SeqCst) {
                self.file
                    .write_all_at(&sparse.header.encode(), self.footer.data_offset())
                    .map_err(VhdError::WriteHeader)?;
                self.header_dirty.store(false, Ordering::SeqCst);
            }
            self.file
                .write_all_at(&footer, 0)
                .map_err(VhdError::WriteFooter)?;
        }
        self.file
            .write_all_at(&footer, self.eof())
            .map_err(VhdError::WriteFooter)?;
        self.file.sync_all().map_err(VhdError::Sync)
    }

    /// Moves the trailing footer to `eof`, cutting or extending the file to
    /// match.
    pub(crate) fn set_end_of_data(&self, eof: u64) -> Result<()> {
        self.file
            .set_len(eof + FOOTER_SIZE as u64)
            .map_err(VhdError::SetFileSize)?;
        self.eof.store(eof, Ordering::SeqCst);
        self.file
            .write_all_at(&self.footer.encode(), eof)
            .map_err(VhdError::WriteFooter)
    }

    pub(crate) fn mark_header_dirty(&mut self) -> Result<()> {
        let sparse = self.sparse_mut()?;
        sparse.header.refresh_checksum();
        self.header_dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Updates the size dependent footer fields.
    pub(crate) fn set_size(&mut self, size: u64) {
        self.footer.set_current_size(size, Geometry::from_size(size));
        self.footer.refresh_checksum();
    }

    /// Replaces the physical CHS geometry kept in the footer. Persisted by
    /// the next flush.
    pub fn set_geometry(&mut self, geometry: Geometry) -> Result<()> {
        self.check_writable()?;
        if geometry.cylinders == 0
            || geometry.heads == 0
            || geometry.heads > 16
            || geometry.sectors == 0
        {
            return Err(VhdError::InvalidGeometry(geometry));
        }
        self.footer.set_geometry(geometry);
        self.footer.refresh_checksum();
        Ok(())
    }

    /// The geometry the guest BIOS translates to, if one was set. The format
    /// has no room for it, so it only lives as long as this handle.
    pub fn logical_geometry(&self) -> Option<Geometry> {
        self.logical_geometry
    }

    pub fn set_logical_geometry(&mut self, geometry: Geometry) -> Result<()> {
        self.check_writable()?;
        self.logical_geometry = Some(geometry);
        Ok(())
    }

    /// Switches between read-only and read-write access. Pending metadata
    /// is flushed before giving up write access. A handle whose file was
    /// opened read-only is reopened from its path.
    pub fn set_readonly(&mut self, readonly: bool) -> Result<()> {
        if readonly == self.config.readonly {
            return Ok(());
        }
        if self.expansion_in_flight() {
            return Err(VhdError::AllocationInProgress);
        }

        if readonly {
            Vhd::flush(self)?;
        } else if !file_is_writable(&self.file).map_err(VhdError::Reopen)? {
            let path = self.path.as_ref().ok_or(VhdError::ReadOnly)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(VhdError::Reopen)?;
            let sync_io = RawFileSync::new(file.as_raw_fd()).map_err(VhdError::Reopen)?;
            *self.sync_io.lock().unwrap() = sync_io;
            self.file = file;
        }

        self.config.readonly = readonly;
        info!(
            "Switched image to {} access",
            if readonly { "read-only" } else { "read-write" }
        );
        Ok(())
    }

    pub fn set_uuid(&mut self, uuid: Uuid) -> Result<()> {
        self.check_writable()?;
        self.footer.set_unique_id(uuid);
        self.footer.refresh_checksum();
        Ok(())
    }

    pub fn set_parent_uuid(&mut self, uuid: Uuid) -> Result<()> {
        self.check_writable()?;
        self.sparse_mut()?.header.set_parent_uuid(uuid);
        self.mark_header_dirty()
    }

    pub fn set_parent_timestamp(&mut self, timestamp: u32) -> Result<()> {
        self.check_writable()?;
        self.sparse_mut()?.header.set_parent_timestamp(timestamp);
        self.mark_header_dirty()
    }

    /// Records the parent's location: its file name in the dynamic header and
    /// the full path in every parent locator. Persisted by the next flush.
    pub fn set_parent_filename<P: AsRef<Path>>(&mut self, parent: P) -> Result<()> {
        self.check_writable()?;
        let parent = parent.as_ref();
        let too_long = || VhdError::ParentNameTooLong(parent.display().to_string());

        let absolute = std::path::absolute(parent).map_err(|_| too_long())?;
        let relative = match (self.path.as_deref().and_then(Path::parent), parent.is_absolute()) {
            (Some(dir), true) => match std::path::absolute(dir) {
                Ok(dir) => relative_path(&dir, parent),
                Err(_) => parent.to_path_buf(),
            },
            _ => parent.to_path_buf(),
        };
        let name = parent
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let sparse = self.sparse_mut()?;
        sparse
            .header
            .set_parent_name(&name)
            .map_err(|_| too_long())?;

        let mut updates = Vec::new();
        for index in 0..sparse.header.locators().len() {
            let locator = sparse.header.locator_mut(index);
            let path = match locator.code {
                PLATFORM_CODE_W2KU | PLATFORM_CODE_WI2K => &absolute,
                PLATFORM_CODE_W2RU | PLATFORM_CODE_WI2R => &relative,
                _ => continue,
            };
            let mut data = match encode_locator_path(locator.code, &path.to_string_lossy()) {
                Some(data) => data,
                None => continue,
            };
            if data.len() > locator.data_space as usize {
                return Err(too_long());
            }
            locator.data_length = data.len() as u32;
            data.resize(locator.data_space as usize, 0);
            updates.push((locator.data_offset, data));
        }

        *self.pending_locators.lock().unwrap() = updates;
        self.mark_header_dirty()
    }

    /// Rolls back an allocation left in flight on drop.
    fn resolve_in_flight(&self) {
        let mut slot = self.permit.lock().unwrap();
        if slot.is_none() {
            return;
        }
        warn!("Image dropped with a block allocation in flight, rolling it back");
        let mut io = self.sync_io.lock().unwrap();
        self.drain_sync(&mut slot, &mut io, None);
    }

    /// Reads `buf.len()` bytes at `offset`, zero filling ranges without data.
    pub(crate) fn read_zero_filled(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match self.read(offset + done as u64, &mut buf[done..])? {
                IoStatus::Done(len) => done += len,
                IoStatus::BlockNotAllocated { len, .. } => {
                    buf[done..done + len].fill(0);
                    done += len;
                }
            }
        }
        Ok(())
    }

    fn write_all_sectors(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let status =
                self.write_with_mode(offset + done as u64, &data[done..], AllocationMode::Always)?;
            done += status.len();
        }
        Ok(())
    }

    fn sector_request(&self, len: usize) -> (u64, usize, usize) {
        let offset = self.current_offset;
        let head = (offset % SECTOR_SIZE) as usize;
        let len = std::cmp::min(len as u64, self.size() - offset) as usize;
        (offset, head, len)
    }
}

impl Drop for Vhd {
    fn drop(&mut self) {
        self.resolve_in_flight();
        if !self.config.readonly {
            if let Err(e) = Vhd::flush(self) {
                warn!("Failed to flush image on drop: {}", e);
            }
        }
    }
}

impl Read for Vhd {
    /// Reads from the current position. Ranges without data read as zeroes.
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, std::io::Error> {
        if buf.is_empty() || self.current_offset >= self.size() {
            return Ok(0);
        }
        let (offset, head, len) = self.sector_request(buf.len());
        let sector = SECTOR_SIZE as usize;

        let result = if head == 0 && len >= sector {
            let aligned = len - len % sector;
            self.read_zero_filled(offset, &mut buf[..aligned])
                .map(|_| aligned)
        } else {
            let mut bounce = [0u8; SECTOR_SIZE as usize];
            let count = std::cmp::min(sector - head, len);
            self.read_zero_filled(offset - head as u64, &mut bounce)
                .map(|_| {
                    buf[..count].copy_from_slice(&bounce[head..head + count]);
                    count
                })
        };

        let count = result.map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "Failed reading {} bytes from VHD at offset {}: {}",
                    len, offset, e
                ),
            )
        })?;
        self.current_offset += count as u64;
        Ok(count)
    }
}

impl Write for Vhd {
    fn flush(&mut self) -> std::result::Result<(), std::io::Error> {
        Vhd::flush(self).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to flush VHD: {}", e),
            )
        })
    }

    /// Writes at the current position. Partial sectors are merged with the
    /// existing content first.
    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, std::io::Error> {
        if buf.is_empty() || self.current_offset >= self.size() {
            return Ok(0);
        }
        let (offset, head, len) = self.sector_request(buf.len());
        let sector = SECTOR_SIZE as usize;

        let result = if head == 0 && len >= sector {
            let aligned = len - len % sector;
            self.write_all_sectors(offset, &buf[..aligned])
                .map(|_| aligned)
        } else {
            let mut bounce = [0u8; SECTOR_SIZE as usize];
            let start = offset - head as u64;
            let count = std::cmp::min(sector - head, len);
            self.read_zero_filled(start, &mut bounce).and_then(|_| {
                bounce[head..head + count].copy_from_slice(&buf[..count]);
                self.write_all_sectors(start, &bounce).map(|_| count)
            })
        };

        let count = result.map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "Failed writing {} bytes to VHD at offset {}: {}",
                    len, offset, e
                ),
            )
        })?;
        self.current_offset += count as u64;
        Ok(count)
    }
}

impl Seek for Vhd {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_offset: Option<u64> = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(off) => {
                if off < 0 {
                    0i64.checked_sub(off)
                        .and_then(|increment| self.size().checked_sub(increment as u64))
                } else {
                    self.size().checked_add(off as u64)
                }
            }
            SeekFrom::Current(off) => {
                if off < 0 {
                    0i64.checked_sub(off)
                        .and_then(|increment| self.current_offset.checked_sub(increment as u64))
                } else {
                    self.current_offset.checked_add(off as u64)
                }
            }
        };

        if let Some(o) = new_offset {
            if o <= self.size() {
                self.current_offset = o;
                return Ok(o);
            }
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Failed seek operation",
        ))
    }
}
