// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Sparse, block allocated VHD disk images.
//!
//! The crate opens, creates and maintains fixed, dynamic and differencing
//! VHD images. Dynamic and differencing images allocate blocks lazily on the
//! first write through a four step expansion protocol that can be driven
//! either synchronously or over a completion based [`async_io::AsyncIo`]
//! backend.

#[macro_use]
extern crate log;

macro_rules! div_round_up {
    ($n:expr,$d:expr) => {
        ($n + $d - 1) / $d
    };
}

pub mod async_io;
pub mod config;
pub mod raw_sync;
mod vec_cache;
pub mod vhd;
pub mod vhd_bat;
mod vhd_bitmap;
pub mod vhd_compact;
pub mod vhd_dynamic_header;
pub mod vhd_expansion;
pub mod vhd_footer;
mod vhd_io;
pub mod vhd_repair;
mod vhd_resize;

pub use crate::config::{AllocationMode, ImageConfig};
pub use crate::vhd::{
    CreateOptions, ErrorClass, IoStatus, ParentInfo, Result, Vhd, VhdError,
};
pub use crate::vhd_compact::{CompactStats, ParentReader};
pub use crate::vhd_expansion::{is_expansion_request, AsyncWrite, ExpansionCompletion};
pub use crate::vhd_footer::{DiskType, Geometry};
pub use crate::vhd_repair::{repair, repair_file, RepairReport};

pub const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

// Largest virtual disk the format can describe (2 TiB).
pub const VHD_MAX_SIZE: u64 = 2 << 40;
pub const VHD_MAX_SECTORS: u64 = VHD_MAX_SIZE / SECTOR_SIZE;

// Block size used when creating sparse images.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 << 20;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn is_zeroed(buf: &[u8]) -> bool {
    buf.iter().all(|b| *b == 0)
}

/// Forwards completion percentages of a long running operation to a caller
/// supplied callback. Only increasing values are passed on.
pub(crate) struct Progress<'a> {
    callback: &'a mut dyn FnMut(u32),
    last: Option<u32>,
}

impl<'a> Progress<'a> {
    pub fn new(callback: &'a mut dyn FnMut(u32)) -> Self {
        Progress {
            callback,
            last: None,
        }
    }

    /// Reports `done` out of `total` steps, scaled into `[start, end]`.
    pub fn step(&mut self, start: u32, end: u32, done: u64, total: u64) {
        let percent = match total {
            0 => end,
            _ => start + ((end - start) as u64 * done / total) as u32,
        };
        self.set(percent);
    }

    pub fn set(&mut self, percent: u32) {
        let percent = std::cmp::min(percent, 100);
        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            (self.callback)(percent);
        }
    }
}
