// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Allocate-on-write for sparse images.
//!
//! A write hitting a block without storage places a new block at the end of
//! the file. Four writes are issued at once and may complete in any order:
//!
//! 1. the sector bitmap at the old end of file,
//! 2. the payload behind the bitmap,
//! 3. the table slot pointing at the new block,
//! 4. a footer copy at the new end of file.
//!
//! The new block only becomes visible once all four succeeded. If any of
//! them failed the table slot is reset, the file is cut back to its old size
//! and the footer is rewritten at the old end of file.

use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;

use crate::async_io::{completion_result, iovec_for, AsyncIo};
use crate::raw_sync::RawFileSync;
use crate::vhd::{IoStatus, Result, Vhd, VhdError};
use crate::vhd_bat::{entry_offset, BatEntry, BAT_ENTRY_SIZE};
use crate::vhd_bitmap::SectorBitmap;
use crate::vhd_footer::FOOTER_SIZE;
use crate::vhd_io::{payload_offset, BlockAddress};
use crate::SECTOR_SIZE;

// User data of expansion requests carry this tag in their top byte.
const EXPANSION_TAG: u64 = 0xe5 << 56;
const TAG_MASK: u64 = 0xff << 56;
// Marks the corrective table write issued during a rollback.
const ROLLBACK_STEP: u64 = 0xff;
const SEQUENCE_MASK: u64 = 0x0000_ffff_ffff_ffff;

static UNALLOCATED_ENTRY: [u8; BAT_ENTRY_SIZE as usize] = [0xff; BAT_ENTRY_SIZE as usize];

/// Returns true for completions that belong to a block allocation and must
/// be handed to [`Vhd::complete_request`].
pub fn is_expansion_request(user_data: u64) -> bool {
    user_data & TAG_MASK == EXPANSION_TAG
}

fn request_user_data(sequence: u64, step: u64) -> u64 {
    EXPANSION_TAG | (sequence & SEQUENCE_MASK) << 8 | step
}

fn split_user_data(user_data: u64) -> (u64, u64) {
    ((user_data >> 8) & SEQUENCE_MASK, user_data & 0xff)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StepStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExpansionStep {
    Bitmap = 0,
    Data = 1,
    Table = 2,
    Footer = 3,
}

impl ExpansionStep {
    const ALL: [ExpansionStep; 4] = [
        ExpansionStep::Bitmap,
        ExpansionStep::Data,
        ExpansionStep::Table,
        ExpansionStep::Footer,
    ];

    fn from_raw(raw: u64) -> Option<ExpansionStep> {
        ExpansionStep::ALL.get(raw as usize).copied()
    }
}

/// Outcome of [`Vhd::write_async`].
#[derive(Debug, PartialEq, Eq)]
pub enum AsyncWrite {
    /// No allocation was needed, the write already happened.
    Complete(IoStatus),
    /// A block allocation was started. Its outcome is reported by
    /// [`Vhd::complete_request`] or [`Vhd::cancel_expansion`].
    InProgress,
}

/// Final result of an asynchronous write that allocated a block.
#[derive(Debug)]
pub struct ExpansionCompletion {
    /// User data passed to [`Vhd::write_async`].
    pub user_data: u64,
    /// Bytes written, or the error that made the allocation roll back.
    pub result: Result<usize>,
}

/// State of the one allocation an image may have in flight. The buffers
/// referenced by submitted requests live here until every step finished.
pub(crate) struct ExpansionRecord {
    sequence: u64,
    user_data: u64,
    block: u32,
    table_slot: u64,
    new_offset: u64,
    old_eof: u64,
    new_eof: u64,
    steps: [StepStatus; 4],
    bitmap: SectorBitmap,
    data: Vec<u8>,
    table_entry: [u8; BAT_ENTRY_SIZE as usize],
    footer: [u8; FOOTER_SIZE],
    first_error: Option<io::Error>,
    // The table write was abandoned and may still have reached the disk.
    table_in_doubt: bool,
}

impl ExpansionRecord {
    pub fn status(&self, step: ExpansionStep) -> StepStatus {
        self.steps[step as usize]
    }

    fn is_terminal(&self) -> bool {
        self.steps.iter().all(|s| *s != StepStatus::Pending)
    }

    fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| *s == StepStatus::Success)
    }

    fn fail(&mut self, step: ExpansionStep, error: io::Error) {
        self.steps[step as usize] = StepStatus::Failed;
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }

    fn expected_len(&self, step: ExpansionStep) -> usize {
        match step {
            ExpansionStep::Bitmap => self.bitmap.as_bytes().len(),
            ExpansionStep::Data => self.data.len(),
            ExpansionStep::Table => self.table_entry.len(),
            ExpansionStep::Footer => self.footer.len(),
        }
    }
}

pub(crate) type ExpansionSlot = Option<Box<ExpansionRecord>>;

impl Vhd {
    /// Writes `data` at `offset`, allocating the block on `io` when it has no
    /// storage yet.
    ///
    /// Completions tagged for this image (see [`is_expansion_request`]) must
    /// be fed to [`Vhd::complete_request`]. `data` is copied, the caller does
    /// not need to keep it alive. Only one allocation can be in flight;
    /// another one fails with [`VhdError::AllocationInProgress`] until the
    /// first is resolved.
    pub fn write_async(
        &self,
        offset: u64,
        data: &[u8],
        mode: crate::AllocationMode,
        io: &mut dyn AsyncIo,
        user_data: u64,
    ) -> Result<AsyncWrite> {
        let (addr, data) = match self.prepare_write(offset, data, mode)? {
            PreparedWrite::Done(status) => return Ok(AsyncWrite::Complete(status)),
            PreparedWrite::Allocate(addr, data) => (addr, data),
        };

        let mut slot = self.permit.lock().unwrap();
        if slot.is_some() {
            return Err(VhdError::AllocationInProgress);
        }
        // Another allocation may have committed this block meanwhile.
        if let Some(block_offset) = self.block_entry(addr.block)?.file_offset() {
            drop(slot);
            let len = self.write_in_place(addr, block_offset, data)?;
            return Ok(AsyncWrite::Complete(IoStatus::Done(len)));
        }

        match self.begin_expansion(&mut slot, addr, data, io, user_data)? {
            None => Ok(AsyncWrite::InProgress),
            Some(completion) => completion
                .result
                .map(|len| AsyncWrite::Complete(IoStatus::Done(len))),
        }
    }

    /// Feeds the completion of an expansion request back. Returns the write's
    /// final result once all steps of the allocation are known.
    pub fn complete_request(
        &self,
        user_data: u64,
        result: i32,
        io: &mut dyn AsyncIo,
    ) -> Option<ExpansionCompletion> {
        let mut slot = self.permit.lock().unwrap();
        self.step_completed(&mut slot, user_data, result, io)
    }

    /// Gives up on every step of the in-flight allocation whose completion
    /// has not been delivered and rolls it back.
    ///
    /// The backend must guarantee that the abandoned requests will not
    /// complete later, for instance because it has been torn down.
    pub fn cancel_expansion(&self, io: &mut dyn AsyncIo) -> Option<ExpansionCompletion> {
        let mut slot = self.permit.lock().unwrap();
        self.abort_expansion(&mut slot, io)
    }

    /// True while a block allocation waits for step completions.
    pub fn expansion_in_flight(&self) -> bool {
        self.permit.lock().unwrap().is_some()
    }

    /// Allocates the block for `data` and drives the protocol to its end on
    /// the inline backend.
    pub(crate) fn allocate_sync(&self, addr: BlockAddress, data: &[u8]) -> Result<usize> {
        let mut slot = self.permit.lock().unwrap();
        if slot.is_some() {
            return Err(VhdError::AllocationInProgress);
        }
        if let Some(block_offset) = self.block_entry(addr.block)?.file_offset() {
            drop(slot);
            return self.write_in_place(addr, block_offset, data);
        }

        let mut io = self.sync_io.lock().unwrap();
        let done = self.begin_expansion(&mut slot, addr, data, &mut *io, 0)?;
        match self.drain_sync(&mut slot, &mut io, done) {
            Some(completion) => completion.result,
            None => Err(VhdError::ExpansionFailed(io::Error::other(
                "allocation did not finish",
            ))),
        }
    }

    /// Collects the inline completions, rolling back whatever they leave
    /// unfinished.
    pub(crate) fn drain_sync(
        &self,
        slot: &mut ExpansionSlot,
        io: &mut RawFileSync,
        mut done: Option<ExpansionCompletion>,
    ) -> Option<ExpansionCompletion> {
        loop {
            while let Some((user_data, result)) = io.next_completed_request() {
                if let Some(completion) = self.step_completed(slot, user_data, result, io) {
                    done = Some(completion);
                }
            }
            if slot.is_none() {
                break;
            }
            // Picks up the completion of the table reset on the next pass.
            done = self.abort_expansion(slot, io).or(done);
        }
        // Reset the notifier, nobody waits on it for the inline backend.
        let _ = io.notifier().read();
        done
    }

    fn begin_expansion(
        &self,
        slot: &mut ExpansionSlot,
        addr: BlockAddress,
        data: &[u8],
        io: &mut dyn AsyncIo,
        user_data: u64,
    ) -> Result<Option<ExpansionCompletion>> {
        let layout = self.layout()?;
        let table_offset = self.table_offset()?;
        let new_offset = self.eof();
        let mut bitmap = SectorBitmap::new(layout.bitmap_size() as usize);
        bitmap.set_range(addr.sector, (data.len() as u64 / SECTOR_SIZE) as u32);

        let sequence = self.expansion_sequence.fetch_add(1, Ordering::Relaxed) & SEQUENCE_MASK;
        let mut record = Box::new(ExpansionRecord {
            sequence,
            user_data,
            block: addr.block,
            table_slot: entry_offset(table_offset, addr.block),
            new_offset,
            old_eof: new_offset,
            new_eof: new_offset + layout.stride(),
            steps: [StepStatus::Pending; 4],
            bitmap,
            data: data.to_vec(),
            table_entry: BatEntry::at_offset(new_offset).encode(),
            footer: self.footer.encode(),
            first_error: None,
            table_in_doubt: false,
        });

        debug!(
            "Allocating block {} at {:#x} for {} bytes",
            addr.block,
            new_offset,
            data.len()
        );

        let targets = [
            new_offset,
            payload_offset(new_offset, &layout, addr.sector),
            record.table_slot,
            record.new_eof,
        ];

        for step in ExpansionStep::ALL {
            let iovec = match step {
                ExpansionStep::Bitmap => iovec_for(record.bitmap.as_bytes()),
                ExpansionStep::Data => iovec_for(&record.data),
                ExpansionStep::Table => iovec_for(&record.table_entry),
                ExpansionStep::Footer => iovec_for(&record.footer),
            };
            if let Err(e) = io.write_vectored(
                targets[step as usize] as libc::off_t,
                &[iovec],
                request_user_data(sequence, step as u64),
            ) {
                // Nothing after a refused submission is issued.
                let error = e.into_io_error();
                warn!("Failed submitting {:?} step of block allocation: {}", step, error);
                record.fail(step, error);
                for later in ExpansionStep::ALL.iter().skip(step as usize + 1) {
                    record.steps[*later as usize] = StepStatus::Failed;
                }
                break;
            }
        }

        if record.is_terminal() {
            return Ok(Some(self.finish_expansion(record, io)));
        }
        *slot = Some(record);
        Ok(None)
    }

    fn step_completed(
        &self,
        slot: &mut ExpansionSlot,
        user_data: u64,
        result: i32,
        io: &mut dyn AsyncIo,
    ) -> Option<ExpansionCompletion> {
        let (sequence, raw_step) = split_user_data(user_data);

        if raw_step == ROLLBACK_STEP {
            if result < 0 {
                self.damaged.store(true, Ordering::SeqCst);
                error!(
                    "Failed resetting table entry during rollback: {}",
                    io::Error::from_raw_os_error(-result)
                );
            }
            return None;
        }

        let step = ExpansionStep::from_raw(raw_step)?;
        let record = match slot.as_mut() {
            Some(record) if record.sequence == sequence => record,
            _ => {
                debug!("Ignoring stale expansion completion {:#x}", user_data);
                return None;
            }
        };
        if record.status(step) != StepStatus::Pending {
            return None;
        }

        match completion_result(result, record.expected_len(step)) {
            Ok(_) => record.steps[step as usize] = StepStatus::Success,
            Err(e) => {
                warn!("{:?} step of block allocation failed: {}", step, e);
                record.fail(step, e);
            }
        }

        if !record.is_terminal() {
            return None;
        }
        let record = slot.take()?;
        Some(self.finish_expansion(record, io))
    }

    fn abort_expansion(
        &self,
        slot: &mut ExpansionSlot,
        io: &mut dyn AsyncIo,
    ) -> Option<ExpansionCompletion> {
        let mut record = slot.take()?;
        record.table_in_doubt = record.status(ExpansionStep::Table) == StepStatus::Pending;
        for step in ExpansionStep::ALL {
            if record.status(step) == StepStatus::Pending {
                record.fail(
                    step,
                    io::Error::new(io::ErrorKind::Interrupted, "allocation cancelled"),
                );
            }
        }
        Some(self.finish_expansion(record, io))
    }

    fn finish_expansion(
        &self,
        record: Box<ExpansionRecord>,
        io: &mut dyn AsyncIo,
    ) -> ExpansionCompletion {
        let user_data = record.user_data;
        let result = if record.succeeded() {
            Ok(self.commit_expansion(*record))
        } else {
            Err(self.rollback_expansion(*record, io))
        };
        ExpansionCompletion { user_data, result }
    }

    fn commit_expansion(&self, record: ExpansionRecord) -> usize {
        self.bat.write().unwrap()[record.block as usize] = BatEntry::at_offset(record.new_offset);
        self.eof.store(record.new_eof, Ordering::SeqCst);

        let mut bitmap = record.bitmap;
        bitmap.mark_clean();
        let mut cache = self.bitmaps.lock().unwrap();
        if let Err(e) = self.cache_bitmap(&mut cache, record.block, bitmap) {
            warn!("Failed writing back evicted bitmap: {}", e);
        }

        debug!(
            "Block {} committed, end of data now {:#x}",
            record.block, record.new_eof
        );
        record.data.len()
    }

    fn rollback_expansion(&self, record: ExpansionRecord, io: &mut dyn AsyncIo) -> VhdError {
        warn!(
            "Rolling back allocation of block {}, end of data stays {:#x}",
            record.block, record.old_eof
        );

        let mut damaged = false;
        if record.status(ExpansionStep::Table) == StepStatus::Success || record.table_in_doubt {
            if let Err(e) = io.write_vectored(
                record.table_slot as libc::off_t,
                &[iovec_for(&UNALLOCATED_ENTRY)],
                request_user_data(record.sequence, ROLLBACK_STEP),
            ) {
                error!("Failed submitting table entry reset: {}", e);
                damaged = true;
            }
        }

        if let Err(e) = self.file.set_len(record.old_eof + FOOTER_SIZE as u64) {
            error!("Failed truncating image after failed allocation: {}", e);
            damaged = true;
        }
        if let Err(e) = self.file.write_all_at(&self.footer.encode(), record.old_eof) {
            error!("Failed restoring footer after failed allocation: {}", e);
            damaged = true;
        }

        if damaged {
            self.damaged.store(true, Ordering::SeqCst);
            return VhdError::ImageDamaged;
        }
        VhdError::ExpansionFailed(
            record
                .first_error
                .unwrap_or_else(|| io::Error::other("block allocation failed")),
        )
    }
}

/// What is left to do for a write once the in-place cases are handled.
pub(crate) enum PreparedWrite<'a> {
    Done(IoStatus),
    Allocate(BlockAddress, &'a [u8]),
}
