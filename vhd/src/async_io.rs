// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum AsyncIoError {
    /// Failed vectored reading from file.
    #[error("Failed vectored reading from file")]
    ReadVectored(#[source] std::io::Error),
    /// Failed vectored writing to file.
    #[error("Failed vectored writing to file")]
    WriteVectored(#[source] std::io::Error),
    /// Failed synchronizing file.
    #[error("Failed synchronizing file")]
    Fsync(#[source] std::io::Error),
    /// Failed signalling the completion notifier.
    #[error("Failed signalling the completion notifier")]
    Notify(#[source] std::io::Error),
}

pub type AsyncIoResult<T> = std::result::Result<T, AsyncIoError>;

impl AsyncIoError {
    pub fn into_io_error(self) -> std::io::Error {
        match self {
            AsyncIoError::ReadVectored(e)
            | AsyncIoError::WriteVectored(e)
            | AsyncIoError::Fsync(e)
            | AsyncIoError::Notify(e) => e,
        }
    }
}

/// Completion based file I/O.
///
/// Every submitted request is tagged with `user_data`. Once the request is
/// done the pair `(user_data, result)` becomes available through
/// [`AsyncIo::next_completed_request`] and the [`AsyncIo::notifier`] is
/// signalled. `result` is the number of bytes transferred, or a negated
/// errno value.
///
/// Buffers referenced by `iovecs` must stay valid until the matching
/// completion has been retrieved.
pub trait AsyncIo: Send {
    fn notifier(&self) -> &EventFd;
    fn read_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()>;
    fn write_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()>;
    fn fsync(&mut self, user_data: Option<u64>) -> AsyncIoResult<()>;
    fn next_completed_request(&mut self) -> Option<(u64, i32)>;
}

/// Describes `buf` as a single element iovec for a write request.
pub fn iovec_for(buf: &[u8]) -> libc::iovec {
    libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }
}

/// Turns a completion result into the transferred length, treating short
/// transfers as failures.
pub fn completion_result(result: i32, expected: usize) -> std::io::Result<usize> {
    if result < 0 {
        return Err(std::io::Error::from_raw_os_error(-result));
    }
    let done = result as usize;
    if done != expected {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("short transfer: {done} of {expected} bytes"),
        ));
    }
    Ok(done)
}
