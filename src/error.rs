use core::result;
use std::{io, os::fd::RawFd, time::Duration};

use thiserror::Error;

use crate::ring::OpKind;

/// A helper type for wrapping a [result::Result] such that we can reduce noise in our signatures.
pub type Result<T> = result::Result<T, Error>;

/// An error representing a failure interacting with the underlying io_uring, the buffer pools
/// registered with it, or the continuation machinery layered on top.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to set up io_uring instance: {0}")]
    Setup(#[source] io::Error),
    #[error("no free submission queue entry available")]
    QueueFull,
    #[error("failed to submit entries to the kernel: {0}")]
    SubmitFailed(#[source] io::Error),
    #[error("failed waiting for completion queue entry: {0}")]
    Wait(#[source] io::Error),
    #[error("{kind} operation on fd {fd:?} failed: {source}")]
    OperationFailed {
        kind: OpKind,
        fd: Option<RawFd>,
        #[source]
        source: io::Error,
    },
    #[error("completion carried unknown correlation token {0:#x}")]
    UnknownCorrelation(u64),
    #[error("buffer pool group {group} has no buffers left")]
    PoolExhausted { group: u16 },
    #[error("buffer slot {index} out of range for pool with {slots} slots")]
    InvalidSlot { index: usize, slots: usize },
    #[error("buffer slot {index} is currently owned by the kernel")]
    SlotOffered { index: usize },
    #[error("invalid buffer pool configuration: {0}")]
    InvalidPool(String),
    #[error("request abandoned by ring shutdown")]
    ShutdownAbandoned,
    #[error("ring waiter exited without delivering a result")]
    Disconnected,
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

impl Error {
    /// Translate the negated errno carried by a completion into an [Error::OperationFailed].
    pub(crate) fn from_result(kind: OpKind, fd: Option<RawFd>, result: i32) -> Error {
        Error::OperationFailed {
            kind,
            fd,
            source: io::Error::from_raw_os_error(-result),
        }
    }

    /// The underlying os error code if this error originated from the kernel.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Setup(err) | Error::SubmitFailed(err) | Error::Wait(err) => err.raw_os_error(),
            Error::OperationFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
