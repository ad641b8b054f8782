// vim: tw=80
//! Common type definitions used throughout zns-core

use thiserror::Error;
use std::io;

/// Indexes a block.  Depending on context it may be a logical address, which
/// skips each zone's unusable tail, or a physical one.
pub type LbaT = u64;

/// Indexes a device's Zones.
pub type ZoneT = u64;

/// zns-core's error type.
///
/// Every argument and bounds check happens before any command reaches the
/// device, so `InvalidArguments` always means that nothing was done.
/// `IoError` means the device, or an allocation needed to talk to it, failed,
/// and the caller must assume that a write pointer may have moved.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("Invalid argument")]
    InvalidArguments,
    #[error("Input/output error")]
    IoError,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        tracing::error!("device I/O failed: {e}");
        Error::IoError
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        tracing::error!("device I/O failed: {e}");
        Error::IoError
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

// LCOV_EXCL_STOP
