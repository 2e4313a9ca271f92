// vim: tw=80
//! Common type definitions used throughout the RAID engine

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::io;

/// Indexes a column (a member disk) of the array.
pub type ColT = usize;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// A logical sector address within the RAID set's address space.
pub type RaidAddrT = u64;

/// Indexes one parity-logging region.
pub type RegionIdT = usize;

/// A physical sector address on one member disk.
pub type SectorT = u64;

/// Indexes a stripe.
pub type StripeNumT = u64;

/// The engine's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Bad address")]
    EFAULT          = libc::EFAULT as isize,
    #[error("Operation not supported by device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Operation already in progress")]
    EALREADY        = libc::EALREADY as isize,
    #[error("Operation not supported")]
    EOPNOTSUPP      = libc::EOPNOTSUPP as isize,
    #[error("Can't send after socket shutdown")]
    ESHUTDOWN       = libc::ESHUTDOWN as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,

    //// Custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(_: serde_yaml_ng::Error) -> Self {
        Error::EINVAL
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

// LCOV_EXCL_STOP
