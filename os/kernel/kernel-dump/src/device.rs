//! # Dump Device and Console
//!
//! The two crash-time collaborators that live outside this crate:
//!
//! - [`DumpDevice`]: the raw block device configured as dump target. The
//!   driver behind it uses its polled, interrupt-free I/O path; every call is
//!   synchronous and cannot be cancelled once issued.
//! - [`Console`]: a non-blocking keyboard poll so the operator can abort a
//!   long dump with Ctrl-C.

use crate::header::DumpHeader;

/// Console character that aborts a running dump.
pub const CTRL_C: u8 = 0x03;

/// Errors reported by a [`DumpDevice`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The device ran out of space (or its capacity changed) mid-dump.
    #[error("no space left on dump device")]
    NoSpace,
    /// Any other I/O failure, with the driver's errno.
    #[error("I/O error (errno {0})")]
    Io(i32),
}

/// The dump target.
///
/// Offsets are absolute byte offsets on the device. The dump occupies the
/// end of the media: `[media_offset + media_size - dump - 2 * header,
/// media_offset + media_size)`.
pub trait DumpDevice {
    /// Sector size in bytes.
    fn block_size(&self) -> u32;

    /// Largest single transfer the driver accepts, in bytes.
    fn max_io_size(&self) -> usize;

    /// Offset of the first usable byte.
    fn media_offset(&self) -> u64;

    /// Number of usable bytes.
    fn media_size(&self) -> u64;

    /// Called once per attempt, right before the leading header is written.
    ///
    /// # Errors
    /// Any driver failure; [`DeviceError::NoSpace`] restarts the dump.
    fn begin(&mut self, header: &DumpHeader) -> Result<(), DeviceError>;

    /// Write `data` at `offset`. A zero-length write signals completion.
    ///
    /// # Errors
    /// Any driver failure; [`DeviceError::NoSpace`] restarts the dump.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    /// Called after the trailing header has been written.
    ///
    /// # Errors
    /// Any driver failure.
    fn finish(&mut self) -> Result<(), DeviceError>;
}

/// Non-blocking console input.
pub trait Console {
    /// Return a pending input character, if any. Must never block.
    fn poll_char(&mut self) -> Option<u8>;
}

/// A console with no input; dumps through it cannot be aborted.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoConsole;

impl Console for NoConsole {
    fn poll_char(&mut self) -> Option<u8> {
        None
    }
}
