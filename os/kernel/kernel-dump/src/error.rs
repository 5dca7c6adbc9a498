use crate::device::DeviceError;

/// Failure of a dump attempt.
///
/// Only [`DumpError::MapGrown`] is transient; the dump driver restarts the
/// whole attempt for it. Everything else ends the dump.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpError {
    /// The dumpable set changed underneath the dump (device ran out of space
    /// mid-dump, or a page stopped being dumpable after it was sized).
    #[error("dump map grown while dumping")]
    MapGrown,
    /// The operator pressed Ctrl-C on the console.
    #[error("dump aborted from console")]
    Cancelled,
    /// The dump does not fit the configured dump device.
    #[error("dump device too small: need {needed} bytes, have {available}")]
    TooSmall { needed: u64, available: u64 },
    /// Any other device failure.
    #[error("device error: {0}")]
    Device(DeviceError),
    /// A write request violated the writer's alignment rules.
    #[error("invalid write: {0}")]
    InvalidWrite(&'static str),
    /// Derived sizes disagree with each other.
    #[error("internal inconsistency: {0}")]
    Inconsistent(&'static str),
    /// [`DumpError::MapGrown`] on every permitted attempt.
    #[error("dump map kept growing after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl DumpError {
    /// Whether restarting the dump from the scan may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::MapGrown)
    }
}

impl From<DeviceError> for DumpError {
    fn from(value: DeviceError) -> Self {
        match value {
            DeviceError::NoSpace => Self::MapGrown,
            other => Self::Device(other),
        }
    }
}

/// Reasons an on-disk dump image is rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("image too short")]
    TooShort,
    #[error("bad magic")]
    BadMagic,
    #[error("parity mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadParity { stored: u32, computed: u32 },
    #[error("unsupported version {0}")]
    BadVersion(u32),
    #[error("string field is not valid UTF-8")]
    BadString,
    #[error("leader and trailer headers differ")]
    Mismatch,
    #[error("dump is truncated (no trailer)")]
    Truncated,
    #[error("bad metadata: {0}")]
    BadMetadata(&'static str),
}
