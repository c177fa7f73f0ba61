//! Error types for CIVD operations

use crate::tiling::TileIndex;
use thiserror::Error;

/// Main error type for capsule, ROI and tiling operations
#[derive(Error, Debug)]
pub enum CivdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic: expected {expected:?}, found {found:?}")]
    InvalidMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("Unsupported format version: {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("Truncated {context}: need {needed} bytes, have {available}")]
    Truncated {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Capacity exceeded: payload of {payload} bytes does not fit {capacity} bytes of voxel storage")]
    CapacityExceeded { payload: u64, capacity: u64 },

    #[error("Integrity mismatch: stored CRC32 {stored:#010x}, computed {computed:#010x}")]
    IntegrityMismatch { stored: u32, computed: u32 },

    #[error("Corrupt file entry '{name}': {reason}")]
    CorruptFileEntry { name: String, reason: String },

    #[error("Duplicate file name: {0}")]
    DuplicateFileName(String),

    #[error("Channel index {index} out of range for {channels} channels")]
    ChannelIndexOutOfRange { index: usize, channels: usize },

    #[error("Duplicate channel index {0} in channel subset")]
    DuplicateChannel(usize),

    #[error("Tile index {index} out of range for tile grid {grid:?}")]
    TileIndexOutOfRange { index: TileIndex, grid: [usize; 3] },

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Specialized Result type for CIVD operations
pub type Result<T> = std::result::Result<T, CivdError>;

impl From<serde_json::Error> for CivdError {
    fn from(err: serde_json::Error) -> Self {
        CivdError::Serialization(err.to_string())
    }
}

impl CivdError {
    pub(crate) fn corrupt_entry(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CivdError::CorruptFileEntry {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
