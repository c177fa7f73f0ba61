//! Codec configuration

use crate::error::{CivdError, Result};
use crate::filetable::DecodeMode;
use crate::types::Dims3;
use crate::volume::{geometry_for, ChannelFill};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default channel count for new capsules (payload, integrity, semantic, aux)
pub const DEFAULT_CHANNELS: usize = 4;

/// How capsule dimensions are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum GeometryPolicy {
    /// Smallest cube that holds the payload
    #[default]
    Adaptive,
    /// Caller-chosen dimensions
    Fixed { dims: Dims3 },
}

/// Settings for encoding and decoding capsules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Channels per voxel
    pub channels: usize,

    /// Dimension policy
    pub geometry: GeometryPolicy,

    /// Defaults for channels that carry no payload
    pub channel_fill: ChannelFill,

    /// File-table corruption handling
    pub decode_mode: DecodeMode,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            geometry: GeometryPolicy::Adaptive,
            channel_fill: ChannelFill::canonical(),
            decode_mode: DecodeMode::Strict,
        }
    }
}

impl CodecConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Use fixed dimensions instead of the adaptive cube
    pub fn with_dims(mut self, dims: Dims3) -> Self {
        self.geometry = GeometryPolicy::Fixed { dims };
        self
    }

    pub fn with_channel_fill(mut self, fill: ChannelFill) -> Self {
        self.channel_fill = fill;
        self
    }

    pub fn with_decode_mode(mut self, mode: DecodeMode) -> Self {
        self.decode_mode = mode;
        self
    }

    /// Dimensions for a payload of `payload_len` bytes
    pub fn dims_for(&self, payload_len: u64) -> Result<Dims3> {
        match self.geometry {
            GeometryPolicy::Adaptive => {
                let edge = geometry_for(payload_len, self.channels)?;
                Ok([edge; 3])
            }
            GeometryPolicy::Fixed { dims } => Ok(dims),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > u32::MAX as usize {
            return Err(CivdError::Configuration(format!(
                "channels must be in 1..=u32::MAX, got {}",
                self.channels
            )));
        }
        if let GeometryPolicy::Fixed { dims } = self.geometry {
            if dims.iter().any(|&d| d == 0 || d > u32::MAX as usize) {
                return Err(CivdError::Configuration(format!(
                    "fixed dims must be in 1..=u32::MAX, got {:?}",
                    dims
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&text)
    }
}
