//! Volume codec: payload placement, channel initialization and the voxel-block CRC
//!
//! Payload bytes fill the volume channel by channel. Byte `p` lands in
//! channel `p / voxel_count` at voxel ordinal `p % voxel_count`, walking
//! voxels in scan order (x fastest, z slowest). A payload no larger than the
//! voxel count therefore occupies channel 0 only. Channels that carry no
//! payload are initialized from an explicit [`ChannelPlane`] or from the
//! [`ChannelFill`] table.

use crate::error::{CivdError, Result};
use crate::header::ContainerHeader;
use crate::layout::VolumeSpec;
use crate::types::Dims3;
use crate::utils::{calculate_checksum, ceil_div, integer_cbrt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Smallest cube edge `d` with `d^3 * channels >= payload_len`.
///
/// An empty payload still gets a single-voxel cube.
pub fn geometry_for(payload_len: u64, channels: usize) -> Result<usize> {
    if channels == 0 {
        return Err(CivdError::InvalidDimensions(
            "Channel count must be > 0".to_string(),
        ));
    }

    let voxels_needed = payload_len.div_ceil(channels as u64);
    if voxels_needed == 0 {
        return Ok(1);
    }

    let mut edge = integer_cbrt(voxels_needed);
    if edge * edge * edge < voxels_needed {
        edge += 1;
    }
    usize::try_from(edge).map_err(|_| {
        CivdError::InvalidDimensions(format!("Cube edge {} exceeds addressable memory", edge))
    })
}

/// Per-channel default byte values for channels that carry no payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelFill {
    /// Value for channel `i`, indexed by channel
    pub values: Vec<u8>,

    /// Value for channels past the end of `values`
    pub fallback: u8,
}

impl Default for ChannelFill {
    fn default() -> Self {
        Self::canonical()
    }
}

impl ChannelFill {
    /// Channel 1 ("integrity") is 0xFF, everything else is zero
    pub fn canonical() -> Self {
        Self {
            values: vec![0x00, 0xFF],
            fallback: 0x00,
        }
    }

    /// Every channel gets the same value
    pub fn uniform(value: u8) -> Self {
        Self {
            values: Vec::new(),
            fallback: value,
        }
    }

    /// Override the value of one channel
    pub fn with_channel(mut self, channel: usize, value: u8) -> Self {
        if self.values.len() <= channel {
            self.values.resize(channel + 1, self.fallback);
        }
        self.values[channel] = value;
        self
    }

    /// Value a channel is initialized with
    pub fn value_for(&self, channel: usize) -> u8 {
        self.values.get(channel).copied().unwrap_or(self.fallback)
    }
}

/// Explicit contents for one non-payload channel, in voxel scan order.
///
/// Planes shorter than the voxel count are padded with the channel's fill value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlane {
    pub channel: usize,
    pub data: Bytes,
}

impl ChannelPlane {
    pub fn new(channel: usize, data: impl Into<Bytes>) -> Self {
        Self {
            channel,
            data: data.into(),
        }
    }
}

/// A materialized voxel block and its checksum
#[derive(Debug, Clone)]
pub struct EncodedVolume {
    /// Geometry of `buffer`, starting at offset zero
    pub spec: VolumeSpec,

    /// Dense `zyxc` voxel block
    pub buffer: Vec<u8>,

    /// Exact payload length before padding
    pub payload_bytes: u64,

    /// CRC32 over the whole of `buffer`
    pub crc32: u32,
}

impl EncodedVolume {
    /// Channels that hold at least one payload byte
    pub fn payload_channels(&self) -> usize {
        payload_channels(self.payload_bytes as usize, self.spec.voxel_count())
    }
}

fn payload_channels(payload_len: usize, voxels: usize) -> usize {
    ceil_div(payload_len, voxels)
}

/// Encode a payload with channel defaults only
pub fn encode(payload: &[u8], dims: Dims3, channels: usize, fill: &ChannelFill) -> Result<EncodedVolume> {
    encode_with_planes(payload, dims, channels, fill, &[])
}

/// Encode a payload, initializing selected non-payload channels from explicit planes
pub fn encode_with_planes(
    payload: &[u8],
    dims: Dims3,
    channels: usize,
    fill: &ChannelFill,
    planes: &[ChannelPlane],
) -> Result<EncodedVolume> {
    let spec = VolumeSpec::new(dims, channels)?;
    let capacity = spec.scalar_count();
    if payload.len() > capacity {
        return Err(CivdError::CapacityExceeded {
            payload: payload.len() as u64,
            capacity: capacity as u64,
        });
    }

    let voxels = spec.voxel_count();
    let used = payload_channels(payload.len(), voxels);
    validate_planes(planes, channels, used, voxels)?;

    let mut buffer = vec![0u8; capacity];

    for channel in used..channels {
        let plane = planes.iter().find(|p| p.channel == channel);
        let value = fill.value_for(channel);
        let explicit = plane.map_or(&[][..], |p| &p.data[..]);
        if value == 0 && explicit.is_empty() {
            continue;
        }
        for ordinal in 0..voxels {
            let [x, y, z] = spec.voxel_coords(ordinal);
            buffer[spec.scalar_index(x, y, z, channel)] =
                explicit.get(ordinal).copied().unwrap_or(value);
        }
    }

    for (p, &byte) in payload.iter().enumerate() {
        let [x, y, z] = spec.voxel_coords(p % voxels);
        buffer[spec.scalar_index(x, y, z, p / voxels)] = byte;
    }

    let crc32 = calculate_checksum(&buffer);
    log::debug!(
        "Encoded {} payload bytes into {} (payload channels: {}, crc {:#010x})",
        payload.len(),
        spec.summary(),
        used,
        crc32
    );

    Ok(EncodedVolume {
        spec,
        buffer,
        payload_bytes: payload.len() as u64,
        crc32,
    })
}

fn validate_planes(planes: &[ChannelPlane], channels: usize, used: usize, voxels: usize) -> Result<()> {
    let mut seen = HashSet::with_capacity(planes.len());
    for plane in planes {
        if plane.channel >= channels {
            return Err(CivdError::ChannelIndexOutOfRange {
                index: plane.channel,
                channels,
            });
        }
        if !seen.insert(plane.channel) {
            return Err(CivdError::DuplicateChannel(plane.channel));
        }
        if plane.channel < used {
            return Err(CivdError::InvalidFormat(format!(
                "Channel {} carries payload and cannot take an explicit plane",
                plane.channel
            )));
        }
        if plane.data.len() > voxels {
            return Err(CivdError::BufferSizeMismatch {
                expected: voxels,
                actual: plane.data.len(),
            });
        }
    }
    Ok(())
}

/// Check a voxel block against its stored CRC
pub fn verify_crc(block: &[u8], stored: u32) -> Result<()> {
    let computed = calculate_checksum(block);
    if computed != stored {
        return Err(CivdError::IntegrityMismatch { stored, computed });
    }
    Ok(())
}

/// Read `payload_bytes` back out of a voxel buffer laid out as `spec` describes.
///
/// No integrity check is performed; see [`decode`].
pub fn extract_payload(spec: &VolumeSpec, buffer: &[u8], payload_bytes: u64) -> Result<Vec<u8>> {
    spec.validate_buffer(buffer)?;
    let capacity = spec.scalar_count() as u64;
    if payload_bytes > capacity {
        return Err(CivdError::CapacityExceeded {
            payload: payload_bytes,
            capacity,
        });
    }

    let voxels = spec.voxel_count();
    let len = payload_bytes as usize;
    let mut payload = Vec::with_capacity(len);
    for p in 0..len {
        let [x, y, z] = spec.voxel_coords(p % voxels);
        payload.push(buffer[spec.byte_offset(x, y, z, p / voxels)]);
    }
    Ok(payload)
}

/// Verify the voxel block against the header CRC, then extract the payload.
///
/// `block` must start at the first voxel byte.
pub fn decode(header: &ContainerHeader, block: &[u8]) -> Result<Vec<u8>> {
    let spec = VolumeSpec::from_header(header, 0);
    spec.validate_buffer(block)?;
    let block = &block[..spec.total_size_bytes()];

    verify_crc(block, header.crc32)?;
    let payload = extract_payload(&spec, block, header.payload_bytes)?;

    log::debug!(
        "Decoded {} payload bytes from {} capsule",
        payload.len(),
        header.version
    );
    Ok(payload)
}
