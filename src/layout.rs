//! Volume layout - the canonical `zyxc` ordering and its offset arithmetic
//!
//! Every component that addresses voxel bytes (payload placement, ROI
//! extraction, tiling and reassembly) goes through [`VolumeSpec::scalar_index`].

use crate::error::{CivdError, Result};
use crate::header::ContainerHeader;
use crate::types::{voxel_count, Dims3, ScalarType};
use serde::{Deserialize, Serialize};

/// Memory ordering of a dense volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoxelLayout {
    /// z outermost, then y, then x, channel innermost
    #[default]
    Zyxc,
}

impl VoxelLayout {
    /// Code persisted in framed tile headers
    pub fn code(&self) -> u16 {
        match self {
            VoxelLayout::Zyxc => 1,
        }
    }

    /// Resolve a persisted layout code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(VoxelLayout::Zyxc),
            _ => None,
        }
    }
}

/// Logical description of a dense multi-channel volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Voxel extent along (x, y, z)
    pub dims: Dims3,

    /// Scalars per voxel
    pub channels: usize,

    /// Width of each scalar
    pub scalar_type: ScalarType,

    /// Memory ordering, always canonical
    pub layout: VoxelLayout,

    /// Start of voxel data within the buffer handed to readers
    pub offset_bytes: usize,
}

impl VolumeSpec {
    /// Create a byte-scalar volume spec starting at offset zero
    pub fn new(dims: Dims3, channels: usize) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(CivdError::InvalidDimensions(format!(
                "All dims must be > 0, got {:?}",
                dims
            )));
        }
        if channels == 0 {
            return Err(CivdError::InvalidDimensions(
                "Channel count must be > 0".to_string(),
            ));
        }

        let spec = Self {
            dims,
            channels,
            scalar_type: ScalarType::U8,
            layout: VoxelLayout::Zyxc,
            offset_bytes: 0,
        };
        spec.checked_total_size()?;
        Ok(spec)
    }

    /// Spec for the voxel block described by a container header
    pub fn from_header(header: &ContainerHeader, offset_bytes: usize) -> Self {
        Self {
            dims: header.dims,
            channels: header.channels,
            scalar_type: ScalarType::U8,
            layout: VoxelLayout::Zyxc,
            offset_bytes,
        }
    }

    /// Set the scalar width
    pub fn with_scalar_type(mut self, scalar_type: ScalarType) -> Self {
        self.scalar_type = scalar_type;
        self
    }

    /// Set where voxel data starts inside the buffer
    pub fn with_offset_bytes(mut self, offset_bytes: usize) -> Self {
        self.offset_bytes = offset_bytes;
        self
    }

    /// Number of voxels
    pub fn voxel_count(&self) -> usize {
        voxel_count(&self.dims)
    }

    /// Number of scalars (voxels times channels)
    pub fn scalar_count(&self) -> usize {
        self.voxel_count() * self.channels
    }

    /// Bytes per scalar
    pub fn bytes_per_scalar(&self) -> usize {
        self.scalar_type.size_in_bytes()
    }

    /// Size of the voxel data in bytes
    pub fn total_size_bytes(&self) -> usize {
        self.scalar_count() * self.bytes_per_scalar()
    }

    fn checked_total_size(&self) -> Result<usize> {
        self.dims
            .iter()
            .try_fold(self.channels, |acc, &d| acc.checked_mul(d))
            .and_then(|n| n.checked_mul(self.bytes_per_scalar()))
            .ok_or_else(|| {
                CivdError::InvalidDimensions(format!(
                    "Volume {:?} x {} channels overflows addressable memory",
                    self.dims, self.channels
                ))
            })
    }

    /// Canonical linear scalar index: `((z * dim_y + y) * dim_x + x) * channels + c`
    #[inline]
    pub fn scalar_index(&self, x: usize, y: usize, z: usize, c: usize) -> usize {
        (((z * self.dims[1] + y) * self.dims[0] + x) * self.channels) + c
    }

    /// Byte offset of a scalar inside the buffer, including `offset_bytes`
    #[inline]
    pub fn byte_offset(&self, x: usize, y: usize, z: usize, c: usize) -> usize {
        self.offset_bytes + self.scalar_index(x, y, z, c) * self.bytes_per_scalar()
    }

    /// Coordinates of the `ordinal`-th voxel in scan order (x fastest)
    pub fn voxel_coords(&self, ordinal: usize) -> Dims3 {
        let [dx, dy, _] = self.dims;
        [ordinal % dx, (ordinal / dx) % dy, ordinal / (dx * dy)]
    }

    /// Check if voxel coordinates are within bounds
    pub fn is_in_bounds(&self, coords: &Dims3) -> bool {
        coords.iter().zip(self.dims.iter()).all(|(&c, &d)| c < d)
    }

    /// Ensure a buffer holds the whole voxel block past `offset_bytes`
    pub fn validate_buffer(&self, buffer: &[u8]) -> Result<()> {
        let expected = self.offset_bytes + self.total_size_bytes();
        if buffer.len() < expected {
            return Err(CivdError::BufferSizeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        Ok(())
    }

    /// Get a summary string of the volume
    pub fn summary(&self) -> String {
        format!(
            "{} x {} x {} voxels, {} channels ({}), {}",
            self.dims[0],
            self.dims[1],
            self.dims[2],
            self.channels,
            self.scalar_type,
            crate::utils::format_bytes(self.total_size_bytes())
        )
    }
}
