//! Region-of-interest extraction
//!
//! [`clamp`] turns a user-supplied [`RoiBox`] (which may stick out of the
//! volume or have a negative origin) into an in-bounds [`Region`].
//! [`read_region`] only accepts in-bounds regions and fails otherwise;
//! [`read_region_clamped`] does both steps.

use crate::error::{CivdError, Result};
use crate::layout::VolumeSpec;
use crate::types::{Dims3, Scalar, ScalarType};
use bytes::Bytes;
use ndarray::{Array4, ArrayView4};
use std::collections::HashSet;

/// A requested axis-aligned box, possibly partly outside the volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiBox {
    /// Corner (x, y, z); may be negative
    pub origin: [i64; 3],

    /// Extent (w, h, d)
    pub size: Dims3,

    channels: Option<Vec<usize>>,
}

impl RoiBox {
    pub fn new(origin: [i64; 3], size: Dims3) -> Self {
        Self {
            origin,
            size,
            channels: None,
        }
    }

    /// Select channels, in output order. Repeated indices are rejected.
    pub fn with_channels(mut self, subset: impl IntoIterator<Item = usize>) -> Result<Self> {
        self.channels = Some(unique_channels(subset)?);
        Ok(self)
    }

    pub fn channel_subset(&self) -> Option<&[usize]> {
        self.channels.as_deref()
    }
}

impl From<Region> for RoiBox {
    fn from(region: Region) -> Self {
        Self {
            origin: region.origin.map(|v| v as i64),
            size: region.size,
            channels: region.channels,
        }
    }
}

fn unique_channels(subset: impl IntoIterator<Item = usize>) -> Result<Vec<usize>> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for channel in subset {
        if !seen.insert(channel) {
            return Err(CivdError::DuplicateChannel(channel));
        }
        ordered.push(channel);
    }
    Ok(ordered)
}

/// An in-bounds box; a zero on any axis of `size` makes it empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub origin: Dims3,
    pub size: Dims3,
    channels: Option<Vec<usize>>,
}

impl Region {
    pub fn new(origin: Dims3, size: Dims3) -> Self {
        Self {
            origin,
            size,
            channels: None,
        }
    }

    /// Select channels, in output order. Repeated indices are rejected.
    pub fn with_channels(mut self, subset: impl IntoIterator<Item = usize>) -> Result<Self> {
        self.channels = Some(unique_channels(subset)?);
        Ok(self)
    }

    pub fn channel_subset(&self) -> Option<&[usize]> {
        self.channels.as_deref()
    }

    /// Exclusive upper corner
    /// Exclusive upper corner, saturating at `usize::MAX`
    pub fn end(&self) -> Dims3 {
        [
            self.origin[0].saturating_add(self.size[0]),
            self.origin[1].saturating_add(self.size[1]),
            self.origin[2].saturating_add(self.size[2]),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.size.iter().any(|&s| s == 0)
    }

    pub fn voxel_count(&self) -> usize {
        self.size.iter().product()
    }

    /// Whether the region lies inside `[0, dims)` on every axis
    pub fn fits(&self, dims: &Dims3) -> bool {
        (0..3).all(|i| {
            self.origin[i]
                .checked_add(self.size[i])
                .is_some_and(|end| end <= dims[i])
        })
    }

    /// Spatial overlap with another region; `None` when they do not touch
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let mut origin = [0; 3];
        let mut size = [0; 3];
        let (a_end, b_end) = (self.end(), other.end());
        for i in 0..3 {
            let lo = self.origin[i].max(other.origin[i]);
            let hi = a_end[i].min(b_end[i]);
            if hi <= lo {
                return None;
            }
            origin[i] = lo;
            size[i] = hi - lo;
        }
        Some(Region::new(origin, size))
    }
}

/// Entire extent of a volume, all channels
pub fn full_volume(spec: &VolumeSpec) -> Region {
    Region::new([0, 0, 0], spec.dims)
}

/// Clip a box to `[0, dims)` on every axis.
///
/// Never fails. An axis that clips away entirely gets size zero, which makes
/// the whole region empty; its origin is pinned inside `[0, dim]`.
pub fn clamp(roi: &RoiBox, dims: &Dims3) -> Region {
    let mut origin = [0usize; 3];
    let mut size = [0usize; 3];

    for i in 0..3 {
        let dim = dims[i] as i128;
        let lo = (roi.origin[i] as i128).clamp(0, dim);
        let hi = (roi.origin[i] as i128 + roi.size[i] as i128).clamp(0, dim);
        origin[i] = lo as usize;
        size[i] = (hi - lo).max(0) as usize;
    }

    Region {
        origin,
        size,
        channels: roi.channels.clone(),
    }
}

/// Dense result of a region read, shaped `(d, h, w, channels_selected)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTensor {
    shape: [usize; 4],
    scalar_type: ScalarType,
    data: Bytes,
}

impl RegionTensor {
    pub(crate) fn from_parts(shape: [usize; 4], scalar_type: ScalarType, data: Bytes) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * scalar_type.size_in_bytes();
        if data.len() != expected {
            return Err(CivdError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            scalar_type,
            data,
        })
    }

    /// `(d, h, w, c)`
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    /// Number of scalars
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian scalars in `(d, h, w, c)` order
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// The tensor read as a standalone `zyxc` volume of extent `(w, h, d)`
    pub fn spec(&self) -> Result<VolumeSpec> {
        let [d, h, w, c] = self.shape;
        VolumeSpec::new([w, h, d], c).map(|s| s.with_scalar_type(self.scalar_type))
    }

    /// Borrow as a byte array; only valid for 1-byte scalars
    pub fn view_u8(&self) -> Result<ArrayView4<'_, u8>> {
        if self.scalar_type != ScalarType::U8 {
            return Err(CivdError::InvalidFormat(format!(
                "Cannot view {} scalars as bytes",
                self.scalar_type
            )));
        }
        ArrayView4::from_shape(self.shape, &self.data[..])
            .map_err(|e| CivdError::InvalidDimensions(e.to_string()))
    }

    /// Decode into a typed array whose width matches the tensor's scalars
    pub fn to_array<T: Scalar>(&self) -> Result<Array4<T>> {
        if T::SCALAR_TYPE != self.scalar_type {
            return Err(CivdError::InvalidFormat(format!(
                "Requested {} scalars from a {} tensor",
                T::SCALAR_TYPE,
                self.scalar_type
            )));
        }
        let width = self.scalar_type.size_in_bytes();
        let values: Vec<T> = self.data.chunks_exact(width).map(T::from_le_slice).collect();
        Array4::from_shape_vec(self.shape, values)
            .map_err(|e| CivdError::InvalidDimensions(e.to_string()))
    }
}

pub(crate) fn resolve_channels(region: &Region, channels: usize) -> Result<Option<Vec<usize>>> {
    let Some(subset) = region.channel_subset() else {
        return Ok(None);
    };
    let mut seen = HashSet::with_capacity(subset.len());
    for &c in subset {
        if c >= channels {
            return Err(CivdError::ChannelIndexOutOfRange { index: c, channels });
        }
        if !seen.insert(c) {
            return Err(CivdError::DuplicateChannel(c));
        }
    }
    // An identity subset reads like "all channels"
    if subset.len() == channels && subset.iter().enumerate().all(|(i, &c)| i == c) {
        return Ok(None);
    }
    Ok(Some(subset.to_vec()))
}

/// Copy an in-bounds region out of a voxel buffer.
///
/// Iterates `z`, `y`, `x` ascending; each voxel contributes either all of
/// its channels or the region's channel subset in the given order.
pub fn read_region(buffer: &[u8], spec: &VolumeSpec, region: &Region) -> Result<RegionTensor> {
    if !region.fits(&spec.dims) {
        return Err(CivdError::OutOfBounds(format!(
            "Region origin {:?} size {:?} exceeds volume {:?}; clamp it first",
            region.origin, region.size, spec.dims
        )));
    }
    let subset = resolve_channels(region, spec.channels)?;
    spec.validate_buffer(buffer)?;

    let [w, h, d] = region.size;
    let selected = subset.as_ref().map_or(spec.channels, Vec::len);
    let shape = [d, h, w, selected];
    let width = spec.bytes_per_scalar();

    let mut out = Vec::with_capacity(region.voxel_count() * selected * width);
    if !region.is_empty() {
        let [x0, y0, z0] = region.origin;
        match &subset {
            None => {
                let row_len = w * spec.channels * width;
                for z in z0..z0 + d {
                    for y in y0..y0 + h {
                        let start = spec.byte_offset(x0, y, z, 0);
                        out.extend_from_slice(&buffer[start..start + row_len]);
                    }
                }
            }
            Some(channels) => {
                for z in z0..z0 + d {
                    for y in y0..y0 + h {
                        for x in x0..x0 + w {
                            for &c in channels {
                                let start = spec.byte_offset(x, y, z, c);
                                out.extend_from_slice(&buffer[start..start + width]);
                            }
                        }
                    }
                }
            }
        }
    }

    log::trace!(
        "Read region origin {:?} size {:?} -> shape {:?}",
        region.origin,
        region.size,
        shape
    );
    Ok(RegionTensor {
        shape,
        scalar_type: spec.scalar_type,
        data: Bytes::from(out),
    })
}

/// Clamp the box to the volume, then read it
pub fn read_region_clamped(buffer: &[u8], spec: &VolumeSpec, roi: &RoiBox) -> Result<RegionTensor> {
    read_region(buffer, spec, &clamp(roi, &spec.dims))
}

/// Write a dense all-channel block back into an in-bounds region.
///
/// `data` must be laid out exactly as [`read_region`] produces it with no
/// channel subset. The region's own channel subset is ignored.
pub fn write_region(buffer: &mut [u8], spec: &VolumeSpec, region: &Region, data: &[u8]) -> Result<()> {
    if !region.fits(&spec.dims) {
        return Err(CivdError::OutOfBounds(format!(
            "Region origin {:?} size {:?} exceeds volume {:?}",
            region.origin, region.size, spec.dims
        )));
    }
    spec.validate_buffer(buffer)?;

    let width = spec.bytes_per_scalar();
    let expected = region.voxel_count() * spec.channels * width;
    if data.len() != expected {
        return Err(CivdError::BufferSizeMismatch {
            expected,
            actual: data.len(),
        });
    }
    if region.is_empty() {
        return Ok(());
    }

    let [w, h, d] = region.size;
    let [x0, y0, z0] = region.origin;
    let row_len = w * spec.channels * width;
    let mut rows = data.chunks_exact(row_len);
    for z in z0..z0 + d {
        for y in y0..y0 + h {
            let start = spec.byte_offset(x0, y, z, 0);
            if let Some(row) = rows.next() {
                buffer[start..start + row_len].copy_from_slice(row);
            }
        }
    }
    Ok(())
}
