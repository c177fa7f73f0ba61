//! Core data types for CIVD volumes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Voxel extent or coordinate along (x, y, z)
pub type Dims3 = [usize; 3];

/// Scalar width of one channel value, tagged by its byte count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ScalarType {
    /// 1-byte scalars (capsules always use this)
    #[default]
    U8 = 1,
    /// 2-byte scalars
    U16 = 2,
    /// 4-byte scalars
    U32 = 4,
    /// 8-byte scalars
    U64 = 8,
}

impl ScalarType {
    /// Size in bytes of one scalar
    pub fn size_in_bytes(&self) -> usize {
        *self as usize
    }

    /// Width tag as persisted in tile headers
    pub fn tag(&self) -> u16 {
        *self as u16
    }

    /// Resolve a width tag (1/2/4/8)
    pub fn from_width(width: usize) -> Option<Self> {
        match width {
            1 => Some(ScalarType::U8),
            2 => Some(ScalarType::U16),
            4 => Some(ScalarType::U32),
            8 => Some(ScalarType::U64),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-byte", self.size_in_bytes())
    }
}

/// Plain scalar that can be decoded from little-endian voxel bytes.
///
/// Lets a [`crate::roi::RegionTensor`] be viewed as a typed ndarray
/// without reinterpreting memory in place.
pub trait Scalar: Copy + Default {
    /// Width tag this Rust type corresponds to
    const SCALAR_TYPE: ScalarType;

    /// Decode from exactly `SCALAR_TYPE.size_in_bytes()` little-endian bytes
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const SCALAR_TYPE: ScalarType = ScalarType::$tag;

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_scalar!(
    u8 => U8,
    i8 => U8,
    u16 => U16,
    i16 => U16,
    u32 => U32,
    i32 => U32,
    f32 => U32,
    u64 => U64,
    i64 => U64,
    f64 => U64,
);

/// Total number of voxels for an extent
pub fn voxel_count(dims: &Dims3) -> usize {
    dims.iter().product()
}
