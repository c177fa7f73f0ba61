//! Tiling manifest document
//!
//! Persisted as JSON next to the tile slots. It is the only place a reader
//! learns boundary tile sizes, so loaded manifests are checked against the
//! grid they claim to describe.

use crate::error::{CivdError, Result};
use crate::layout::VolumeSpec;
use crate::tiling::{plan_geometry, Tile, TileIndex};
use crate::types::{Dims3, ScalarType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Schema tag every manifest carries
pub const MANIFEST_SCHEMA: &str = "civd.tiling.manifest";

/// Manifest format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestVersion {
    pub major: u16,
    pub minor: u16,
}

impl ManifestVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for ManifestVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// How each tile slot is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// Bare `zyxc` tile bytes
    #[default]
    Raw,
    /// Tile bytes behind a self-describing tile header
    Framed,
}

/// Complete description of a tiled volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingManifest {
    /// Always [`MANIFEST_SCHEMA`]
    pub schema: String,

    /// Format version
    pub version: ManifestVersion,

    /// Identifier of the tile pack
    pub pack_id: Uuid,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Extent of the whole volume
    pub global_dims: Dims3,

    /// Nominal tile extent
    pub tile_size: Dims3,

    /// `ceil(global_dims / tile_size)` on each axis
    pub tile_count_per_axis: Dims3,

    /// Channels per voxel
    pub channels: usize,

    /// Scalar width
    pub scalar_type: ScalarType,

    /// Slot encoding
    #[serde(default)]
    pub tile_format: TileFormat,

    /// Every planned tile, in `(tx, ty, tz)` order
    pub tiles: Vec<Tile>,

    /// Custom metadata key-value pairs
    #[serde(default)]
    pub custom_metadata: HashMap<String, String>,
}

impl TilingManifest {
    pub(crate) fn from_plan(global_dims: Dims3, tile_size: Dims3, counts: Dims3, tiles: Vec<Tile>) -> Self {
        Self {
            schema: MANIFEST_SCHEMA.to_string(),
            version: ManifestVersion::default(),
            pack_id: Uuid::new_v4(),
            created_at: Utc::now(),
            global_dims,
            tile_size,
            tile_count_per_axis: counts,
            channels: 1,
            scalar_type: ScalarType::U8,
            tile_format: TileFormat::Raw,
            tiles,
            custom_metadata: HashMap::new(),
        }
    }

    /// Plan tiles for a volume, carrying its channel count and scalar width
    pub fn for_volume(spec: &VolumeSpec, tile_size: Dims3) -> Result<Self> {
        Ok(crate::tiling::plan_tiles(spec.dims, tile_size)?
            .with_channels(spec.channels)
            .with_scalar_type(spec.scalar_type))
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_scalar_type(mut self, scalar_type: ScalarType) -> Self {
        self.scalar_type = scalar_type;
        self
    }

    pub fn with_tile_format(mut self, tile_format: TileFormat) -> Self {
        self.tile_format = tile_format;
        self
    }

    /// Add custom metadata
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_metadata.insert(key.into(), value.into());
    }

    /// Get custom metadata
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(|s| s.as_str())
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn contains(&self, index: &TileIndex) -> bool {
        index.tx < self.tile_count_per_axis[0]
            && index.ty < self.tile_count_per_axis[1]
            && index.tz < self.tile_count_per_axis[2]
    }

    /// Look up a planned tile
    pub fn tile(&self, index: TileIndex) -> Result<&Tile> {
        let out_of_range = || CivdError::TileIndexOutOfRange {
            index,
            grid: self.tile_count_per_axis,
        };
        if !self.contains(&index) {
            return Err(out_of_range());
        }
        let [_, ny, nz] = self.tile_count_per_axis;
        let linear = (index.tx * ny + index.ty) * nz + index.tz;
        self.tiles
            .get(linear)
            .filter(|t| t.index == index)
            .ok_or_else(out_of_range)
    }

    /// Layout of the whole volume
    pub fn volume_spec(&self) -> Result<VolumeSpec> {
        Ok(VolumeSpec::new(self.global_dims, self.channels)?.with_scalar_type(self.scalar_type))
    }

    /// Layout of a single tile's bytes
    pub fn tile_spec(&self, tile: &Tile) -> Result<VolumeSpec> {
        Ok(VolumeSpec::new(tile.tile_dims, self.channels)?.with_scalar_type(self.scalar_type))
    }

    /// Exact byte length of a tile slot's payload
    pub fn tile_byte_len(&self, tile: &Tile) -> usize {
        tile.voxel_count() * self.channels * self.scalar_type.size_in_bytes()
    }

    /// Ensure a volume matches what this manifest describes
    pub fn check_volume(&self, spec: &VolumeSpec) -> Result<()> {
        if spec.dims != self.global_dims
            || spec.channels != self.channels
            || spec.scalar_type != self.scalar_type
        {
            return Err(CivdError::InvalidDimensions(format!(
                "Volume {} does not match manifest {:?} x {} channels ({})",
                spec.summary(),
                self.global_dims,
                self.channels,
                self.scalar_type
            )));
        }
        Ok(())
    }

    /// Check schema, version and that the tile list is exactly the planned grid
    pub fn validate(&self) -> Result<()> {
        if self.schema != MANIFEST_SCHEMA {
            return Err(CivdError::InvalidFormat(format!(
                "Unexpected manifest schema '{}'",
                self.schema
            )));
        }
        if !self.version.is_compatible(&ManifestVersion::CURRENT) {
            return Err(CivdError::InvalidFormat(format!(
                "Incompatible manifest version {}.{}",
                self.version.major, self.version.minor
            )));
        }
        if self.channels == 0 {
            return Err(CivdError::InvalidDimensions(
                "Manifest channel count must be > 0".to_string(),
            ));
        }

        let (counts, planned) = plan_geometry(self.global_dims, self.tile_size)?;
        if counts != self.tile_count_per_axis {
            return Err(CivdError::InvalidFormat(format!(
                "tile_count_per_axis {:?} does not match planned {:?}",
                self.tile_count_per_axis, counts
            )));
        }
        if planned.len() != self.tiles.len() {
            return Err(CivdError::InvalidFormat(format!(
                "Manifest lists {} tiles, grid has {}",
                self.tiles.len(),
                planned.len()
            )));
        }
        if let Some((found, expected)) = self.tiles.iter().zip(&planned).find(|(a, b)| a != b) {
            return Err(CivdError::InvalidFormat(format!(
                "Tile {} has origin {:?} dims {:?}, expected tile {} at {:?} dims {:?}",
                found.index,
                found.origin_voxel,
                found.tile_dims,
                expected.index,
                expected.origin_voxel,
                expected.tile_dims
            )));
        }
        Ok(())
    }

    /// Serialize as pretty JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and validate
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }
}
