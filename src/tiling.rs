//! Tiling engine: grid planning, ROI-to-tile resolution and reassembly
//!
//! Tiles are cut on a regular grid. Boundary tiles are truncated to the
//! volume extent, never padded, so the planned tiles cover
//! `[0, dim_x) x [0, dim_y) x [0, dim_z)` exactly once. Tile contents are
//! always produced through [`crate::roi::read_region`] and written back
//! through [`crate::roi::write_region`].

use crate::error::{CivdError, Result};
use crate::layout::VolumeSpec;
use crate::manifest::TilingManifest;
use crate::roi::{read_region, write_region, Region, RegionTensor};
use crate::types::Dims3;
use crate::utils::ceil_div;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Grid position of a tile; orders lexicographically by `(tx, ty, tz)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIndex {
    pub tx: usize,
    pub ty: usize,
    pub tz: usize,
}

impl TileIndex {
    pub fn new(tx: usize, ty: usize, tz: usize) -> Self {
        Self { tx, ty, tz }
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.tx, self.ty, self.tz]
    }
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.tx, self.ty, self.tz)
    }
}

/// One planned tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub index: TileIndex,

    /// Extent of this tile; boundary tiles may be smaller than the nominal size
    pub tile_dims: Dims3,

    /// Position of the tile's first voxel in the global volume
    pub origin_voxel: Dims3,
}

impl Tile {
    /// Region of the global volume this tile covers
    pub fn region(&self) -> Region {
        Region::new(self.origin_voxel, self.tile_dims)
    }

    pub fn voxel_count(&self) -> usize {
        self.tile_dims.iter().product()
    }
}

/// Upper bound on the number of tiles a single plan may produce
pub const MAX_TILE_COUNT: usize = 1 << 20;

/// Per-axis tile counts and the tile list in `(tx, ty, tz)` order
pub(crate) fn plan_geometry(global_dims: Dims3, tile_size: Dims3) -> Result<(Dims3, Vec<Tile>)> {
    if global_dims.iter().any(|&d| d == 0) {
        return Err(CivdError::InvalidDimensions(format!(
            "Global dims must be > 0, got {:?}",
            global_dims
        )));
    }
    if tile_size.iter().any(|&t| t == 0) {
        return Err(CivdError::InvalidDimensions(format!(
            "Tile size must be > 0, got {:?}",
            tile_size
        )));
    }

    let counts = [
        ceil_div(global_dims[0], tile_size[0]),
        ceil_div(global_dims[1], tile_size[1]),
        ceil_div(global_dims[2], tile_size[2]),
    ];

    let total = counts
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| {
            CivdError::InvalidDimensions(format!("Tile count {:?} overflows usize", counts))
        })?;
    if total > MAX_TILE_COUNT {
        return Err(CivdError::InvalidDimensions(format!(
            "{} tiles ({:?} per axis) exceeds the limit of {}",
            total, counts, MAX_TILE_COUNT
        )));
    }

    let axis = |i: usize, t: usize| -> (usize, usize) {
        let origin = t * tile_size[i];
        (origin, tile_size[i].min(global_dims[i] - origin))
    };

    let mut tiles = Vec::with_capacity(total);
    for tx in 0..counts[0] {
        let (ox, wx) = axis(0, tx);
        for ty in 0..counts[1] {
            let (oy, wy) = axis(1, ty);
            for tz in 0..counts[2] {
                let (oz, wz) = axis(2, tz);
                tiles.push(Tile {
                    index: TileIndex::new(tx, ty, tz),
                    tile_dims: [wx, wy, wz],
                    origin_voxel: [ox, oy, oz],
                });
            }
        }
    }
    Ok((counts, tiles))
}

/// Partition a single-channel byte volume of `global_dims` into tiles.
///
/// Use [`TilingManifest::for_volume`] to carry channel count and scalar width.
pub fn plan_tiles(global_dims: Dims3, tile_size: Dims3) -> Result<TilingManifest> {
    let (counts, tiles) = plan_geometry(global_dims, tile_size)?;
    log::debug!(
        "Planned {} tiles ({:?} per axis) for {:?} with tile size {:?}",
        tiles.len(),
        counts,
        global_dims,
        tile_size
    );
    Ok(TilingManifest::from_plan(global_dims, tile_size, counts, tiles))
}

/// Tiles whose extent overlaps the region, in `(tx, ty, tz)` order.
///
/// Pure manifest geometry. Parts of the region outside the volume are ignored.
pub fn tiles_intersecting(manifest: &TilingManifest, region: &Region) -> Vec<TileIndex> {
    if region.is_empty() {
        return Vec::new();
    }

    let mut ranges = [(0usize, 0usize); 3];
    for i in 0..3 {
        let start = region.origin[i];
        let end = region.origin[i].saturating_add(region.size[i]).min(manifest.global_dims[i]);
        if start >= end {
            return Vec::new();
        }
        let first = start / manifest.tile_size[i];
        let last = ((end - 1) / manifest.tile_size[i]).min(manifest.tile_count_per_axis[i] - 1);
        ranges[i] = (first, last);
    }

    let mut indices = Vec::new();
    for tx in ranges[0].0..=ranges[0].1 {
        for ty in ranges[1].0..=ranges[1].1 {
            for tz in ranges[2].0..=ranges[2].1 {
                indices.push(TileIndex::new(tx, ty, tz));
            }
        }
    }
    indices
}

/// Read one tile's voxels out of the full volume
pub fn extract_tile(
    buffer: &[u8],
    spec: &VolumeSpec,
    manifest: &TilingManifest,
    index: TileIndex,
) -> Result<RegionTensor> {
    let tile = manifest.tile(index)?;
    read_region(buffer, spec, &tile.region())
}

/// Tile payloads keyed by index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TilePack {
    tiles: BTreeMap<TileIndex, Bytes>,
}

impl TilePack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut every planned tile out of a volume
    pub fn from_volume(buffer: &[u8], spec: &VolumeSpec, manifest: &TilingManifest) -> Result<Self> {
        manifest.check_volume(spec)?;
        let mut pack = Self::new();
        for tile in &manifest.tiles {
            let tensor = read_region(buffer, spec, &tile.region())?;
            pack.insert(tile.index, tensor.into_bytes());
        }
        Ok(pack)
    }

    pub fn insert(&mut self, index: TileIndex, data: impl Into<Bytes>) -> Option<Bytes> {
        self.tiles.insert(index, data.into())
    }

    pub fn get(&self, index: &TileIndex) -> Option<&Bytes> {
        self.tiles.get(index)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileIndex, &Bytes)> {
        self.tiles.iter()
    }
}

/// Reassemble the full volume from its tiles
pub fn reconstruct(pack: &TilePack, manifest: &TilingManifest) -> Result<Vec<u8>> {
    let spec = manifest.volume_spec()?;
    let mut buffer = vec![0u8; spec.total_size_bytes()];

    for tile in &manifest.tiles {
        let data = pack
            .get(&tile.index)
            .ok_or_else(|| CivdError::NotFound(format!("tile {}", tile.index)))?;
        write_region(&mut buffer, &spec, &tile.region(), data)?;
    }

    log::debug!(
        "Reconstructed {} from {} tiles",
        spec.summary(),
        manifest.tiles.len()
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::full_volume;

    fn patterned(spec: &VolumeSpec) -> Vec<u8> {
        (0..spec.total_size_bytes()).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_even_grid() {
        let manifest = plan_tiles([64, 64, 64], [32, 32, 32]).unwrap();
        assert_eq!(manifest.tile_count_per_axis, [2, 2, 2]);
        assert_eq!(manifest.tiles.len(), 8);
        assert!(manifest.tiles.iter().all(|t| t.tile_dims == [32, 32, 32]));
        assert_eq!(manifest.tiles[0].index, TileIndex::new(0, 0, 0));
        assert_eq!(manifest.tiles[1].index, TileIndex::new(0, 0, 1));
        assert_eq!(manifest.tiles[7].index, TileIndex::new(1, 1, 1));
        assert_eq!(manifest.tiles[7].origin_voxel, [32, 32, 32]);
    }

    #[test]
    fn test_boundary_tiles_are_truncated() {
        let manifest = plan_tiles([70, 10, 5], [32, 4, 8]).unwrap();
        assert_eq!(manifest.tile_count_per_axis, [3, 3, 1]);
        let last = manifest.tile(TileIndex::new(2, 2, 0)).unwrap();
        assert_eq!(last.origin_voxel, [64, 8, 0]);
        assert_eq!(last.tile_dims, [6, 2, 5]);
    }

    #[test]
    fn test_coverage_is_exact() {
        for (dims, tile) in [
            ([7, 5, 3], [2, 2, 2]),
            ([8, 8, 8], [4, 8, 3]),
            ([1, 9, 4], [5, 1, 4]),
            ([5, 5, 5], [9, 9, 9]),
        ] {
            let manifest = plan_tiles(dims, tile).unwrap();
            let mut hits = vec![0u8; dims.iter().product()];
            for t in &manifest.tiles {
                for z in t.origin_voxel[2]..t.origin_voxel[2] + t.tile_dims[2] {
                    for y in t.origin_voxel[1]..t.origin_voxel[1] + t.tile_dims[1] {
                        for x in t.origin_voxel[0]..t.origin_voxel[0] + t.tile_dims[0] {
                            hits[(z * dims[1] + y) * dims[0] + x] += 1;
                        }
                    }
                }
            }
            assert!(hits.iter().all(|&h| h == 1), "dims {:?} tile {:?}", dims, tile);
        }
    }

    #[test]
    fn test_invalid_plans() {
        assert!(plan_tiles([0, 4, 4], [2, 2, 2]).is_err());
        assert!(plan_tiles([4, 4, 4], [2, 0, 2]).is_err());
    }

    #[test]
    fn test_oversized_grid_rejected() {
        assert!(matches!(
            plan_tiles([1 << 22; 3], [1; 3]),
            Err(CivdError::InvalidDimensions(_))
        ));
        assert!(matches!(
            plan_tiles([usize::MAX, usize::MAX, 2], [1, 1, 1]),
            Err(CivdError::InvalidDimensions(_))
        ));
        assert!(matches!(
            plan_tiles([MAX_TILE_COUNT + 1, 1, 1], [1, 1, 1]),
            Err(CivdError::InvalidDimensions(_))
        ));
        let wide = plan_tiles([MAX_TILE_COUNT, 1, 1], [4, 1, 1]).unwrap();
        assert_eq!(wide.tile_count(), MAX_TILE_COUNT / 4);
    }

    #[test]
    fn test_single_tile_hit() {
        let manifest = plan_tiles([64, 64, 64], [32, 32, 32]).unwrap();
        let hits = tiles_intersecting(&manifest, &Region::new([40, 40, 40], [10, 10, 10]));
        assert_eq!(hits, vec![TileIndex::new(1, 1, 1)]);
    }

    #[test]
    fn test_straddling_roi_is_lexicographic() {
        let manifest = plan_tiles([64, 64, 64], [32, 32, 32]).unwrap();
        let hits = tiles_intersecting(&manifest, &Region::new([31, 0, 31], [2, 1, 2]));
        assert_eq!(
            hits,
            vec![
                TileIndex::new(0, 0, 0),
                TileIndex::new(0, 0, 1),
                TileIndex::new(1, 0, 0),
                TileIndex::new(1, 0, 1),
            ]
        );
    }

    #[test]
    fn test_intersection_ignores_outside_parts() {
        let manifest = plan_tiles([64, 64, 64], [32, 32, 32]).unwrap();
        assert!(tiles_intersecting(&manifest, &Region::new([64, 0, 0], [5, 5, 5])).is_empty());
        assert!(tiles_intersecting(&manifest, &Region::new([0, 0, 0], [0, 5, 5])).is_empty());
        assert_eq!(
            tiles_intersecting(&manifest, &Region::new([60, 60, 60], [100, 100, 100])),
            vec![TileIndex::new(1, 1, 1)]
        );
    }

    #[test]
    fn test_tile_index_out_of_range() {
        let manifest = plan_tiles([64, 64, 64], [32, 32, 32]).unwrap();
        assert!(matches!(
            manifest.tile(TileIndex::new(2, 0, 0)),
            Err(CivdError::TileIndexOutOfRange { grid: [2, 2, 2], .. })
        ));
    }

    #[test]
    fn test_extract_tile_matches_region_read() {
        let spec = VolumeSpec::new([10, 6, 4], 2).unwrap();
        let buffer = patterned(&spec);
        let manifest = TilingManifest::for_volume(&spec, [4, 4, 4]).unwrap();
        let index = TileIndex::new(2, 1, 0);

        let tile = extract_tile(&buffer, &spec, &manifest, index).unwrap();
        assert_eq!(tile.shape(), [4, 2, 2, 2]);
        let expected = read_region(&buffer, &spec, &Region::new([8, 4, 0], [2, 2, 4])).unwrap();
        assert_eq!(tile, expected);
    }

    #[test]
    fn test_reconstruct_roundtrip() {
        let spec = VolumeSpec::new([13, 7, 9], 3).unwrap();
        let buffer = patterned(&spec);
        let manifest = TilingManifest::for_volume(&spec, [4, 3, 5]).unwrap();

        let pack = TilePack::from_volume(&buffer, &spec, &manifest).unwrap();
        assert_eq!(pack.len(), manifest.tiles.len());

        let rebuilt = reconstruct(&pack, &manifest).unwrap();
        assert_eq!(rebuilt, buffer);
        let whole = read_region(&rebuilt, &spec, &full_volume(&spec)).unwrap();
        assert_eq!(whole.as_bytes(), &buffer[..]);
    }

    #[test]
    fn test_reconstruct_missing_tile() {
        let spec = VolumeSpec::new([4, 4, 4], 1).unwrap();
        let manifest = TilingManifest::for_volume(&spec, [2, 2, 2]).unwrap();
        let mut pack = TilePack::from_volume(&patterned(&spec), &spec, &manifest).unwrap();
        pack.tiles.remove(&TileIndex::new(1, 0, 1));
        assert!(matches!(
            reconstruct(&pack, &manifest),
            Err(CivdError::NotFound(_))
        ));
    }

    #[test]
    fn test_tile_index_display_and_order() {
        assert_eq!(TileIndex::new(1, 2, 3).to_string(), "(1, 2, 3)");
        assert!(TileIndex::new(0, 9, 9) < TileIndex::new(1, 0, 0));
        assert!(TileIndex::new(1, 0, 9) < TileIndex::new(1, 1, 0));
    }
}
