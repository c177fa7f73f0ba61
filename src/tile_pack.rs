//! Tile packs on an [`IOManager`]
//!
//! Writing fans out one task per planned tile and joins them before the
//! manifest is written. Tiles are disjoint, so tasks share nothing but the
//! read-only source buffer. A failed tile is reported without cancelling its
//! siblings, and the manifest is only written once every tile landed.

use crate::error::{CivdError, Result};
use crate::io::IOManager;
use crate::layout::VolumeSpec;
use crate::manifest::{TileFormat, TilingManifest};
use crate::roi::{clamp, read_region, resolve_channels, write_region, Region, RegionTensor, RoiBox};
use crate::tile_header::{frame_tile, unframe_tile, TileHeader};
use crate::tiling::{tiles_intersecting, Tile, TileIndex, TilePack};
use crate::utils::{tile_file_name, MANIFEST_FILE_NAME};
use bytes::Bytes;
use futures::future::{join_all, try_join_all};
use std::sync::Arc;

/// Outcome of [`write_tile_pack`]
#[derive(Debug, Clone, Default)]
pub struct TilePackReport {
    /// Tiles stored successfully, in `(tx, ty, tz)` order
    pub written: Vec<TileIndex>,

    /// Tiles that failed, with the reason
    pub failed: Vec<(TileIndex, String)>,

    /// Whether the manifest was written
    pub manifest_written: bool,
}

impl TilePackReport {
    pub fn written_count(&self) -> usize {
        self.written.len()
    }

    /// Every tile and the manifest were written
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.manifest_written
    }
}

async fn write_one(
    buffer: &[u8],
    spec: &VolumeSpec,
    manifest: &TilingManifest,
    tile: &Tile,
    sink: &dyn IOManager,
) -> Result<()> {
    let tensor = read_region(buffer, spec, &tile.region())?;
    let slot = tile_file_name(&tile.index);
    match manifest.tile_format {
        TileFormat::Raw => sink.write(&slot, tensor.as_bytes()).await?,
        TileFormat::Framed => {
            let framed = frame_tile(&TileHeader::for_tile(tile, manifest), tensor.as_bytes())?;
            sink.write(&slot, &framed).await?
        }
    }
    log::trace!("Wrote tile {} ({} bytes) to {}", tile.index, tensor.as_bytes().len(), slot);
    Ok(())
}

/// Cut a volume into the manifest's tiles and store each under its slot name.
///
/// Returns `Err` only when the inputs are inconsistent; per-tile failures
/// are collected in the report.
pub async fn write_tile_pack(
    buffer: Bytes,
    spec: &VolumeSpec,
    manifest: &TilingManifest,
    sink: Arc<dyn IOManager>,
) -> Result<TilePackReport> {
    manifest.validate()?;
    manifest.check_volume(spec)?;
    spec.validate_buffer(&buffer)?;

    let shared = Arc::new(manifest.clone());
    let spec = *spec;

    let handles: Vec<_> = manifest
        .tiles
        .iter()
        .map(|tile| {
            let buffer = buffer.clone();
            let manifest = Arc::clone(&shared);
            let sink = Arc::clone(&sink);
            let tile = *tile;
            tokio::spawn(async move { write_one(&buffer, &spec, &manifest, &tile, sink.as_ref()).await })
        })
        .collect();

    let mut report = TilePackReport::default();
    let outcomes = join_all(handles).await;
    for (tile, outcome) in manifest.tiles.iter().zip(outcomes) {
        match outcome {
            Ok(Ok(())) => report.written.push(tile.index),
            Ok(Err(e)) => {
                log::warn!("Tile {} failed: {}", tile.index, e);
                report.failed.push((tile.index, e.to_string()));
            }
            Err(join_error) => {
                log::warn!("Tile {} task aborted: {}", tile.index, join_error);
                report.failed.push((tile.index, join_error.to_string()));
            }
        }
    }

    if report.failed.is_empty() {
        sink.write(MANIFEST_FILE_NAME, &manifest.to_json()?).await?;
        report.manifest_written = true;
        log::debug!(
            "Wrote tile pack {} with {} tiles",
            manifest.pack_id,
            report.written_count()
        );
    } else {
        log::warn!(
            "Tile pack {} incomplete: {} of {} tiles failed, manifest not written",
            manifest.pack_id,
            report.failed.len(),
            manifest.tile_count()
        );
    }
    Ok(report)
}

/// Read and validate the manifest of a stored tile pack
pub async fn load_tile_pack(source: &dyn IOManager) -> Result<TilingManifest> {
    let bytes = source.read(MANIFEST_FILE_NAME).await?;
    TilingManifest::from_json(&bytes)
}

/// Fetch one tile's payload, checking it against the manifest.
///
/// The manifest's tile format decides how a slot is read: raw slots are
/// taken byte for byte, whatever they start with, and framed slots must
/// carry a header matching the planned tile.
pub async fn read_tile(source: &dyn IOManager, manifest: &TilingManifest, index: TileIndex) -> Result<Bytes> {
    let tile = manifest.tile(index)?;
    let slot = tile_file_name(&index);
    let blob = source.read(&slot).await?;

    let start = match manifest.tile_format {
        TileFormat::Raw => 0,
        TileFormat::Framed => {
            let (header, body) = unframe_tile(&blob)?;
            let header = header
                .ok_or_else(|| CivdError::InvalidFormat(format!("Slot {} has no tile header", slot)))?;
            header.check_against(tile, manifest)?;
            blob.len() - body.len()
        }
    };

    let body = blob.slice(start..);
    let expected = manifest.tile_byte_len(tile);
    if body.len() != expected {
        return Err(CivdError::BufferSizeMismatch {
            expected,
            actual: body.len(),
        });
    }
    Ok(body)
}

/// Fetch several tiles concurrently
pub async fn read_tiles(source: &dyn IOManager, manifest: &TilingManifest, indices: &[TileIndex]) -> Result<TilePack> {
    let futures: Vec<_> = indices
        .iter()
        .map(|&index| async move {
            let data = read_tile(source, manifest, index).await?;
            Ok::<_, CivdError>((index, data))
        })
        .collect();

    let results = try_join_all(futures).await?;
    let mut pack = TilePack::new();
    for (index, data) in results {
        pack.insert(index, data);
    }
    Ok(pack)
}

/// Clamp an ROI to the tiled volume and assemble it from only the tiles it touches
pub async fn read_region_from_tiles(
    source: &dyn IOManager,
    manifest: &TilingManifest,
    roi: &RoiBox,
) -> Result<RegionTensor> {
    let region = clamp(roi, &manifest.global_dims);
    let selected = resolve_channels(&region, manifest.channels)?.map_or(manifest.channels, |s| s.len());

    let [w, h, d] = region.size;
    let shape = [d, h, w, selected];
    if region.is_empty() {
        return RegionTensor::from_parts(shape, manifest.scalar_type, Bytes::new());
    }

    let indices = tiles_intersecting(manifest, &region);
    let pack = read_tiles(source, manifest, &indices).await?;

    let out_spec = VolumeSpec::new(region.size, selected)?.with_scalar_type(manifest.scalar_type);
    let mut out = vec![0u8; out_spec.total_size_bytes()];

    for index in &indices {
        let tile = manifest.tile(*index)?;
        let data = pack
            .get(index)
            .ok_or_else(|| CivdError::NotFound(format!("tile {}", index)))?;
        let Some(overlap) = region.intersect(&tile.region()) else {
            continue;
        };

        let mut local = Region::new(sub(&overlap.origin, &tile.origin_voxel), overlap.size);
        if let Some(subset) = region.channel_subset() {
            local = local.with_channels(subset.iter().copied())?;
        }
        let part = read_region(data, &manifest.tile_spec(tile)?, &local)?;

        let dest = Region::new(sub(&overlap.origin, &region.origin), overlap.size);
        write_region(&mut out, &out_spec, &dest, part.as_bytes())?;
    }

    log::debug!(
        "Assembled region {:?}+{:?} from {} tiles",
        region.origin,
        region.size,
        indices.len()
    );
    RegionTensor::from_parts(shape, manifest.scalar_type, Bytes::from(out))
}

fn sub(a: &[usize; 3], b: &[usize; 3]) -> [usize; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}
