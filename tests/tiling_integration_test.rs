//! Tiling integration tests
//!
//! Tile packs written through both shipped storage backends, then read back
//! whole and by region.

use bytes::Bytes;
use civd::io::{FileSystemIOManager, MemoryIOManager};
use civd::tile_pack::read_tiles;
use civd::{
    load_tile_pack, plan_tiles, read_region_clamped, read_region_from_tiles, reconstruct,
    tiles_intersecting, write_tile_pack, Capsule, CodecConfig, IOManager, RoiBox, TileFormat,
    TileIndex, TilingManifest, VolumeSpec,
};
use std::sync::Arc;

fn gradient_volume(dims: [usize; 3], channels: usize) -> (VolumeSpec, Bytes) {
    let spec = VolumeSpec::new(dims, channels).unwrap();
    let mut data = vec![0u8; spec.total_size_bytes()];
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                for c in 0..channels {
                    data[spec.scalar_index(x, y, z, c)] = ((x + 3 * y + 7 * z + 11 * c) % 256) as u8;
                }
            }
        }
    }
    (spec, Bytes::from(data))
}

#[test]
fn test_plan_64_cube_into_eight_tiles() {
    let manifest = plan_tiles([64, 64, 64], [32, 32, 32]).unwrap();
    assert_eq!(manifest.tile_count(), 8);
    assert_eq!(manifest.tile_count_per_axis, [2, 2, 2]);
    assert!(manifest.tiles.iter().all(|t| t.tile_dims == [32, 32, 32]));

    let roi = civd::clamp(&RoiBox::new([40, 40, 40], [10, 10, 10]), &manifest.global_dims);
    assert_eq!(tiles_intersecting(&manifest, &roi), vec![TileIndex::new(1, 1, 1)]);
}

#[test]
fn test_partial_boundary_tiles() {
    let manifest = plan_tiles([10, 8, 6], [4, 4, 4]).unwrap();
    assert_eq!(manifest.tile_count_per_axis, [3, 2, 2]);
    let last = manifest.tile(TileIndex::new(2, 1, 1)).unwrap();
    assert_eq!(last.origin_voxel, [8, 4, 4]);
    assert_eq!(last.tile_dims, [2, 4, 2]);

    let covered: usize = manifest.tiles.iter().map(|t| t.voxel_count()).sum();
    assert_eq!(covered, 10 * 8 * 6);
}

#[tokio::test]
async fn test_memory_pack_roundtrip() {
    let (spec, buffer) = gradient_volume([64, 64, 64], 1);
    let manifest = TilingManifest::for_volume(&spec, [32, 32, 32]).unwrap();
    let store = MemoryIOManager::new();

    let report = write_tile_pack(buffer.clone(), &spec, &manifest, Arc::new(store.clone()))
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.written_count(), 8);

    let loaded = load_tile_pack(&store).await.unwrap();
    assert_eq!(loaded.pack_id, manifest.pack_id);

    let all: Vec<TileIndex> = loaded.tiles.iter().map(|t| t.index).collect();
    let pack = read_tiles(&store, &loaded, &all).await.unwrap();
    assert_eq!(reconstruct(&pack, &loaded).unwrap(), buffer.to_vec());

    let roi = RoiBox::new([40, 40, 40], [10, 10, 10]);
    let tiled = read_region_from_tiles(&store, &loaded, &roi).await.unwrap();
    let direct = read_region_clamped(&buffer, &spec, &roi).unwrap();
    assert_eq!(tiled, direct);
    assert_eq!(tiled.view_u8().unwrap()[[0, 0, 0, 0]], ((40 + 120 + 280) % 256) as u8);
}

#[tokio::test]
async fn test_filesystem_pack_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (spec, buffer) = gradient_volume([10, 8, 6], 3);
    let manifest = TilingManifest::for_volume(&spec, [4, 4, 4])
        .unwrap()
        .with_tile_format(TileFormat::Framed);
    let store = Arc::new(FileSystemIOManager::new(dir.path()));

    let report = write_tile_pack(buffer.clone(), &spec, &manifest, store.clone())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert!(dir.path().join("tiling_manifest.json").exists());
    assert!(dir.path().join("tile_tx2_ty1_tz1.bin").exists());

    let loaded = load_tile_pack(store.as_ref()).await.unwrap();
    assert_eq!(loaded.tile_format, TileFormat::Framed);

    let roi = RoiBox::new([-2, 3, 1], [7, 10, 3]).with_channels([1]).unwrap();
    let tiled = read_region_from_tiles(store.as_ref(), &loaded, &roi).await.unwrap();
    assert_eq!(tiled.shape(), [3, 5, 5, 1]);
    assert_eq!(tiled, read_region_clamped(&buffer, &spec, &roi).unwrap());
}

#[tokio::test]
async fn test_missing_tile_fails_region_read() {
    let (spec, buffer) = gradient_volume([16, 16, 16], 1);
    let manifest = TilingManifest::for_volume(&spec, [8, 8, 8]).unwrap();
    let store = MemoryIOManager::new();
    write_tile_pack(buffer, &spec, &manifest, Arc::new(store.clone()))
        .await
        .unwrap();

    store.delete("tile_tx0_ty0_tz0.bin").await.unwrap();
    let roi = RoiBox::new([0, 0, 0], [4, 4, 4]);
    assert!(read_region_from_tiles(&store, &manifest, &roi).await.is_err());

    // Tiles away from the deleted one still serve
    let far = RoiBox::new([12, 12, 12], [4, 4, 4]);
    assert!(read_region_from_tiles(&store, &manifest, &far).await.is_ok());
}

#[tokio::test]
async fn test_tile_a_decoded_capsule() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
    let bytes = Capsule::encode_payload(&payload, &CodecConfig::new().with_channels(2)).unwrap();
    let capsule = Capsule::decode(&bytes).unwrap();
    let spec = capsule.volume_spec();

    let manifest = TilingManifest::for_volume(&spec, [8, 8, 8]).unwrap();
    let store = MemoryIOManager::new();
    let voxels = Bytes::copy_from_slice(capsule.voxels());
    let report = write_tile_pack(voxels.clone(), &spec, &manifest, Arc::new(store.clone()))
        .await
        .unwrap();
    assert!(report.is_complete());

    let loaded = load_tile_pack(&store).await.unwrap();
    let all: Vec<TileIndex> = loaded.tiles.iter().map(|t| t.index).collect();
    let pack = read_tiles(&store, &loaded, &all).await.unwrap();
    assert_eq!(reconstruct(&pack, &loaded).unwrap(), voxels.to_vec());
}
