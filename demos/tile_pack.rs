//! Example: Split a volume into a tile pack and read regions back from it
//!
//! Run with: cargo run --example tile_pack

use bytes::Bytes;
use civd::io::FileSystemIOManager;
use civd::{
    load_tile_pack, read_region_from_tiles, tiles_intersecting, write_tile_pack, IOManager,
    RoiBox, TileFormat, TilingManifest, VolumeSpec,
};
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("CIVD Example: Tile Pack");
    println!("=======================\n");

    let spec = VolumeSpec::new([64, 64, 64], 2)?;
    let data: Vec<u8> = (0..spec.total_size_bytes()).map(|i| (i % 251) as u8).collect();
    println!("Volume: {}", spec.summary());

    let mut manifest = TilingManifest::for_volume(&spec, [32, 32, 32])?.with_tile_format(TileFormat::Framed);
    manifest.add_metadata("source", "synthetic gradient");
    println!(
        "Tiles: {} ({:?} per axis)",
        manifest.tile_count(),
        manifest.tile_count_per_axis
    );
    println!();

    let temp_dir = tempfile::tempdir()?;
    let store: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(temp_dir.path()));

    let start = Instant::now();
    let report = write_tile_pack(Bytes::from(data), &spec, &manifest, Arc::clone(&store)).await?;
    println!(
        "Wrote {} tiles in {:?} (manifest written: {})",
        report.written_count(),
        start.elapsed(),
        report.manifest_written
    );
    for (index, reason) in &report.failed {
        println!("  ✗ tile {}: {}", index, reason);
    }
    println!("Slots: {:?}", store.list("").await?);
    println!();

    let loaded = load_tile_pack(store.as_ref()).await?;
    let roi = RoiBox::new([40, 40, 40], [10, 10, 10]);
    let region = civd::clamp(&roi, &loaded.global_dims);
    println!("ROI {:?}+{:?}", roi.origin, roi.size);
    println!("  Touches tiles: {:?}", tiles_intersecting(&loaded, &region));

    let tensor = read_region_from_tiles(store.as_ref(), &loaded, &roi).await?;
    let view = tensor.view_u8()?;
    println!("  Shape (d, h, w, c): {:?}", tensor.shape());
    println!("  Value at first voxel: {:?}", [view[[0, 0, 0, 0]], view[[0, 0, 0, 1]]]);

    println!("\n✓ Example complete!");
    Ok(())
}
