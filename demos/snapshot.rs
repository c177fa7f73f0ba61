//! Example: Store a dense volume as a snapshot and read a region back
//!
//! Run with: cargo run --example snapshot

use civd::snapshot::read_roi;
use civd::{RoiBox, ScalarType, Snapshot, SnapshotBuilder, SnapshotFormat, VolumeSpec};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("CIVD Example: Snapshot");
    println!("======================\n");

    let spec = VolumeSpec::new([48, 32, 24], 2)?.with_scalar_type(ScalarType::U16);
    let volume: Vec<u8> = (0..spec.scalar_count())
        .flat_map(|i| ((i % 4096) as u16).to_le_bytes())
        .collect();
    println!("Volume: {}", spec.summary());

    let temp_dir = tempfile::tempdir()?;
    for format in [SnapshotFormat::Binary, SnapshotFormat::Json] {
        let path = temp_dir.path().join(format!("{:?}.civd", format).to_lowercase());
        let header = SnapshotBuilder::new()
            .with_format(format)
            .with_metadata("mission", "demo")
            .with_metadata("frame", 3)
            .write(&path, &spec, &volume)
            .await?;
        println!(
            "{:?} snapshot: {} header bytes, schema {} {}, dtype {}",
            format,
            header.header_len,
            header.schema_id,
            header.schema_version,
            header.dtype.name()
        );
    }
    println!();

    let snapshot = Snapshot::load(temp_dir.path().join("binary.civd")).await?;
    println!("Metadata: {:?}", snapshot.header().metadata);

    let roi = RoiBox::new([40, 28, -2], [16, 16, 6]).with_channels([1])?;
    let tensor = snapshot.read_roi(&roi)?;
    let values = tensor.to_array::<u16>()?;
    println!("ROI {:?}+{:?} clamps to shape {:?}", roi.origin, roi.size, tensor.shape());
    println!("  First value: {}", values[[0, 0, 0, 0]]);

    let bytes = tokio::fs::read(temp_dir.path().join("json.civd")).await?;
    let same = read_roi(&bytes, &roi)?;
    println!("  JSON snapshot agrees: {}", same == tensor);

    println!("\n✓ Example complete!");
    Ok(())
}
