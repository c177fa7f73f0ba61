//! Example: Encode payloads and file bundles into capsules and read them back
//!
//! Run with: cargo run --example capsule_roundtrip

use civd::{
    encode_legacy, Capsule, CapsuleBuilder, CodecConfig, DecodeMode, FormatVersion, MappedCapsule,
    RoiBox,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("CIVD Example: Capsule Roundtrip");
    println!("===============================\n");

    // Single payload, adaptive cube
    let message = b"HELLO V03";
    let bytes = Capsule::encode_payload(message, &CodecConfig::new())?;
    let capsule = Capsule::decode(&bytes)?;
    println!("Single payload:");
    println!("  {} bytes -> {} capsule bytes", message.len(), bytes.len());
    println!("  {}", capsule.volume_spec().summary());
    println!("  Decoded: {:?}", String::from_utf8_lossy(capsule.payload()));
    println!();

    // Fixed geometry as used by most capsule writers
    let config = CodecConfig::new().with_dims([32, 32, 32]);
    let bytes = Capsule::encode_payload(message, &config)?;
    println!("Fixed 32^3 capsule: {} bytes", bytes.len());
    println!();

    // Multi-file bundle with metadata
    let bundle = CapsuleBuilder::new()
        .add_file("readme.md", &b"# Capsule demo\n"[..])
        .add_file("points.xyz", &b"0 0 0\n1 1 1\n"[..])
        .with_metadata(&serde_json::json!({ "title": "demo bundle", "revision": 3 }))?
        .build()?;
    let decoded = Capsule::decode_with(&bundle, &CodecConfig::new().with_decode_mode(DecodeMode::BestEffort))?;

    println!("Bundle ({}):", decoded.header().version);
    if let Some(files) = decoded.files() {
        for (name, data) in files.iter() {
            println!("  {:<16} {} bytes", name, data.len());
        }
    }
    println!("  Corrupt entries: {}", decoded.corrupt_entries().len());
    println!();

    // Legacy generation
    let legacy = encode_legacy(b"written by an old encoder", FormatVersion::FixedAnatomy)?;
    let legacy_capsule = Capsule::decode(&legacy)?;
    println!(
        "Legacy {} capsule: {:?} x {} channels",
        legacy_capsule.header().version,
        legacy_capsule.header().dims,
        legacy_capsule.header().channels
    );
    println!();

    // Write to disk, map it and read a corner that overhangs the volume
    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("bundle.civd");
    tokio::fs::write(&path, &bundle).await?;

    let mapped = MappedCapsule::open(&path)?;
    let corner = mapped.read_region(&RoiBox::new([-2, -2, -2], [4, 4, 4]).with_channels([0, 1])?)?;
    println!("Mapped region read:");
    println!("  Shape (d, h, w, c): {:?}", corner.shape());
    println!("  First voxel channels: {:?}", &corner.as_bytes()[..2]);

    println!("\n✓ Example complete!");
    Ok(())
}
