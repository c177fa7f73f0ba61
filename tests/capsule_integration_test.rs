//! Capsule compatibility tests
//!
//! Legacy capsules here are assembled byte by byte the way writers of those
//! generations laid them out, independent of the crate's own encoder.

use civd::{
    encode_legacy, Capsule, CapsuleBuilder, CivdError, CodecConfig,
    ContainerHeader, DecodeMode, FormatVersion, MappedCapsule, RoiBox,
};

/// `<4s H H H H B 3s I I>` header, linear volume, CRC32 footer
fn handmade_legacy(version: u16, channels: u8, payload: &[u8], fill: impl Fn(usize) -> u8) -> Vec<u8> {
    let voxels = 16 * 16 * 16;
    let mut volume = vec![0u8; voxels * channels as usize];
    for v in 0..voxels {
        for c in 1..channels as usize {
            volume[v * channels as usize + c] = fill(c);
        }
    }
    for (i, &b) in payload.iter().enumerate() {
        volume[i * channels as usize] = b;
    }

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"CI3\0");
    bytes.extend_from_slice(&version.to_le_bytes());
    for _ in 0..3 {
        bytes.extend_from_slice(&16u16.to_le_bytes());
    }
    bytes.push(channels);
    bytes.extend_from_slice(&[0u8; 3]);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    assert_eq!(bytes.len(), 24);

    bytes.extend_from_slice(&volume);
    bytes.extend_from_slice(&crc32fast::hash(&volume).to_le_bytes());
    bytes
}

#[test]
fn test_legacy_v1_full_capsule() {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i * 37 % 256) as u8).collect();
    let bytes = handmade_legacy(1, 1, &payload, |_| 0);
    assert_eq!(bytes.len(), 24 + 4096 + 4);

    let capsule = Capsule::decode(&bytes).unwrap();
    let header = capsule.header();
    assert_eq!(header.version, FormatVersion::FixedGeometry);
    assert_eq!(header.dims, [16, 16, 16]);
    assert_eq!(header.channels, 1);
    // A contemporary decoder returned volume[:orig_length]
    assert_eq!(&capsule.payload()[..], &bytes[24..24 + 4096]);
    assert_eq!(&capsule.payload()[..], &payload[..]);
}

#[test]
fn test_legacy_v2_anatomy_capsule() {
    let payload = b"anatomical payload";
    let bytes = handmade_legacy(2, 4, payload, |c| if c == 1 { 0xFF } else { 0 });

    let capsule = Capsule::decode(&bytes).unwrap();
    assert_eq!(capsule.header().channels, 4);
    assert_eq!(&capsule.payload()[..], payload);

    // The crate's own legacy encoder reproduces the same bytes
    assert_eq!(encode_legacy(payload, FormatVersion::FixedAnatomy).unwrap(), bytes);
}

#[test]
fn test_crc_covers_whole_block_in_every_generation() {
    let legacy = handmade_legacy(2, 4, b"x", |c| if c == 1 { 0xFF } else { 0 });
    // flip an integrity-channel byte far from the payload
    let mut corrupted = legacy.clone();
    corrupted[24 + 4000 * 4 + 1] ^= 0x01;
    assert!(matches!(
        Capsule::decode(&corrupted),
        Err(CivdError::IntegrityMismatch { .. })
    ));

    let current = Capsule::encode_payload(b"x", &CodecConfig::new().with_dims([8, 8, 8])).unwrap();
    let mut corrupted = current.clone();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0x80;
    assert!(matches!(
        Capsule::decode(&corrupted),
        Err(CivdError::IntegrityMismatch { .. })
    ));
}

#[test]
fn test_legacy_footer_corruption() {
    let mut bytes = handmade_legacy(1, 1, b"footer", |_| 0);
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    assert!(matches!(
        Capsule::decode(&bytes),
        Err(CivdError::IntegrityMismatch { .. })
    ));
}

#[test]
fn test_hello_v03_scenario() {
    let config = CodecConfig::new().with_channels(4).with_dims([32, 32, 32]);
    let bytes = Capsule::encode_payload(b"HELLO V03", &config).unwrap();

    let header = ContainerHeader::parse(&bytes).unwrap();
    assert_eq!(header.header_size, 52);
    assert_eq!(header.payload_bytes, 9);
    assert_eq!(header.crc32, crc32fast::hash(&bytes[52..]));

    let capsule = Capsule::decode(&bytes).unwrap();
    assert_eq!(&capsule.payload()[..], b"HELLO V03");
    assert_eq!(capsule.header().channels, 4);
}

#[test]
fn test_every_single_bit_flip_in_small_block() {
    let config = CodecConfig::new().with_channels(2).with_dims([2, 2, 2]);
    let bytes = Capsule::encode_payload(b"bits", &config).unwrap();
    for byte in 52..bytes.len() {
        for bit in 0..8 {
            let mut corrupted = bytes.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                matches!(Capsule::decode(&corrupted), Err(CivdError::IntegrityMismatch { .. })),
                "flip at byte {} bit {} went undetected",
                byte,
                bit
            );
        }
    }
}

#[test]
fn test_roundtrip_across_geometries() {
    for channels in [1usize, 2, 3, 4, 7] {
        for len in [0usize, 1, 63, 64, 65, 500, 4097] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let config = CodecConfig::new().with_channels(channels);
            let bytes = Capsule::encode_payload(&payload, &config).unwrap();
            let capsule = Capsule::decode(&bytes).unwrap();
            assert_eq!(&capsule.payload()[..], &payload[..], "c={} n={}", channels, len);
        }
    }
}

#[test]
fn test_unknown_version_and_magic() {
    let mut bytes = Capsule::encode_payload(b"v", &CodecConfig::new()).unwrap();
    bytes[4..6].copy_from_slice(&9u16.to_le_bytes());
    assert!(matches!(
        Capsule::decode(&bytes),
        Err(CivdError::UnsupportedVersion(9))
    ));

    assert!(matches!(
        Capsule::decode(b"PK\x03\x04 definitely not a capsule"),
        Err(CivdError::InvalidMagic { .. })
    ));
}

#[test]
fn test_multi_file_capsule_with_corruption() {
    let bytes = CapsuleBuilder::new()
        .with_config(CodecConfig::new().with_channels(1))
        .add_file("one.txt", &b"first file"[..])
        .add_file("two.txt", &b"second file"[..])
        .build()
        .unwrap();

    let capsule = Capsule::decode(&bytes).unwrap();
    assert_eq!(capsule.files().unwrap().len(), 2);
    assert_eq!(&capsule.file("two.txt").unwrap()[..], b"second file");

    // Break the stored checksum of "two.txt" in the table; the voxel CRC still holds
    let table_start = 52;
    let entry_one = 2 + "one.txt".len() + 2 + 4 + 4 + 2 + 4;
    let checksum_at = table_start + 8 + entry_one + 2 + "two.txt".len() + 2 + 4 + 4 + 2;
    let mut tampered = bytes.clone();
    tampered[checksum_at] ^= 0x01;

    match Capsule::decode(&tampered) {
        Err(CivdError::CorruptFileEntry { name, .. }) => assert_eq!(name, "two.txt"),
        other => panic!("expected CorruptFileEntry, got {:?}", other.map(|c| c.header().version)),
    }

    let best_effort = CodecConfig::new().with_decode_mode(DecodeMode::BestEffort);
    let capsule = Capsule::decode_with(&tampered, &best_effort).unwrap();
    assert_eq!(capsule.corrupt_entries()[0].name, "two.txt");
    assert_eq!(&capsule.file("one.txt").unwrap()[..], b"first file");
}

#[tokio::test]
async fn test_capsule_files_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.civd");
    let bytes = CapsuleBuilder::new()
        .add_file("notes.md", &b"# notes"[..])
        .with_metadata(&serde_json::json!({ "generator": "integration" }))
        .unwrap()
        .build()
        .unwrap();
    tokio::fs::write(&path, &bytes).await.unwrap();

    let loaded = Capsule::load(&path).await.unwrap();
    assert_eq!(&loaded.file("notes.md").unwrap()[..], b"# notes");

    let mapped = MappedCapsule::open(&path).unwrap();
    assert_eq!(mapped.header(), loaded.header());
    assert_eq!(mapped.payload().unwrap(), &loaded.payload()[..]);

    let roi = RoiBox::new([0, 0, 0], [2, 2, 2]);
    assert_eq!(
        mapped.read_region(&roi).unwrap(),
        loaded.read_region(&roi).unwrap()
    );
}
