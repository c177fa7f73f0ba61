//! Snapshot integration tests
//!
//! Snapshots written to disk in both header encodings, then read back by
//! region and compared against reads of the bare volume.

use civd::snapshot::{read_header, read_roi};
use civd::{
    read_region_clamped, RoiBox, ScalarType, Snapshot, SnapshotBuilder, SnapshotDtype,
    SnapshotFormat, TilingManifest, VolumeSpec,
};

fn wide_volume(dims: [usize; 3], channels: usize, scalar_type: ScalarType) -> (VolumeSpec, Vec<u8>) {
    let spec = VolumeSpec::new(dims, channels).unwrap().with_scalar_type(scalar_type);
    let data = (0..spec.total_size_bytes()).map(|i| (i * 37 % 253) as u8).collect();
    (spec, data)
}

#[tokio::test]
async fn test_snapshot_rois_match_bare_volume() {
    let temp_dir = tempfile::tempdir().unwrap();

    for (format, scalar_type) in [
        (SnapshotFormat::Binary, ScalarType::U8),
        (SnapshotFormat::Binary, ScalarType::U64),
        (SnapshotFormat::Json, ScalarType::U16),
        (SnapshotFormat::Json, ScalarType::U32),
    ] {
        let (spec, volume) = wide_volume([11, 7, 5], 3, scalar_type);
        let path = temp_dir.path().join(format!("{:?}_{}.civd", format, scalar_type.size_in_bytes()));
        SnapshotBuilder::new()
            .with_format(format)
            .with_metadata("source", "integration")
            .write(&path, &spec, &volume)
            .await
            .unwrap();

        let snapshot = Snapshot::load(&path).await.unwrap();
        assert_eq!(snapshot.header().format, format);
        assert_eq!(snapshot.header().dtype.scalar_type(), scalar_type);

        for roi in [
            RoiBox::new([0, 0, 0], [11, 7, 5]),
            RoiBox::new([3, 2, 1], [4, 4, 3]),
            RoiBox::new([-5, 4, 3], [8, 8, 8]).with_channels([2, 0]).unwrap(),
            RoiBox::new([20, 0, 0], [2, 2, 2]),
        ] {
            let direct = read_region_clamped(&volume, &spec, &roi).unwrap();
            assert_eq!(snapshot.read_roi(&roi).unwrap(), direct, "{:?} {:?}", format, roi);
        }
    }
}

#[tokio::test]
async fn test_snapshot_header_without_volume() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("header.civd");
    let (spec, volume) = wide_volume([32, 32, 16], 1, ScalarType::U16);

    let written = SnapshotBuilder::new()
        .with_schema("CT_SERIES", "1.2")
        .with_metadata("patient", "anon-7")
        .write(&path, &spec, &volume)
        .await
        .unwrap();

    let bytes = tokio::fs::read(&path).await.unwrap();
    let header = read_header(&bytes[..written.header_len]).unwrap();
    assert_eq!(header, written);
    assert_eq!(header.schema_id, "CT_SERIES");
    assert_eq!(header.dtype, SnapshotDtype::U16);
    assert_eq!(header.volume_spec().unwrap().total_size_bytes(), volume.len());

    let corner = read_roi(&bytes, &RoiBox::new([30, 30, 14], [4, 4, 4])).unwrap();
    assert_eq!(corner.shape(), [2, 2, 2, 1]);
}

#[test]
fn test_snapshot_volume_tiles_like_any_volume() {
    let (spec, volume) = wide_volume([16, 16, 16], 2, ScalarType::U8);
    let bytes = SnapshotBuilder::new().encode(&spec, &volume).unwrap();
    let snapshot = Snapshot::decode(bytes).unwrap();

    let header_spec = snapshot.header().volume_spec().unwrap().with_offset_bytes(0);
    assert_eq!(header_spec, spec);
    let manifest = TilingManifest::for_volume(&header_spec, [8, 8, 8]).unwrap();
    assert_eq!(manifest.tile_count(), 8);
    assert_eq!(&snapshot.volume()[..], &volume[..]);
}
