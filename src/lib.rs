//! CIVD - volumetric byte capsules
//!
//! A pure Rust implementation of the CIVD container: an arbitrary byte
//! payload stored as a dense multi-channel 3D voxel volume, optionally
//! bundling several named files, with region-of-interest reads and tiling.
//!
//! # Features
//!
//! - Versioned header with backward-compatible decoding of the fixed-geometry generations
//! - Embedded file table with per-file CRC32 and an opt-in best-effort decode
//! - Adaptive cube geometry and configurable channel initialization
//! - Clamped ROI extraction with channel subsetting, viewable as `ndarray` tensors
//! - Tiling with a JSON manifest and concurrent tile-pack writes through async I/O
//! - Memory-mapped capsule reads
//! - Snapshot containers holding one dense volume of 1/2/4/8-byte scalars
//!
//! # Storage
//!
//! Tile packs are written through the [`IOManager`] trait. A filesystem and an
//! in-memory backend ship with the crate; implement the trait for anything else.
//!
//! # Example
//!
//! ```rust,ignore
//! use civd::{Capsule, CodecConfig, RoiBox};
//!
//! # fn example() -> civd::Result<()> {
//! let bytes = Capsule::encode_payload(b"HELLO V03", &CodecConfig::new().with_dims([32, 32, 32]))?;
//! let capsule = Capsule::decode(&bytes)?;
//! assert_eq!(&capsule.payload()[..], b"HELLO V03");
//!
//! let corner = capsule.read_region(&RoiBox::new([-4, -4, -4], [8, 8, 8]))?;
//! assert_eq!(corner.shape(), [4, 4, 4, 4]);
//! # Ok(())
//! # }
//! ```

pub mod capsule;
pub mod config;
pub mod error;
pub mod filetable;
pub mod header;
pub mod io;
pub mod layout;
pub mod manifest;
pub mod roi;
pub mod snapshot;
pub mod tile_header;
pub mod tile_pack;
pub mod tiling;
pub mod types;
pub mod utils;
pub mod volume;

// Re-exports
pub use capsule::{encode_legacy, Capsule, CapsuleBuilder, MappedCapsule};
pub use config::{CodecConfig, GeometryPolicy};
pub use error::{CivdError, Result};
pub use filetable::{DecodeMode, FileFlags, FileMap, FileTable, FileType, NamedFile};
pub use header::{ContainerHeader, FormatVersion, CAPSULE_MAGIC};
pub use io::{IOManager, StorageBackend};
pub use layout::{VolumeSpec, VoxelLayout};
pub use manifest::{TileFormat, TilingManifest};
pub use roi::{clamp, read_region, read_region_clamped, Region, RegionTensor, RoiBox};
pub use snapshot::{Snapshot, SnapshotBuilder, SnapshotDtype, SnapshotFormat, SnapshotHeader};
pub use tile_pack::{load_tile_pack, read_region_from_tiles, write_tile_pack, TilePackReport};
pub use tiling::{plan_tiles, reconstruct, tiles_intersecting, Tile, TileIndex, TilePack};
pub use types::{Dims3, ScalarType};
pub use volume::{geometry_for, ChannelFill, ChannelPlane};

/// Version of the CIVD implementation
pub const CIVD_VERSION: &str = env!("CARGO_PKG_VERSION");
