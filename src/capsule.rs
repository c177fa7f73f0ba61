//! Whole-capsule framing
//!
//! ```text
//! v1/v2: legacy header (24) | voxel block | crc32 footer (4)
//! v3:    header (header_size) | voxel block
//! v4:    header (header_size) | file table | voxel block
//! ```
//!
//! In a v4 capsule the payload stored in the voxel block is the concatenated
//! file bytes, and file-table offsets point into it.

use crate::config::CodecConfig;
use crate::error::{CivdError, Result};
use crate::filetable::{
    decode_with_mode, CorruptEntry, DecodeMode, FileFlags, FileMap, FileTable, FileType, NamedFile,
    CAPSULE_META_FILE,
};
use crate::header::{ContainerHeader, FormatVersion, LEGACY_HEADER_LEN};
use crate::layout::VolumeSpec;
use crate::roi::{read_region_clamped, RegionTensor, RoiBox};
use crate::volume::{self, encode_with_planes, ChannelFill, ChannelPlane, EncodedVolume};
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Where the pieces of a capsule sit inside its bytes
struct Framing {
    table: Option<FileTable>,
    voxel_offset: usize,
}

fn locate(bytes: &[u8], header: &ContainerHeader) -> Result<Framing> {
    let mut voxel_offset = header.header_size as usize;
    let table = if header.has_file_table() {
        let (table, consumed) = FileTable::parse(&bytes[voxel_offset..])?;
        voxel_offset += consumed;
        Some(table)
    } else {
        None
    };

    let needed = voxel_offset + header.voxel_block_len();
    if bytes.len() < needed {
        return Err(CivdError::Truncated {
            context: "voxel block",
            needed,
            available: bytes.len(),
        });
    }
    if !header.is_legacy() && bytes.len() > needed {
        log::debug!("Ignoring {} trailing bytes after voxel block", bytes.len() - needed);
    }
    Ok(Framing {
        table,
        voxel_offset,
    })
}

fn frame(encoded: &EncodedVolume, table_bytes: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut header = ContainerHeader::new(encoded.spec.dims, encoded.spec.channels, encoded.payload_bytes)?
        .with_crc32(encoded.crc32);
    if table_bytes.is_some() {
        header = header.with_file_table();
    }

    let head = header.serialize()?;
    let table_bytes = table_bytes.unwrap_or_default();
    let mut out = Vec::with_capacity(head.len() + table_bytes.len() + encoded.buffer.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(table_bytes);
    out.extend_from_slice(&encoded.buffer);
    Ok(out)
}

/// Encode a fixed-geometry legacy capsule (versions 1 and 2)
pub fn encode_legacy(payload: &[u8], version: FormatVersion) -> Result<Vec<u8>> {
    let header = ContainerHeader::legacy(version, payload.len() as u64)?;
    let encoded = volume::encode(payload, header.dims, header.channels, &ChannelFill::canonical())?;

    let mut out = header.serialize()?;
    out.reserve(encoded.buffer.len() + 4);
    out.extend_from_slice(&encoded.buffer);
    out.write_u32::<LittleEndian>(encoded.crc32)?;
    Ok(out)
}

/// A decoded capsule
#[derive(Debug, Clone)]
pub struct Capsule {
    header: ContainerHeader,
    payload: Bytes,
    voxels: Bytes,
    files: Option<FileMap>,
    corrupt: Vec<CorruptEntry>,
}

impl Capsule {
    /// Encode a single-payload (v3) capsule
    pub fn encode_payload(payload: &[u8], config: &CodecConfig) -> Result<Vec<u8>> {
        config.validate()?;
        let dims = config.dims_for(payload.len() as u64)?;
        let encoded = encode_with_planes(payload, dims, config.channels, &config.channel_fill, &[])?;
        frame(&encoded, None)
    }

    /// Decode with strict file-table handling
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_mode(bytes, DecodeMode::Strict)
    }

    /// Decode using the config's file-table mode
    pub fn decode_with(bytes: &[u8], config: &CodecConfig) -> Result<Self> {
        Self::decode_mode(bytes, config.decode_mode)
    }

    fn decode_mode(bytes: &[u8], mode: DecodeMode) -> Result<Self> {
        let header = ContainerHeader::parse(bytes)?;
        let framing = locate(bytes, &header)?;
        let block = &bytes[framing.voxel_offset..framing.voxel_offset + header.voxel_block_len()];

        let payload = Bytes::from(volume::decode(&header, block)?);
        let (files, corrupt) = match &framing.table {
            Some(table) => {
                let decoded = decode_with_mode(table, &payload, mode)?;
                (Some(decoded.files), decoded.corrupt)
            }
            None => (None, Vec::new()),
        };

        Ok(Self {
            header,
            payload,
            voxels: Bytes::copy_from_slice(block),
            files,
            corrupt,
        })
    }

    /// Read and decode a capsule file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Self::decode(&bytes)
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// The payload bytes (for v4 capsules, the concatenated file block)
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Embedded files, if the capsule has a file table
    pub fn files(&self) -> Option<&FileMap> {
        self.files.as_ref()
    }

    pub fn file(&self, name: &str) -> Option<&Bytes> {
        self.files.as_ref().and_then(|f| f.get(name))
    }

    /// Entries skipped by a best-effort decode
    pub fn corrupt_entries(&self) -> &[CorruptEntry] {
        &self.corrupt
    }

    /// The raw voxel block
    pub fn voxels(&self) -> &[u8] {
        &self.voxels
    }

    /// Layout of [`Capsule::voxels`]
    pub fn volume_spec(&self) -> VolumeSpec {
        VolumeSpec::from_header(&self.header, 0)
    }

    /// Clamp the ROI and read it from the voxel block
    pub fn read_region(&self, roi: &RoiBox) -> Result<RegionTensor> {
        read_region_clamped(&self.voxels, &self.volume_spec(), roi)
    }
}

/// Builds a multi-file (v4) capsule
#[derive(Debug, Clone, Default)]
pub struct CapsuleBuilder {
    files: Vec<NamedFile>,
    planes: Vec<ChannelPlane>,
    config: CodecConfig,
}

impl CapsuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: CodecConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a file; its type tag is guessed from the name
    pub fn add_file(self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.add_file_with(NamedFile::new(name, data))
    }

    pub fn add_file_with(mut self, file: NamedFile) -> Self {
        self.files.push(file);
        self
    }

    /// Store a JSON document as the capsule metadata file
    pub fn with_metadata(self, metadata: &serde_json::Value) -> Result<Self> {
        let json = serde_json::to_vec_pretty(metadata)?;
        Ok(self.add_file_with(
            NamedFile::new(CAPSULE_META_FILE, json)
                .with_type(FileType::JSON)
                .with_flags(FileFlags::HIGH_PRIORITY),
        ))
    }

    /// Initialize a non-payload channel from explicit data
    pub fn with_plane(mut self, plane: ChannelPlane) -> Self {
        self.planes.push(plane);
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        self.config.validate()?;
        let (table_bytes, block) = FileTable::encode(&self.files)?;
        let dims = self.config.dims_for(block.len() as u64)?;
        let encoded = encode_with_planes(
            &block,
            dims,
            self.config.channels,
            &self.config.channel_fill,
            &self.planes,
        )?;

        log::debug!(
            "Built capsule with {} files ({} table bytes, {})",
            self.files.len(),
            table_bytes.len(),
            encoded.spec.summary()
        );
        frame(&encoded, Some(&table_bytes))
    }
}

/// A capsule file read through a memory mapping.
///
/// The voxel block is CRC-checked once on open; region reads then go
/// straight to the mapped pages.
pub struct MappedCapsule {
    mmap: Mmap,
    header: ContainerHeader,
    table: Option<FileTable>,
    spec: VolumeSpec,
}

impl MappedCapsule {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: capsules are write-once artifacts; the mapping is read-only
        // and the file is not expected to change while mapped.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = ContainerHeader::parse(&mmap)?;
        let framing = locate(&mmap, &header)?;
        let spec = VolumeSpec::from_header(&header, framing.voxel_offset);
        let block = &mmap[framing.voxel_offset..framing.voxel_offset + header.voxel_block_len()];
        volume::verify_crc(block, header.crc32)?;

        log::debug!(
            "Mapped {} capsule {} ({})",
            header.version,
            path.as_ref().display(),
            spec.summary()
        );
        Ok(Self {
            mmap,
            header,
            table: framing.table,
            spec,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Layout of the voxel block within the mapped file
    pub fn volume_spec(&self) -> &VolumeSpec {
        &self.spec
    }

    pub fn file_table(&self) -> Option<&FileTable> {
        self.table.as_ref()
    }

    /// Extract the payload
    pub fn payload(&self) -> Result<Vec<u8>> {
        volume::extract_payload(&self.spec, &self.mmap, self.header.payload_bytes)
    }

    /// Decode the embedded files
    pub fn files(&self, mode: DecodeMode) -> Result<Option<FileMap>> {
        let Some(table) = &self.table else {
            return Ok(None);
        };
        let block = Bytes::from(self.payload()?);
        Ok(Some(decode_with_mode(table, &block, mode)?.files))
    }

    /// Clamp the ROI and read it from the mapping
    pub fn read_region(&self, roi: &RoiBox) -> Result<RegionTensor> {
        read_region_clamped(&self.mmap, &self.spec, roi)
    }
}

/// Byte offset of the voxel block for a legacy capsule
pub const LEGACY_VOXEL_OFFSET: usize = LEGACY_HEADER_LEN;
