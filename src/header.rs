//! Container header codec
//!
//! Current-generation capsules carry a 52-byte little-endian header with
//! explicit geometry and the voxel-block CRC. The two fixed-geometry legacy
//! generations carry a 24-byte header, imply their geometry from the version
//! tag and keep the CRC in a 4-byte footer. Both parse into the same
//! [`ContainerHeader`].

use crate::error::{CivdError, Result};
use crate::types::{voxel_count, Dims3};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

/// Magic signature at the start of every capsule
pub const CAPSULE_MAGIC: [u8; 4] = *b"CI3\0";

/// Serialized length of the current-generation header
pub const CONTAINER_HEADER_LEN: usize = 52;

/// Serialized length of the fixed-geometry legacy header
pub const LEGACY_HEADER_LEN: usize = 24;

/// Length of the legacy CRC footer
pub const LEGACY_FOOTER_LEN: usize = 4;

/// Byte offset of the CRC field in the current-generation header
pub const CRC_FIELD_OFFSET: usize = 48;

/// Format generation selector stored at offset 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum FormatVersion {
    /// 16x16x16, one channel, payload laid out linearly
    FixedGeometry = 0x0001,
    /// 16x16x16, four channels (payload, integrity, semantic, aux)
    FixedAnatomy = 0x0002,
    /// Explicit geometry, single payload
    Dynamic = 0x0003,
    /// Explicit geometry with an embedded file table
    DynamicFileTable = 0x0004,
}

impl FormatVersion {
    /// Resolve a stored version tag
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(FormatVersion::FixedGeometry),
            0x0002 => Some(FormatVersion::FixedAnatomy),
            0x0003 => Some(FormatVersion::Dynamic),
            0x0004 => Some(FormatVersion::DynamicFileTable),
            _ => None,
        }
    }

    /// Raw tag value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Fixed-geometry generation with a footer CRC
    pub fn is_legacy(&self) -> bool {
        legacy_geometry(*self).is_some()
    }

    /// Whether a file table follows the header
    pub fn has_file_table(&self) -> bool {
        matches!(self, FormatVersion::DynamicFileTable)
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{:#06x}", self.as_u16())
    }
}

/// Geometry implied by a legacy version tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyGeometry {
    pub dims: Dims3,
    pub channels: usize,
}

impl LegacyGeometry {
    /// Legacy decoders only ever stored payload in channel 0
    pub fn payload_capacity(&self) -> u64 {
        voxel_count(&self.dims) as u64
    }
}

/// Canonical geometry for each fixed-geometry generation
pub fn legacy_geometry(version: FormatVersion) -> Option<LegacyGeometry> {
    match version {
        FormatVersion::FixedGeometry => Some(LegacyGeometry {
            dims: [16, 16, 16],
            channels: 1,
        }),
        FormatVersion::FixedAnatomy => Some(LegacyGeometry {
            dims: [16, 16, 16],
            channels: 4,
        }),
        FormatVersion::Dynamic | FormatVersion::DynamicFileTable => None,
    }
}

/// Unified in-memory header for every supported generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Generation the bytes were written with
    pub version: FormatVersion,

    /// Bytes preceding the file table (or voxel data when there is none)
    pub header_size: u16,

    /// Voxel extent along (x, y, z)
    pub dims: Dims3,

    /// Channels per voxel
    pub channels: usize,

    /// Exact payload length before zero-padding
    pub payload_bytes: u64,

    /// Reserved for a future timecode / index pointer
    pub reserved_a: u64,

    /// Reserved for a future integrity-mesh pointer
    pub reserved_b: u64,

    /// CRC32 over the entire voxel block
    pub crc32: u32,
}

impl ContainerHeader {
    /// Create a current-generation header for a single-payload capsule
    pub fn new(dims: Dims3, channels: usize, payload_bytes: u64) -> Result<Self> {
        let header = Self {
            version: FormatVersion::Dynamic,
            header_size: CONTAINER_HEADER_LEN as u16,
            dims,
            channels,
            payload_bytes,
            reserved_a: 0,
            reserved_b: 0,
            crc32: 0,
        };
        header.validate_geometry()?;
        if payload_bytes > header.capacity() {
            return Err(CivdError::CapacityExceeded {
                payload: payload_bytes,
                capacity: header.capacity(),
            });
        }
        Ok(header)
    }

    /// Create a header for one of the fixed-geometry generations
    pub fn legacy(version: FormatVersion, payload_bytes: u64) -> Result<Self> {
        let geometry = legacy_geometry(version).ok_or_else(|| {
            CivdError::InvalidFormat(format!("{} is not a fixed-geometry generation", version))
        })?;
        if payload_bytes > geometry.payload_capacity() {
            return Err(CivdError::CapacityExceeded {
                payload: payload_bytes,
                capacity: geometry.payload_capacity(),
            });
        }
        Ok(Self {
            version,
            header_size: LEGACY_HEADER_LEN as u16,
            dims: geometry.dims,
            channels: geometry.channels,
            payload_bytes,
            reserved_a: 0,
            reserved_b: 0,
            crc32: 0,
        })
    }

    /// Mark the capsule as carrying a file table
    pub fn with_file_table(mut self) -> Self {
        self.version = FormatVersion::DynamicFileTable;
        self
    }

    /// Set the voxel-block CRC
    pub fn with_crc32(mut self, crc32: u32) -> Self {
        self.crc32 = crc32;
        self
    }

    pub fn is_legacy(&self) -> bool {
        self.version.is_legacy()
    }

    pub fn has_file_table(&self) -> bool {
        self.version.has_file_table()
    }

    /// Number of voxels
    pub fn voxel_count(&self) -> usize {
        voxel_count(&self.dims)
    }

    /// Storage capacity in bytes (`dims * channels`)
    pub fn capacity(&self) -> u64 {
        self.voxel_block_len() as u64
    }

    /// Length of the voxel block in bytes
    pub fn voxel_block_len(&self) -> usize {
        self.voxel_count() * self.channels
    }

    fn validate_geometry(&self) -> Result<()> {
        if self.dims.iter().any(|&d| d == 0 || d > u32::MAX as usize) {
            return Err(CivdError::InvalidDimensions(format!(
                "All dims must be in 1..=u32::MAX, got {:?}",
                self.dims
            )));
        }
        if self.channels == 0 || self.channels > u32::MAX as usize {
            return Err(CivdError::InvalidDimensions(format!(
                "Channel count must be in 1..=u32::MAX, got {}",
                self.channels
            )));
        }
        let block = self
            .dims
            .iter()
            .try_fold(self.channels, |acc, &d| acc.checked_mul(d));
        if block.is_none() {
            return Err(CivdError::InvalidDimensions(format!(
                "Voxel block {:?} x {} channels overflows addressable memory",
                self.dims, self.channels
            )));
        }
        Ok(())
    }

    /// Parse a header from the start of a capsule.
    ///
    /// Legacy generations keep the CRC in a footer after the voxel block, so
    /// for them `bytes` must cover the whole capsule.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, CAPSULE_MAGIC.len(), "magic")?;
        let mut found = [0u8; 4];
        found.copy_from_slice(&bytes[..4]);
        if found != CAPSULE_MAGIC {
            return Err(CivdError::InvalidMagic {
                expected: CAPSULE_MAGIC,
                found,
            });
        }

        ensure_len(bytes, 6, "version")?;
        let raw_version = LittleEndian::read_u16(&bytes[4..6]);
        let version =
            FormatVersion::from_u16(raw_version).ok_or(CivdError::UnsupportedVersion(raw_version))?;

        match legacy_geometry(version) {
            Some(geometry) => Self::parse_legacy(bytes, version, geometry),
            None => Self::parse_current(bytes, version),
        }
    }

    fn parse_current(bytes: &[u8], version: FormatVersion) -> Result<Self> {
        ensure_len(bytes, CONTAINER_HEADER_LEN, "container header")?;

        let mut cursor = Cursor::new(&bytes[6..CONTAINER_HEADER_LEN]);
        let header_size = cursor.read_u16::<LittleEndian>()?;
        let dim_x = cursor.read_u32::<LittleEndian>()? as usize;
        let dim_y = cursor.read_u32::<LittleEndian>()? as usize;
        let dim_z = cursor.read_u32::<LittleEndian>()? as usize;
        let channels = cursor.read_u32::<LittleEndian>()? as usize;
        let payload_bytes = cursor.read_u64::<LittleEndian>()?;
        let reserved_a = cursor.read_u64::<LittleEndian>()?;
        let reserved_b = cursor.read_u64::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;

        if (header_size as usize) < CONTAINER_HEADER_LEN {
            return Err(CivdError::InvalidFormat(format!(
                "header_size {} is smaller than the {}-byte field set",
                header_size, CONTAINER_HEADER_LEN
            )));
        }
        if (header_size as usize) > CONTAINER_HEADER_LEN {
            log::debug!(
                "Skipping {} bytes of unknown trailing header fields",
                header_size as usize - CONTAINER_HEADER_LEN
            );
        }
        ensure_len(bytes, header_size as usize, "container header")?;

        let header = Self {
            version,
            header_size,
            dims: [dim_x, dim_y, dim_z],
            channels,
            payload_bytes,
            reserved_a,
            reserved_b,
            crc32,
        };
        header
            .validate_geometry()
            .map_err(|e| CivdError::InvalidFormat(e.to_string()))?;
        if payload_bytes > header.capacity() {
            return Err(CivdError::InvalidFormat(format!(
                "payload_bytes {} exceeds voxel capacity {}",
                payload_bytes,
                header.capacity()
            )));
        }
        Ok(header)
    }

    fn parse_legacy(bytes: &[u8], version: FormatVersion, geometry: LegacyGeometry) -> Result<Self> {
        ensure_len(bytes, LEGACY_HEADER_LEN, "legacy header")?;

        let mut cursor = Cursor::new(&bytes[6..LEGACY_HEADER_LEN]);
        let dim_x = cursor.read_u16::<LittleEndian>()? as usize;
        let dim_y = cursor.read_u16::<LittleEndian>()? as usize;
        let dim_z = cursor.read_u16::<LittleEndian>()? as usize;
        let channels = cursor.read_u8()? as usize;
        let mut reserved1 = [0u8; 3];
        cursor.read_exact(&mut reserved1)?;
        let orig_length = cursor.read_u32::<LittleEndian>()? as u64;
        let reserved2 = cursor.read_u32::<LittleEndian>()?;

        if [dim_x, dim_y, dim_z] != geometry.dims || channels != geometry.channels {
            return Err(CivdError::InvalidFormat(format!(
                "{} requires dims {:?} x {} channels, found {:?} x {}",
                version,
                geometry.dims,
                geometry.channels,
                [dim_x, dim_y, dim_z],
                channels
            )));
        }
        if reserved1 != [0u8; 3] || reserved2 != 0 {
            return Err(CivdError::InvalidFormat(format!(
                "{} reserved fields must be zero",
                version
            )));
        }

        let mut header = Self::legacy(version, orig_length).map_err(|e| match e {
            CivdError::CapacityExceeded { payload, capacity } => CivdError::InvalidFormat(format!(
                "orig_length {} exceeds legacy capacity {}",
                payload, capacity
            )),
            other => other,
        })?;

        let footer_at = LEGACY_HEADER_LEN + header.voxel_block_len();
        ensure_len(bytes, footer_at + LEGACY_FOOTER_LEN, "legacy capsule")?;
        header.crc32 = LittleEndian::read_u32(&bytes[footer_at..footer_at + LEGACY_FOOTER_LEN]);

        log::debug!("Mapped {} capsule onto {:?} x {}", version, header.dims, header.channels);
        Ok(header)
    }

    /// Serialize the header in its generation's field order.
    ///
    /// Current-generation headers always serialize to [`CONTAINER_HEADER_LEN`]
    /// bytes with `header_size` set to that length. Legacy headers serialize
    /// to [`LEGACY_HEADER_LEN`] bytes; their CRC belongs in the footer.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.is_legacy() {
            return self.serialize_legacy();
        }
        self.validate_geometry()?;

        let mut out = Vec::with_capacity(CONTAINER_HEADER_LEN);
        out.extend_from_slice(&CAPSULE_MAGIC);
        out.write_u16::<LittleEndian>(self.version.as_u16())?;
        out.write_u16::<LittleEndian>(CONTAINER_HEADER_LEN as u16)?;
        for &d in &self.dims {
            out.write_u32::<LittleEndian>(d as u32)?;
        }
        out.write_u32::<LittleEndian>(self.channels as u32)?;
        out.write_u64::<LittleEndian>(self.payload_bytes)?;
        out.write_u64::<LittleEndian>(self.reserved_a)?;
        out.write_u64::<LittleEndian>(self.reserved_b)?;
        out.write_u32::<LittleEndian>(self.crc32)?;

        debug_assert_eq!(out.len(), CONTAINER_HEADER_LEN);
        Ok(out)
    }

    fn serialize_legacy(&self) -> Result<Vec<u8>> {
        let orig_length = u32::try_from(self.payload_bytes).map_err(|_| CivdError::CapacityExceeded {
            payload: self.payload_bytes,
            capacity: u32::MAX as u64,
        })?;

        let mut out = Vec::with_capacity(LEGACY_HEADER_LEN);
        out.extend_from_slice(&CAPSULE_MAGIC);
        out.write_u16::<LittleEndian>(self.version.as_u16())?;
        for &d in &self.dims {
            out.write_u16::<LittleEndian>(d as u16)?;
        }
        out.write_u8(self.channels as u8)?;
        out.extend_from_slice(&[0u8; 3]);
        out.write_u32::<LittleEndian>(orig_length)?;
        out.write_u32::<LittleEndian>(0)?;

        debug_assert_eq!(out.len(), LEGACY_HEADER_LEN);
        Ok(out)
    }
}

fn ensure_len(bytes: &[u8], needed: usize, context: &'static str) -> Result<()> {
    if bytes.len() < needed {
        return Err(CivdError::Truncated {
            context,
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}
