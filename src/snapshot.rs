//! Snapshot containers: one dense volume behind a small self-describing header
//!
//! Two encodings share the same payload, a C-ordered `zyxc` volume placed
//! right after the header. Readers address it through a [`VolumeSpec`] whose
//! `offset_bytes` is the header length, so region reads run on the snapshot
//! bytes without copying the volume out first.
//!
//! ```text
//! JSON header                   binary header
//! 0   "CIVD-SNAP7\n"   11       0   "CIVDSNAP"         8
//! 11  header_len u32            8   version u16 (8)    10  header_len u16
//! 15  header JSON               12  dims x, y, z u32 x3
//! ..  voxels                    24  channels u32
//!                               28  dtype u16          30  signature u16
//!                               32  order u8           33  padding [7]
//!                               40  schema_id, schema_version, metadata JSON
//!                                   (u32 length + UTF-8 each)
//!                               header_len: voxels
//! ```

use crate::error::{CivdError, Result};
use crate::layout::VolumeSpec;
use crate::roi::{read_region_clamped, RegionTensor, RoiBox};
use crate::types::{Dims3, ScalarType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Cursor;
use std::path::Path;

pub const JSON_SNAPSHOT_MAGIC: [u8; 11] = *b"CIVD-SNAP7\n";
pub const BINARY_SNAPSHOT_MAGIC: [u8; 8] = *b"CIVDSNAP";
pub const BINARY_SNAPSHOT_VERSION: u16 = 8;

pub const DEFAULT_SCHEMA_ID: &str = "CIVD_SNAPSHOT";
pub const DEFAULT_SCHEMA_VERSION: &str = "0.8";

const JSON_LAYOUT: &str = "SNAPSHOT_V07";
const JSON_VERSION: &str = "0.7";
const C_CONTIG: &str = "C_CONTIG";
const SIGNATURE_C_CONTIG: u16 = 1;
const ORDER_C: u8 = 1;

/// Fixed part of the binary header, up to the length-prefixed strings
const BINARY_CORE_LEN: usize = 40;
const JSON_PREFIX_LEN: usize = 15;

/// Header encoding of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotFormat {
    /// `CIVD-SNAP7` magic followed by a JSON header document
    Json,
    /// `CIVDSNAP` magic followed by a packed binary header
    #[default]
    Binary,
}

/// Element type stored in a snapshot
///
/// The dtype carries more than the scalar width: a `float32` snapshot and a
/// `uint32` one share [`ScalarType::U32`] but decode differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotDtype {
    U8,
    U16,
    U32,
    U64,
    F32,
}

impl SnapshotDtype {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            SnapshotDtype::U8 => ScalarType::U8,
            SnapshotDtype::U16 => ScalarType::U16,
            SnapshotDtype::U32 | SnapshotDtype::F32 => ScalarType::U32,
            SnapshotDtype::U64 => ScalarType::U64,
        }
    }

    /// Name used in JSON headers
    pub fn name(&self) -> &'static str {
        match self {
            SnapshotDtype::U8 => "uint8",
            SnapshotDtype::U16 => "uint16",
            SnapshotDtype::U32 => "uint32",
            SnapshotDtype::U64 => "uint64",
            SnapshotDtype::F32 => "float32",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(SnapshotDtype::U8),
            "uint16" => Some(SnapshotDtype::U16),
            "uint32" => Some(SnapshotDtype::U32),
            "uint64" => Some(SnapshotDtype::U64),
            "float32" => Some(SnapshotDtype::F32),
            _ => None,
        }
    }

    /// Code used in binary headers
    pub fn code(&self) -> u16 {
        match self {
            SnapshotDtype::U8 => 1,
            SnapshotDtype::U16 => 2,
            SnapshotDtype::F32 => 3,
            SnapshotDtype::U32 => 4,
            SnapshotDtype::U64 => 5,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(SnapshotDtype::U8),
            2 => Some(SnapshotDtype::U16),
            3 => Some(SnapshotDtype::F32),
            4 => Some(SnapshotDtype::U32),
            5 => Some(SnapshotDtype::U64),
            _ => None,
        }
    }
}

impl From<ScalarType> for SnapshotDtype {
    fn from(scalar_type: ScalarType) -> Self {
        match scalar_type {
            ScalarType::U8 => SnapshotDtype::U8,
            ScalarType::U16 => SnapshotDtype::U16,
            ScalarType::U32 => SnapshotDtype::U32,
            ScalarType::U64 => SnapshotDtype::U64,
        }
    }
}

/// Parsed snapshot header
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotHeader {
    pub format: SnapshotFormat,

    /// Schema tag; JSON snapshots report their layout name here
    pub schema_id: String,

    pub schema_version: String,

    /// Voxel extent along (x, y, z)
    pub dims: Dims3,

    pub channels: usize,

    pub dtype: SnapshotDtype,

    /// Free-form typed metadata
    pub metadata: Map<String, Value>,

    /// Offset of the first voxel byte
    pub header_len: usize,
}

/// JSON header document; fields stay in sorted order so output is canonical
#[derive(Debug, Serialize, Deserialize)]
struct JsonHeader {
    channels: usize,
    dims: Dims3,
    #[serde(default = "default_dtype")]
    dtype: String,
    layout: String,
    #[serde(default)]
    meta: Option<Map<String, Value>>,
    #[serde(default = "default_signature")]
    signature: String,
    #[serde(default)]
    version: String,
}

fn default_dtype() -> String {
    SnapshotDtype::U8.name().to_string()
}

fn default_signature() -> String {
    C_CONTIG.to_string()
}

impl SnapshotHeader {
    /// Parse the header at the front of a snapshot, detecting its encoding
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(&JSON_SNAPSHOT_MAGIC) {
            Self::parse_json(bytes)
        } else if bytes.starts_with(&BINARY_SNAPSHOT_MAGIC) {
            Self::parse_binary(bytes)
        } else {
            let shown = &bytes[..bytes.len().min(BINARY_SNAPSHOT_MAGIC.len())];
            Err(CivdError::InvalidFormat(format!(
                "Not a snapshot: leading bytes {:?}",
                String::from_utf8_lossy(shown)
            )))
        }
    }

    fn parse_json(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < JSON_PREFIX_LEN {
            return Err(CivdError::Truncated {
                context: "snapshot header",
                needed: JSON_PREFIX_LEN,
                available: bytes.len(),
            });
        }
        let mut cursor = Cursor::new(&bytes[JSON_SNAPSHOT_MAGIC.len()..JSON_PREFIX_LEN]);
        let json_len = cursor.read_u32::<LittleEndian>()? as usize;
        let header_len = JSON_PREFIX_LEN.saturating_add(json_len);
        if bytes.len() < header_len {
            return Err(CivdError::Truncated {
                context: "snapshot header JSON",
                needed: header_len,
                available: bytes.len(),
            });
        }

        let doc: JsonHeader = serde_json::from_slice(&bytes[JSON_PREFIX_LEN..header_len])?;
        if doc.layout != JSON_LAYOUT {
            return Err(CivdError::InvalidFormat(format!(
                "Unexpected snapshot layout '{}'",
                doc.layout
            )));
        }
        if doc.signature != C_CONTIG {
            return Err(CivdError::InvalidFormat(format!(
                "Unsupported snapshot signature '{}'",
                doc.signature
            )));
        }
        let dtype = SnapshotDtype::from_name(&doc.dtype)
            .ok_or_else(|| CivdError::InvalidFormat(format!("Unknown snapshot dtype '{}'", doc.dtype)))?;

        Ok(Self {
            format: SnapshotFormat::Json,
            schema_id: doc.layout,
            schema_version: doc.version,
            dims: doc.dims,
            channels: doc.channels,
            dtype,
            metadata: doc.meta.unwrap_or_default(),
            header_len,
        })
    }

    fn parse_binary(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BINARY_CORE_LEN {
            return Err(CivdError::Truncated {
                context: "snapshot header",
                needed: BINARY_CORE_LEN,
                available: bytes.len(),
            });
        }

        let mut cursor = Cursor::new(&bytes[BINARY_SNAPSHOT_MAGIC.len()..BINARY_CORE_LEN]);
        let version = cursor.read_u16::<LittleEndian>()?;
        if version != BINARY_SNAPSHOT_VERSION {
            return Err(CivdError::UnsupportedVersion(version));
        }
        let header_len = cursor.read_u16::<LittleEndian>()? as usize;
        if header_len < BINARY_CORE_LEN {
            return Err(CivdError::InvalidFormat(format!(
                "Snapshot header length {} is shorter than its fixed fields",
                header_len
            )));
        }
        if bytes.len() < header_len {
            return Err(CivdError::Truncated {
                context: "snapshot header",
                needed: header_len,
                available: bytes.len(),
            });
        }

        let mut dims = [0usize; 3];
        for slot in &mut dims {
            *slot = cursor.read_u32::<LittleEndian>()? as usize;
        }
        let channels = cursor.read_u32::<LittleEndian>()? as usize;
        let dtype_code = cursor.read_u16::<LittleEndian>()?;
        let signature = cursor.read_u16::<LittleEndian>()?;
        let order = cursor.read_u8()?;

        let dtype = SnapshotDtype::from_code(dtype_code)
            .ok_or_else(|| CivdError::InvalidFormat(format!("Unknown snapshot dtype code {}", dtype_code)))?;
        if signature != SIGNATURE_C_CONTIG || order != ORDER_C {
            return Err(CivdError::InvalidFormat(format!(
                "Unsupported snapshot signature {} / order {}",
                signature, order
            )));
        }

        let tail = &bytes[BINARY_CORE_LEN..header_len];
        let mut pos = 0;
        let schema_id = read_string(tail, &mut pos, "snapshot schema id")?;
        let schema_version = read_string(tail, &mut pos, "snapshot schema version")?;
        let meta_json = read_string(tail, &mut pos, "snapshot metadata")?;
        if pos != tail.len() {
            return Err(CivdError::InvalidFormat(format!(
                "Snapshot header length {} does not match its contents ({})",
                header_len,
                BINARY_CORE_LEN + pos
            )));
        }
        let metadata = if meta_json.is_empty() {
            Map::new()
        } else {
            serde_json::from_str(&meta_json)?
        };

        Ok(Self {
            format: SnapshotFormat::Binary,
            schema_id,
            schema_version,
            dims,
            channels,
            dtype,
            metadata,
            header_len,
        })
    }

    /// Spec of the stored volume, offset past the header
    pub fn volume_spec(&self) -> Result<VolumeSpec> {
        Ok(VolumeSpec::new(self.dims, self.channels)?
            .with_scalar_type(self.dtype.scalar_type())
            .with_offset_bytes(self.header_len))
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

fn read_string(tail: &[u8], pos: &mut usize, context: &'static str) -> Result<String> {
    let len_end = *pos + 4;
    if tail.len() < len_end {
        return Err(CivdError::Truncated {
            context,
            needed: len_end,
            available: tail.len(),
        });
    }
    let mut cursor = Cursor::new(&tail[*pos..len_end]);
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let end = len_end.saturating_add(len);
    if tail.len() < end {
        return Err(CivdError::Truncated {
            context,
            needed: end,
            available: tail.len(),
        });
    }
    let text = std::str::from_utf8(&tail[len_end..end])
        .map_err(|e| CivdError::InvalidFormat(format!("{} is not UTF-8: {}", context, e)))?;
    *pos = end;
    Ok(text.to_string())
}

fn write_string(out: &mut Vec<u8>, text: &str) -> Result<()> {
    let len = u32::try_from(text.len())
        .map_err(|_| CivdError::InvalidFormat(format!("Header string of {} bytes exceeds u32", text.len())))?;
    out.write_u32::<LittleEndian>(len)?;
    out.extend_from_slice(text.as_bytes());
    Ok(())
}

/// Builder for snapshot bytes
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    format: SnapshotFormat,
    dtype: Option<SnapshotDtype>,
    schema_id: String,
    schema_version: String,
    metadata: Map<String, Value>,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self {
            format: SnapshotFormat::default(),
            dtype: None,
            schema_id: DEFAULT_SCHEMA_ID.to_string(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            metadata: Map::new(),
        }
    }
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: SnapshotFormat) -> Self {
        self.format = format;
        self
    }

    /// Record a dtype other than the one implied by the `VolumeSpec` scalar width
    pub fn with_dtype(mut self, dtype: SnapshotDtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Schema tag of binary snapshots; JSON snapshots always carry their layout name
    pub fn with_schema(mut self, schema_id: impl Into<String>, schema_version: impl Into<String>) -> Self {
        self.schema_id = schema_id.into();
        self.schema_version = schema_version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Encode `volume`, laid out as `spec` describes from its first byte
    pub fn encode(&self, spec: &VolumeSpec, volume: &[u8]) -> Result<Vec<u8>> {
        let expected = spec.total_size_bytes();
        if volume.len() != expected {
            return Err(CivdError::BufferSizeMismatch {
                expected,
                actual: volume.len(),
            });
        }
        let dtype = self.dtype.unwrap_or_else(|| spec.scalar_type.into());
        if dtype.scalar_type() != spec.scalar_type {
            return Err(CivdError::InvalidFormat(format!(
                "dtype {} does not have {} scalars",
                dtype.name(),
                spec.scalar_type
            )));
        }

        let mut out = match self.format {
            SnapshotFormat::Json => self.json_header(spec, dtype)?,
            SnapshotFormat::Binary => self.binary_header(spec, dtype)?,
        };
        out.reserve(volume.len());
        out.extend_from_slice(volume);
        log::debug!(
            "Encoded {:?} snapshot: {} header bytes, {}",
            self.format,
            out.len() - volume.len(),
            spec.summary()
        );
        Ok(out)
    }

    fn json_header(&self, spec: &VolumeSpec, dtype: SnapshotDtype) -> Result<Vec<u8>> {
        let doc = JsonHeader {
            channels: spec.channels,
            dims: spec.dims,
            dtype: dtype.name().to_string(),
            layout: JSON_LAYOUT.to_string(),
            meta: (!self.metadata.is_empty()).then(|| self.metadata.clone()),
            signature: C_CONTIG.to_string(),
            version: JSON_VERSION.to_string(),
        };
        let json = serde_json::to_vec(&doc)?;
        let json_len = u32::try_from(json.len()).map_err(|_| CivdError::CapacityExceeded {
            payload: json.len() as u64,
            capacity: u32::MAX as u64,
        })?;

        let mut out = Vec::with_capacity(JSON_PREFIX_LEN + json.len());
        out.extend_from_slice(&JSON_SNAPSHOT_MAGIC);
        out.write_u32::<LittleEndian>(json_len)?;
        out.extend_from_slice(&json);
        Ok(out)
    }

    fn binary_header(&self, spec: &VolumeSpec, dtype: SnapshotDtype) -> Result<Vec<u8>> {
        let field = |value: usize, name: &str| {
            u32::try_from(value)
                .map_err(|_| CivdError::InvalidFormat(format!("Snapshot {} {} exceeds u32", name, value)))
        };

        let mut out = Vec::with_capacity(BINARY_CORE_LEN + 64);
        out.extend_from_slice(&BINARY_SNAPSHOT_MAGIC);
        out.write_u16::<LittleEndian>(BINARY_SNAPSHOT_VERSION)?;
        out.write_u16::<LittleEndian>(0)?;
        for d in spec.dims {
            out.write_u32::<LittleEndian>(field(d, "dim")?)?;
        }
        out.write_u32::<LittleEndian>(field(spec.channels, "channels")?)?;
        out.write_u16::<LittleEndian>(dtype.code())?;
        out.write_u16::<LittleEndian>(SIGNATURE_C_CONTIG)?;
        out.write_u8(ORDER_C)?;
        out.extend_from_slice(&[0u8; 7]);
        debug_assert_eq!(out.len(), BINARY_CORE_LEN);

        write_string(&mut out, &self.schema_id)?;
        write_string(&mut out, &self.schema_version)?;
        write_string(&mut out, &serde_json::to_string(&self.metadata)?)?;

        // header_len is a u16; large metadata does not fit
        let header_len = u16::try_from(out.len()).map_err(|_| CivdError::CapacityExceeded {
            payload: out.len() as u64,
            capacity: u16::MAX as u64,
        })?;
        out[10..12].copy_from_slice(&header_len.to_le_bytes());
        Ok(out)
    }

    /// Encode and write a snapshot file
    pub async fn write(&self, path: impl AsRef<Path>, spec: &VolumeSpec, volume: &[u8]) -> Result<SnapshotHeader> {
        let bytes = self.encode(spec, volume)?;
        tokio::fs::write(path.as_ref(), &bytes).await?;
        SnapshotHeader::parse(&bytes)
    }
}

/// A decoded snapshot holding its own bytes
#[derive(Debug, Clone)]
pub struct Snapshot {
    header: SnapshotHeader,
    spec: VolumeSpec,
    bytes: Bytes,
}

impl Snapshot {
    /// Parse a snapshot; the payload must be exactly the described volume
    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let (header, spec) = checked_header(&bytes)?;
        Ok(Self { header, spec, bytes })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Self::decode(bytes)
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    /// Spec addressing the volume inside the snapshot bytes
    pub fn volume_spec(&self) -> &VolumeSpec {
        &self.spec
    }

    /// The dense volume, without the header
    pub fn volume(&self) -> Bytes {
        self.bytes.slice(self.header.header_len..)
    }

    /// Clamped region read; see [`crate::roi::clamp`]
    pub fn read_roi(&self, roi: &RoiBox) -> Result<RegionTensor> {
        read_region_clamped(&self.bytes, &self.spec, roi)
    }
}

fn checked_header(bytes: &[u8]) -> Result<(SnapshotHeader, VolumeSpec)> {
    let header = SnapshotHeader::parse(bytes)?;
    let spec = header.volume_spec()?;
    let expected = spec.total_size_bytes();
    let actual = bytes.len() - header.header_len;
    if actual != expected {
        return Err(CivdError::BufferSizeMismatch { expected, actual });
    }
    Ok((header, spec))
}

/// Parse only the header of a snapshot
pub fn read_header(bytes: &[u8]) -> Result<SnapshotHeader> {
    SnapshotHeader::parse(bytes)
}

/// Clamp `roi` to a snapshot's volume and read it straight from the snapshot bytes
pub fn read_roi(bytes: &[u8], roi: &RoiBox) -> Result<RegionTensor> {
    let (_, spec) = checked_header(bytes)?;
    read_region_clamped(bytes, &spec, roi)
}
