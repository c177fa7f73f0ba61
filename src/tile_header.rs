//! Self-describing header for framed tile slots
//!
//! ```text
//! 0   magic "CIVDTILE"     8
//! 8   header_version u16   10  header_len u16 (64)
//! 12  flags u32
//! 16  tx, ty, tz u32 x3
//! 28  tile_dims x, y, z u32 x3
//! 40  channels u32
//! 44  scalar width u16     46  layout code u16
//! 48  order code u8        49  padding [7]
//! 56  payload_len u64
//! ```
//!
//! Whether a slot is framed comes from the manifest's tile format; raw
//! tiles may start with any bytes, including the magic.

use crate::error::{CivdError, Result};
use crate::layout::VoxelLayout;
use crate::manifest::TilingManifest;
use crate::tiling::{Tile, TileIndex};
use crate::types::{Dims3, ScalarType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const TILE_MAGIC: [u8; 8] = *b"CIVDTILE";
pub const TILE_HEADER_LEN: usize = 64;
pub const TILE_HEADER_VERSION: u16 = 1;

/// Row-major (x fastest within a row)
const ORDER_ROW_MAJOR: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileHeader {
    pub flags: u32,
    pub index: TileIndex,
    pub tile_dims: Dims3,
    pub channels: usize,
    pub scalar_type: ScalarType,
    pub layout: VoxelLayout,
    pub payload_len: u64,
}

impl TileHeader {
    /// Header for a planned tile of a manifest
    pub fn for_tile(tile: &Tile, manifest: &TilingManifest) -> Self {
        Self {
            flags: 0,
            index: tile.index,
            tile_dims: tile.tile_dims,
            channels: manifest.channels,
            scalar_type: manifest.scalar_type,
            layout: VoxelLayout::Zyxc,
            payload_len: manifest.tile_byte_len(tile) as u64,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let field = |value: usize, name: &str| {
            u32::try_from(value)
                .map_err(|_| CivdError::InvalidFormat(format!("Tile header {} {} exceeds u32", name, value)))
        };

        let mut out = Vec::with_capacity(TILE_HEADER_LEN);
        out.extend_from_slice(&TILE_MAGIC);
        out.write_u16::<LittleEndian>(TILE_HEADER_VERSION)?;
        out.write_u16::<LittleEndian>(TILE_HEADER_LEN as u16)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        for t in self.index.as_array() {
            out.write_u32::<LittleEndian>(field(t, "tile index")?)?;
        }
        for d in self.tile_dims {
            out.write_u32::<LittleEndian>(field(d, "tile dim")?)?;
        }
        out.write_u32::<LittleEndian>(field(self.channels, "channels")?)?;
        out.write_u16::<LittleEndian>(self.scalar_type.tag())?;
        out.write_u16::<LittleEndian>(self.layout.code())?;
        out.write_u8(ORDER_ROW_MAJOR)?;
        out.extend_from_slice(&[0u8; 7]);
        out.write_u64::<LittleEndian>(self.payload_len)?;

        debug_assert_eq!(out.len(), TILE_HEADER_LEN);
        Ok(out)
    }

    /// Parse a header from the front of a slot.
    ///
    /// `Ok(None)` means the slot carries no magic and is a raw tile. A slot
    /// with the magic but a malformed header is an error.
    pub fn parse(blob: &[u8]) -> Result<Option<Self>> {
        if blob.len() < TILE_MAGIC.len() || blob[..TILE_MAGIC.len()] != TILE_MAGIC {
            return Ok(None);
        }
        if blob.len() < TILE_HEADER_LEN {
            return Err(CivdError::Truncated {
                context: "tile header",
                needed: TILE_HEADER_LEN,
                available: blob.len(),
            });
        }

        let mut cursor = Cursor::new(&blob[TILE_MAGIC.len()..TILE_HEADER_LEN]);
        let version = cursor.read_u16::<LittleEndian>()?;
        let header_len = cursor.read_u16::<LittleEndian>()? as usize;
        if version != TILE_HEADER_VERSION || header_len != TILE_HEADER_LEN {
            return Err(CivdError::InvalidFormat(format!(
                "Unsupported tile header version {} (length {})",
                version, header_len
            )));
        }

        let flags = cursor.read_u32::<LittleEndian>()?;
        let mut index = [0usize; 3];
        for slot in &mut index {
            *slot = cursor.read_u32::<LittleEndian>()? as usize;
        }
        let mut tile_dims = [0usize; 3];
        for slot in &mut tile_dims {
            *slot = cursor.read_u32::<LittleEndian>()? as usize;
        }
        let channels = cursor.read_u32::<LittleEndian>()? as usize;
        let width = cursor.read_u16::<LittleEndian>()?;
        let layout_code = cursor.read_u16::<LittleEndian>()?;
        let order = cursor.read_u8()?;
        cursor.set_position(cursor.position() + 7);
        let payload_len = cursor.read_u64::<LittleEndian>()?;

        let scalar_type = ScalarType::from_width(width as usize)
            .ok_or_else(|| CivdError::InvalidFormat(format!("Unknown scalar width {}", width)))?;
        let layout = VoxelLayout::from_code(layout_code)
            .ok_or_else(|| CivdError::InvalidFormat(format!("Unknown layout code {}", layout_code)))?;
        if order != ORDER_ROW_MAJOR {
            return Err(CivdError::InvalidFormat(format!("Unknown order code {}", order)));
        }

        Ok(Some(Self {
            flags,
            index: TileIndex::new(index[0], index[1], index[2]),
            tile_dims,
            channels,
            scalar_type,
            layout,
            payload_len,
        }))
    }

    /// Ensure the header describes `tile` as the manifest plans it
    pub fn check_against(&self, tile: &Tile, manifest: &TilingManifest) -> Result<()> {
        let expected = Self::for_tile(tile, manifest);
        if self.index != expected.index
            || self.tile_dims != expected.tile_dims
            || self.channels != expected.channels
            || self.scalar_type != expected.scalar_type
            || self.payload_len != expected.payload_len
        {
            return Err(CivdError::InvalidFormat(format!(
                "Tile header {:?} does not match planned tile {}",
                self, tile.index
            )));
        }
        Ok(())
    }
}

/// Prefix a tile payload with its header
pub fn frame_tile(header: &TileHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = header.to_bytes()?;
    out.reserve(payload.len());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a slot into its optional header and the tile payload
pub fn unframe_tile(blob: &[u8]) -> Result<(Option<TileHeader>, &[u8])> {
    match TileHeader::parse(blob)? {
        None => Ok((None, blob)),
        Some(header) => {
            let body = &blob[TILE_HEADER_LEN..];
            if body.len() as u64 != header.payload_len {
                return Err(CivdError::BufferSizeMismatch {
                    expected: header.payload_len as usize,
                    actual: body.len(),
                });
            }
            Ok((Some(header), body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::VolumeSpec;

    fn manifest() -> TilingManifest {
        let spec = VolumeSpec::new([10, 6, 4], 3).unwrap();
        TilingManifest::for_volume(&spec, [4, 4, 4]).unwrap()
    }

    #[test]
    fn test_header_is_64_bytes() {
        let manifest = manifest();
        let tile = manifest.tile(TileIndex::new(2, 1, 0)).unwrap();
        let header = TileHeader::for_tile(tile, &manifest);
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), TILE_HEADER_LEN);
        assert_eq!(&bytes[..8], b"CIVDTILE");
        assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &2u32.to_le_bytes());
        assert_eq!(&bytes[56..64], &(2u64 * 2 * 4 * 3).to_le_bytes());
    }

    #[test]
    fn test_frame_roundtrip() {
        let manifest = manifest();
        let tile = manifest.tile(TileIndex::new(0, 1, 0)).unwrap();
        let header = TileHeader::for_tile(tile, &manifest);
        let payload = vec![9u8; manifest.tile_byte_len(tile)];

        let framed = frame_tile(&header, &payload).unwrap();
        let (parsed, body) = unframe_tile(&framed).unwrap();
        assert_eq!(parsed, Some(header));
        assert_eq!(body, &payload[..]);
        assert!(parsed.unwrap().check_against(tile, &manifest).is_ok());

        let other = manifest.tile(TileIndex::new(1, 1, 0)).unwrap();
        assert!(header.check_against(other, &manifest).is_err());
    }

    #[test]
    fn test_raw_tiles_pass_through() {
        let raw = vec![1u8, 2, 3];
        let (header, body) = unframe_tile(&raw).unwrap();
        assert!(header.is_none());
        assert_eq!(body, &raw[..]);
        assert!(unframe_tile(&[]).unwrap().0.is_none());
    }

    #[test]
    fn test_malformed_framed_tiles() {
        let manifest = manifest();
        let tile = manifest.tile(TileIndex::new(0, 0, 0)).unwrap();
        let header = TileHeader::for_tile(tile, &manifest);
        let framed = frame_tile(&header, &vec![0u8; manifest.tile_byte_len(tile)]).unwrap();

        assert!(matches!(
            unframe_tile(&framed[..40]),
            Err(CivdError::Truncated { .. })
        ));
        assert!(matches!(
            unframe_tile(&framed[..framed.len() - 1]),
            Err(CivdError::BufferSizeMismatch { .. })
        ));

        let mut bad_width = framed.clone();
        bad_width[44] = 3;
        assert!(matches!(
            unframe_tile(&bad_width),
            Err(CivdError::InvalidFormat(_))
        ));
    }
}
