//! Embedded file table
//!
//! A version-4 capsule stores several named files back to back in its payload
//! block. The table in front of the voxel data records where each one lives:
//!
//! ```text
//! file_count:u32 reserved:u32
//! { name_len:u16 name[name_len] type_tag:u16 offset:u32 size:u32 flags:u16 checksum:u32 } * file_count
//! ```
//!
//! Offsets are cumulative byte sums relative to the start of the payload block
//! and each checksum covers only that file's own bytes.

use crate::error::{CivdError, Result};
use crate::utils::calculate_checksum;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{Cursor, Read};
use std::ops::Range;

/// Opaque capsule metadata document, passed through untouched
pub const CAPSULE_META_FILE: &str = "meta/civd.json";

const TABLE_PREAMBLE_LEN: usize = 8;
const ENTRY_FIXED_LEN: usize = 2 + 2 + 4 + 4 + 2 + 4;

/// Type tag of an embedded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileType(pub u16);

impl FileType {
    pub const BINARY: FileType = FileType(1);
    pub const TEXT: FileType = FileType(2);
    pub const JSON: FileType = FileType(3);
    pub const IMAGE: FileType = FileType(4);
    pub const POINT_CLOUD: FileType = FileType(5);

    /// Best guess from a file name's extension, falling back to [`FileType::BINARY`]
    pub fn from_extension(name: &str) -> Self {
        let ext = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return FileType::BINARY,
        };
        match ext.as_str() {
            "json" => FileType::JSON,
            "txt" | "md" | "csv" | "log" => FileType::TEXT,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => FileType::IMAGE,
            "ply" | "pcd" | "las" | "xyz" => FileType::POINT_CLOUD,
            _ => FileType::BINARY,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FileType::BINARY => write!(f, "binary"),
            FileType::TEXT => write!(f, "text"),
            FileType::JSON => write!(f, "json"),
            FileType::IMAGE => write!(f, "image"),
            FileType::POINT_CLOUD => write!(f, "point-cloud"),
            FileType(other) => write!(f, "type#{}", other),
        }
    }
}

bitflags! {
    /// Per-file flag bits. Positions are reserved; the codec never acts on them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct FileFlags: u16 {
        const NONE = 0b0000_0000;
        const COMPRESSED = 0b0000_0001;
        const ENCRYPTED = 0b0000_0010;
        const SEMANTIC_LABEL = 0b0000_0100;
        const HIGH_PRIORITY = 0b0000_1000;
    }
}

/// One decoded table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub file_type: FileType,
    pub offset: u32,
    pub size: u32,
    pub flags: FileFlags,
    pub checksum: u32,
}

impl FileEntry {
    /// Byte range inside the payload block
    pub fn range(&self) -> Range<u64> {
        self.offset as u64..self.offset as u64 + self.size as u64
    }

    fn encoded_len(&self) -> usize {
        ENTRY_FIXED_LEN + self.name.len()
    }
}

/// A file to be embedded, before offsets are assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedFile {
    pub name: String,
    pub file_type: FileType,
    pub flags: FileFlags,
    pub data: Bytes,
}

impl NamedFile {
    /// Create a file entry; the type tag is guessed from the extension
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        Self {
            file_type: FileType::from_extension(&name),
            name,
            flags: FileFlags::empty(),
            data: data.into(),
        }
    }

    pub fn with_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }

    pub fn with_flags(mut self, flags: FileFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// The ordered entry list of a multi-file capsule
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileTable {
    entries: Vec<FileEntry>,
}

impl FileTable {
    /// Lay files out back to back and build their table.
    ///
    /// Returns the table and the concatenated payload block.
    pub fn build(files: &[NamedFile]) -> Result<(Self, Vec<u8>)> {
        let mut seen = HashSet::with_capacity(files.len());
        let mut entries = Vec::with_capacity(files.len());
        let total: usize = files.iter().map(|f| f.data.len()).sum();
        let mut block = Vec::with_capacity(total);

        for file in files {
            if file.name.is_empty() {
                return Err(CivdError::InvalidFormat(
                    "Embedded file names must not be empty".to_string(),
                ));
            }
            if file.name.len() > u16::MAX as usize {
                return Err(CivdError::InvalidFormat(format!(
                    "File name of {} bytes exceeds {} bytes",
                    file.name.len(),
                    u16::MAX
                )));
            }
            if !seen.insert(file.name.as_str()) {
                return Err(CivdError::DuplicateFileName(file.name.clone()));
            }

            let offset = u32::try_from(block.len()).map_err(|_| block_overflow(&file.name))?;
            let size = u32::try_from(file.data.len()).map_err(|_| block_overflow(&file.name))?;
            offset.checked_add(size).ok_or_else(|| block_overflow(&file.name))?;

            block.extend_from_slice(&file.data);
            entries.push(FileEntry {
                name: file.name.clone(),
                file_type: file.file_type,
                offset,
                size,
                flags: file.flags,
                checksum: calculate_checksum(&file.data),
            });
        }

        log::debug!(
            "Built file table with {} entries over {} payload bytes",
            entries.len(),
            block.len()
        );
        Ok((Self { entries }, block))
    }

    /// Build the table and serialize it: `(table_bytes, payload_block)`
    pub fn encode(files: &[NamedFile]) -> Result<(Vec<u8>, Vec<u8>)> {
        let (table, block) = Self::build(files)?;
        Ok((table.to_bytes()?, block))
    }

    /// Serialize the table
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| CivdError::InvalidFormat("Too many file entries".to_string()))?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.write_u32::<LittleEndian>(count)?;
        out.write_u32::<LittleEndian>(0)?;
        for entry in &self.entries {
            out.write_u16::<LittleEndian>(entry.name.len() as u16)?;
            out.extend_from_slice(entry.name.as_bytes());
            out.write_u16::<LittleEndian>(entry.file_type.0)?;
            out.write_u32::<LittleEndian>(entry.offset)?;
            out.write_u32::<LittleEndian>(entry.size)?;
            out.write_u16::<LittleEndian>(entry.flags.bits())?;
            out.write_u32::<LittleEndian>(entry.checksum)?;
        }
        Ok(out)
    }

    /// Parse a table from the front of `bytes`; returns the table and the bytes consumed
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < TABLE_PREAMBLE_LEN {
            return Err(CivdError::Truncated {
                context: "file table",
                needed: TABLE_PREAMBLE_LEN,
                available: bytes.len(),
            });
        }

        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let _reserved = cursor.read_u32::<LittleEndian>()?;

        let min_len = count
            .checked_mul(ENTRY_FIXED_LEN)
            .and_then(|n| n.checked_add(TABLE_PREAMBLE_LEN))
            .unwrap_or(usize::MAX);
        if min_len > bytes.len() {
            return Err(CivdError::Truncated {
                context: "file table entries",
                needed: min_len,
                available: bytes.len(),
            });
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(read_entry(&mut cursor)?);
        }

        let consumed = cursor.position() as usize;
        Ok((Self { entries }, consumed))
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Serialized size of the table
    pub fn encoded_len(&self) -> usize {
        TABLE_PREAMBLE_LEN + self.entries.iter().map(FileEntry::encoded_len).sum::<usize>()
    }
}

fn block_overflow(name: &str) -> CivdError {
    CivdError::InvalidFormat(format!(
        "Payload block exceeds u32 offsets at file '{}'",
        name
    ))
}

fn read_entry(cursor: &mut Cursor<&[u8]>) -> Result<FileEntry> {
    let truncated = |_| CivdError::Truncated {
        context: "file table entry",
        needed: ENTRY_FIXED_LEN,
        available: 0,
    };

    let name_len = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    let mut raw_name = vec![0u8; name_len];
    cursor.read_exact(&mut raw_name).map_err(truncated)?;
    let name = String::from_utf8(raw_name).map_err(|e| {
        CivdError::corrupt_entry(
            String::from_utf8_lossy(e.as_bytes()).into_owned(),
            "name is not valid UTF-8",
        )
    })?;

    let file_type = FileType(cursor.read_u16::<LittleEndian>().map_err(truncated)?);
    let offset = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let size = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let flags = FileFlags::from_bits_retain(cursor.read_u16::<LittleEndian>().map_err(truncated)?);
    let checksum = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

    Ok(FileEntry {
        name,
        file_type,
        offset,
        size,
        flags,
        checksum,
    })
}

/// How file-table corruption is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    /// The first failing entry fails the whole decode
    #[default]
    Strict,
    /// Failing entries are reported and skipped
    BestEffort,
}

/// Insertion-ordered `name -> bytes` mapping
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileMap {
    files: Vec<(String, Bytes)>,
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.files.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.files.iter().map(|(n, b)| (n.as_str(), b))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn push(&mut self, name: String, data: Bytes) {
        self.files.push((name, data));
    }
}

impl IntoIterator for FileMap {
    type Item = (String, Bytes);
    type IntoIter = std::vec::IntoIter<(String, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

/// An entry rejected by a best-effort decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptEntry {
    pub name: String,
    pub reason: String,
}

/// Result of [`decode_with_mode`]
#[derive(Debug, Clone, Default)]
pub struct FileTableDecode {
    pub files: FileMap,
    pub corrupt: Vec<CorruptEntry>,
}

impl FileTableDecode {
    /// No entry was rejected
    pub fn is_complete(&self) -> bool {
        self.corrupt.is_empty()
    }
}

/// Resolve every entry against the payload block, failing on the first bad one
pub fn decode(table: &FileTable, block: &Bytes) -> Result<FileMap> {
    decode_with_mode(table, block, DecodeMode::Strict).map(|decoded| decoded.files)
}

/// Resolve entries against the payload block under the given mode.
///
/// Each entry must lie inside the block, must not overlap an earlier
/// accepted entry, must not repeat an earlier name and must match its
/// checksum. Returned slices share the block's storage.
pub fn decode_with_mode(table: &FileTable, block: &Bytes, mode: DecodeMode) -> Result<FileTableDecode> {
    let mut decoded = FileTableDecode::default();
    let mut accepted: Vec<Range<u64>> = Vec::with_capacity(table.len());

    for entry in table.entries() {
        match check_entry(entry, block, &accepted, &decoded.files) {
            Ok(range) => {
                let data = block.slice(range.start as usize..range.end as usize);
                accepted.push(range);
                decoded.files.push(entry.name.clone(), data);
            }
            Err(reason) => match mode {
                DecodeMode::Strict => return Err(CivdError::corrupt_entry(&entry.name, reason)),
                DecodeMode::BestEffort => {
                    log::warn!("Skipping corrupt file entry '{}': {}", entry.name, reason);
                    decoded.corrupt.push(CorruptEntry {
                        name: entry.name.clone(),
                        reason,
                    });
                }
            },
        }
    }

    log::debug!(
        "Decoded {} of {} file entries",
        decoded.files.len(),
        table.len()
    );
    Ok(decoded)
}

fn check_entry(
    entry: &FileEntry,
    block: &[u8],
    accepted: &[Range<u64>],
    files: &FileMap,
) -> std::result::Result<Range<u64>, String> {
    if files.contains(&entry.name) {
        return Err("name repeats an earlier entry".to_string());
    }

    let range = entry.range();
    if range.end > block.len() as u64 {
        return Err(format!(
            "range {}..{} exceeds payload block of {} bytes",
            range.start,
            range.end,
            block.len()
        ));
    }

    if !range.is_empty() {
        if let Some(other) = accepted
            .iter()
            .find(|r| !r.is_empty() && r.start < range.end && range.start < r.end)
        {
            return Err(format!(
                "range {}..{} overlaps {}..{}",
                range.start, range.end, other.start, other.end
            ));
        }
    }

    let computed = calculate_checksum(&block[range.start as usize..range.end as usize]);
    if computed != entry.checksum {
        return Err(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            entry.checksum, computed
        ));
    }

    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_files() -> Vec<NamedFile> {
        vec![
            NamedFile::new("readme.txt", &b"hello capsule"[..]),
            NamedFile::new(CAPSULE_META_FILE, &br#"{"title":"demo"}"#[..]),
            NamedFile::new("data/blob.bin", vec![7u8; 100]).with_flags(FileFlags::HIGH_PRIORITY),
        ]
    }

    #[test]
    fn test_offsets_are_cumulative() {
        let (table, block) = FileTable::build(&sample_files()).unwrap();
        let entries = table.entries();
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].size, 13);
        assert_eq!(entries[1].offset, 13);
        assert_eq!(entries[2].offset, 13 + 16);
        assert_eq!(block.len(), 13 + 16 + 100);
        assert_eq!(entries[0].checksum, calculate_checksum(b"hello capsule"));
    }

    #[test]
    fn test_type_guessing() {
        assert_eq!(FileType::from_extension("a.JSON"), FileType::JSON);
        assert_eq!(FileType::from_extension("notes.md"), FileType::TEXT);
        assert_eq!(FileType::from_extension("scan.ply"), FileType::POINT_CLOUD);
        assert_eq!(FileType::from_extension("noext"), FileType::BINARY);
        assert_eq!(FileType(77).to_string(), "type#77");
    }

    #[test]
    fn test_table_bytes_layout() {
        let files = vec![NamedFile::new("ab", &b"xyz"[..])
            .with_type(FileType::TEXT)
            .with_flags(FileFlags::COMPRESSED)];
        let (bytes, block) = FileTable::encode(&files).unwrap();
        assert_eq!(block, b"xyz");
        assert_eq!(bytes.len(), 8 + 18 + 2);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        assert_eq!(&bytes[8..10], &2u16.to_le_bytes());
        assert_eq!(&bytes[10..12], b"ab");
        assert_eq!(&bytes[12..14], &2u16.to_le_bytes());
        assert_eq!(&bytes[14..18], &0u32.to_le_bytes());
        assert_eq!(&bytes[18..22], &3u32.to_le_bytes());
        assert_eq!(&bytes[22..24], &1u16.to_le_bytes());
        assert_eq!(&bytes[24..28], &calculate_checksum(b"xyz").to_le_bytes());
    }

    #[test]
    fn test_parse_and_decode() {
        let (bytes, block) = FileTable::encode(&sample_files()).unwrap();
        let mut framed = bytes.clone();
        framed.extend_from_slice(b"trailing voxel data");

        let (table, consumed) = FileTable::parse(&framed).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(table.encoded_len(), bytes.len());
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("data/blob.bin").unwrap().flags, FileFlags::HIGH_PRIORITY);

        let files = decode(&table, &Bytes::from(block)).unwrap();
        let names: Vec<&str> = files.names().collect();
        assert_eq!(names, vec!["readme.txt", CAPSULE_META_FILE, "data/blob.bin"]);
        assert_eq!(&files.get("readme.txt").unwrap()[..], b"hello capsule");
    }

    #[test]
    fn test_unknown_flag_bits_are_retained() {
        let files = vec![NamedFile::new("f", &b"1"[..])
            .with_flags(FileFlags::from_bits_retain(0x8001))];
        let (bytes, _) = FileTable::encode(&files).unwrap();
        let (table, _) = FileTable::parse(&bytes).unwrap();
        assert_eq!(table.entries()[0].flags.bits(), 0x8001);
        assert!(table.entries()[0].flags.contains(FileFlags::COMPRESSED));
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let files = vec![
            NamedFile::new("same", &b"1"[..]),
            NamedFile::new("same", &b"2"[..]),
        ];
        assert!(matches!(
            FileTable::build(&files),
            Err(CivdError::DuplicateFileName(name)) if name == "same"
        ));
        assert!(FileTable::build(&[NamedFile::new("", &b"1"[..])]).is_err());
    }

    #[test]
    fn test_altered_bytes_fail_strict_decode() {
        let (table, mut block) = FileTable::build(&sample_files()).unwrap();
        block[14] ^= 0x01;
        let err = decode(&table, &Bytes::from(block)).unwrap_err();
        assert!(matches!(
            err,
            CivdError::CorruptFileEntry { ref name, .. } if name == CAPSULE_META_FILE
        ));
    }

    #[test]
    fn test_best_effort_keeps_intact_entries() {
        let (table, mut block) = FileTable::build(&sample_files()).unwrap();
        block[14] ^= 0x01;
        let decoded = decode_with_mode(&table, &Bytes::from(block), DecodeMode::BestEffort).unwrap();

        assert!(!decoded.is_complete());
        assert_eq!(decoded.corrupt.len(), 1);
        assert_eq!(decoded.corrupt[0].name, CAPSULE_META_FILE);
        assert_eq!(decoded.files.len(), 2);
        assert_eq!(&decoded.files.get("readme.txt").unwrap()[..], b"hello capsule");
        assert_eq!(decoded.files.get("data/blob.bin").unwrap().len(), 100);
    }

    #[test]
    fn test_out_of_range_entry() {
        let (table, block) = FileTable::build(&sample_files()).unwrap();
        let short = Bytes::copy_from_slice(&block[..50]);
        assert!(matches!(
            decode(&table, &short),
            Err(CivdError::CorruptFileEntry { ref name, .. }) if name == "data/blob.bin"
        ));
    }

    #[test]
    fn test_overlapping_entries_rejected() {
        let (mut table, block) = FileTable::build(&[
            NamedFile::new("a", vec![1u8; 8]),
            NamedFile::new("b", vec![1u8; 8]),
        ])
        .unwrap();
        table.entries[1].offset = 4;
        table.entries[1].checksum = calculate_checksum(&block[4..12]);

        let decoded = decode_with_mode(&table, &Bytes::from(block), DecodeMode::BestEffort).unwrap();
        assert_eq!(decoded.files.len(), 1);
        assert_eq!(decoded.corrupt[0].name, "b");
        assert!(decoded.corrupt[0].reason.contains("overlaps"));
    }

    #[test]
    fn test_truncated_table() {
        let (bytes, _) = FileTable::encode(&sample_files()).unwrap();
        assert!(matches!(
            FileTable::parse(&bytes[..4]),
            Err(CivdError::Truncated { .. })
        ));
        assert!(matches!(
            FileTable::parse(&bytes[..bytes.len() - 1]),
            Err(CivdError::Truncated { .. })
        ));

        let mut huge = vec![0u8; 8];
        huge[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            FileTable::parse(&huge),
            Err(CivdError::Truncated { .. })
        ));
    }

    #[test]
    fn test_empty_table() {
        let (bytes, block) = FileTable::encode(&[]).unwrap();
        assert_eq!(bytes, vec![0u8; 8]);
        assert!(block.is_empty());
        let (table, consumed) = FileTable::parse(&bytes).unwrap();
        assert!(table.is_empty());
        assert_eq!(consumed, 8);
    }
}
