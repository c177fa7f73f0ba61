//! Utility functions

use crate::tiling::TileIndex;

/// File name the tiling manifest is stored under
pub const MANIFEST_FILE_NAME: &str = "tiling_manifest.json";

/// Calculate the IEEE CRC32 of a byte slice (zlib-compatible)
pub fn calculate_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify checksum
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    calculate_checksum(data) == expected
}

/// Deterministic slot name of a tile, e.g. `tile_tx1_ty0_tz3.bin`
pub fn tile_file_name(index: &TileIndex) -> String {
    format!("tile_tx{}_ty{}_tz{}.bin", index.tx, index.ty, index.tz)
}

/// Inverse of [`tile_file_name`]; `None` for anything that is not a tile slot
pub fn parse_tile_file_name(name: &str) -> Option<TileIndex> {
    let stem = name.strip_prefix("tile_tx")?.strip_suffix(".bin")?;
    let (tx, rest) = stem.split_once("_ty")?;
    let (ty, tz) = rest.split_once("_tz")?;

    let parse = |s: &str| -> Option<usize> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    };
    Some(TileIndex::new(parse(tx)?, parse(ty)?, parse(tz)?))
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Integer ceiling division; `divisor` must be non-zero
#[inline]
pub fn ceil_div(value: usize, divisor: usize) -> usize {
    debug_assert!(divisor > 0);
    value / divisor + usize::from(value % divisor != 0)
}

/// Largest `r` with `r^3 <= n`
pub fn integer_cbrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut r = (n as f64).cbrt() as u64;
    while r > 0 && cube(r).map_or(true, |c| c > n) {
        r -= 1;
    }
    while cube(r + 1).is_some_and(|c| c <= n) {
        r += 1;
    }
    r
}

#[inline]
fn cube(r: u64) -> Option<u64> {
    r.checked_mul(r)?.checked_mul(r)
}
