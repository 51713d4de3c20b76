//! Structural inspection of ZIP export packs.
//!
//! Only the central directory is read: entry names are listed by walking the
//! records the end-of-central-directory (EOCD) block points at. Nothing is
//! decompressed and no CRC is checked. All views borrow from the caller's
//! buffer.

use std::borrow::Cow;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// `PK\x05\x06`, little-endian `0x06054b50`.
const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
/// `PK\x01\x02`, little-endian `0x02014b50`.
const CENTRAL_HEADER_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x01, 0x02];

const EOCD_LEN: usize = 22;
const MAX_COMMENT_LEN: usize = 0xffff;
const CENTRAL_HEADER_LEN: usize = 46;

const DXF_SUFFIX: &str = ".dxf";

/// Standard alphabet, padding optional, trailing bits tolerated.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// One entry name inside a central directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerEntry<'a> {
    raw: &'a [u8],
}

impl<'a> ContainerEntry<'a> {
    /// Raw name bytes as stored in the archive.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }

    /// Entry name, borrowed when it is valid UTF-8.
    pub fn name(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.raw)
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// How DXF presence was established for a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DxfDetection {
    /// A central directory entry ends with `.dxf`.
    Entry,
    /// No entries could be listed; the raw bytes contain a `.dxf` marker.
    Fallback,
    /// Neither the entries nor the raw bytes mention `.dxf`.
    Absent,
}

impl DxfDetection {
    pub fn found(&self) -> bool {
        !matches!(self, DxfDetection::Absent)
    }
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Locate the EOCD signature, scanning backward from the end of `buf`.
///
/// The search window is bounded by the fixed record size plus the largest
/// legal archive comment, so signature-like bytes deep inside entry data are
/// never matched. Returns `None` when the buffer is shorter than one record or
/// no signature lies within the window.
pub fn find_end_of_central_directory(buf: &[u8]) -> Option<usize> {
    if buf.len() < EOCD_LEN {
        return None;
    }

    let last = buf.len() - EOCD_LEN;
    let floor = last.saturating_sub(MAX_COMMENT_LEN);

    (floor..=last)
        .rev()
        .find(|&at| buf[at..at + 4] == EOCD_SIGNATURE)
}

/// List the entry names recorded in the central directory of `buf`.
///
/// The walk stops after the declared entry count, at the first record without
/// a central header signature, or when the buffer runs out. Without an EOCD
/// record the result is empty.
pub fn list_zip_entries(buf: &[u8]) -> Vec<ContainerEntry<'_>> {
    let Some(eocd) = find_end_of_central_directory(buf) else {
        return Vec::new();
    };

    let (Some(total), Some(cd_offset)) = (read_u16(buf, eocd + 10), read_u32(buf, eocd + 16))
    else {
        return Vec::new();
    };

    let mut entries = Vec::with_capacity(total as usize);
    let mut pos = cd_offset as usize;

    for _ in 0..total {
        let Some(header) = buf.get(pos..pos.saturating_add(CENTRAL_HEADER_LEN)) else {
            break;
        };
        if header[..4] != CENTRAL_HEADER_SIGNATURE {
            break;
        }

        let name_len = read_u16(header, 28).unwrap_or(0) as usize;
        let extra_len = read_u16(header, 30).unwrap_or(0) as usize;
        let comment_len = read_u16(header, 32).unwrap_or(0) as usize;

        let name_start = pos + CENTRAL_HEADER_LEN;
        let Some(raw) = buf.get(name_start..name_start.saturating_add(name_len)) else {
            break;
        };
        entries.push(ContainerEntry { raw });

        pos = name_start + name_len + extra_len + comment_len;
    }

    entries
}

/// Classify how (and whether) the pack carries a DXF drawing.
///
/// The raw text scan only runs when the structural walk listed nothing, so a
/// well-formed directory always takes precedence over stray bytes.
pub fn detect_dxf(buf: &[u8]) -> DxfDetection {
    let entries = list_zip_entries(buf);
    if !entries.is_empty() {
        return if entries.iter().any(|e| e.as_bytes().ends_with(DXF_SUFFIX.as_bytes())) {
            DxfDetection::Entry
        } else {
            DxfDetection::Absent
        };
    }

    if String::from_utf8_lossy(buf).contains(DXF_SUFFIX) {
        DxfDetection::Fallback
    } else {
        DxfDetection::Absent
    }
}

/// Whether the pack contains a `.dxf` entry (or, for unparseable buffers, a
/// `.dxf` marker).
pub fn has_dxf_entry(buf: &[u8]) -> bool {
    detect_dxf(buf).found()
}

/// Decode a standard base64 payload such as `zipBase64` or `pdfBase64`.
///
/// Whitespace anywhere in the payload (MIME line wrapping included) is
/// skipped and padding is optional.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let compact: Vec<u8> = encoded
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    Ok(LENIENT.decode(compact)?)
}

/// Build a minimal stored archive holding only central directory records.
///
/// Entry data is empty and every local header offset is zero; this is enough
/// for structural listing and is what the mock backend ships as its pack.
pub fn build_directory_only_archive(names: &[&str]) -> Vec<u8> {
    let mut directory = Vec::new();
    for name in names {
        let bytes = name.as_bytes();
        directory.extend_from_slice(&CENTRAL_HEADER_SIGNATURE);
        directory.extend_from_slice(&20u16.to_le_bytes()); // version made by
        directory.extend_from_slice(&20u16.to_le_bytes()); // version needed
        directory.extend_from_slice(&0x0800u16.to_le_bytes()); // utf-8 names
        directory.extend_from_slice(&[0u8; 14]); // method, time, date, crc, compressed size
        directory.extend_from_slice(&0u32.to_le_bytes()); // uncompressed size
        directory.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        directory.extend_from_slice(&[0u8; 16]); // extra, comment, disk, attrs, offset
        directory.extend_from_slice(bytes);
    }

    let count = names.len() as u16;
    let mut archive = directory.clone();
    archive.extend_from_slice(&EOCD_SIGNATURE);
    archive.extend_from_slice(&0u16.to_le_bytes()); // disk number
    archive.extend_from_slice(&0u16.to_le_bytes()); // directory start disk
    archive.extend_from_slice(&count.to_le_bytes());
    archive.extend_from_slice(&count.to_le_bytes());
    archive.extend_from_slice(&(directory.len() as u32).to_le_bytes());
    archive.extend_from_slice(&0u32.to_le_bytes()); // directory offset
    archive.extend_from_slice(&0u16.to_le_bytes()); // comment length
    archive
}
