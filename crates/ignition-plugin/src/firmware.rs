//! Firmware kinds and the parsed firmware tree.
//!
//! Payload sub-formats are a closed set: plugins declare which kind their
//! family consumes, the registry maps kind ids to constructors, and an id
//! outside the set is an error rather than a fallback to raw.

use std::collections::HashMap;

use ignition_errors::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// The sealed set of known firmware kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirmwareKind {
    /// Raw binary image
    Raw,
    /// Intel hex records
    IntelHex,
}

impl FirmwareKind {
    /// Resolve a kind id; unknown ids are a closed-set error.
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "raw" => Ok(FirmwareKind::Raw),
            "ihex" => Ok(FirmwareKind::IntelHex),
            other => Err(UpdateError::not_supported(format!(
                "unknown firmware kind '{other}'"
            ))),
        }
    }

    /// The kind's stable id.
    pub fn id(self) -> &'static str {
        match self {
            FirmwareKind::Raw => "raw",
            FirmwareKind::IntelHex => "ihex",
        }
    }
}

/// A normalized firmware parse result.
///
/// Families with multi-image payloads (a bootloader section plus an
/// application section, say) hang children off the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareTree {
    /// Image id within the payload, if the format names images
    pub id: Option<String>,
    /// Version embedded in the payload, if any
    pub version: Option<String>,
    /// Load address, for formats that carry one
    pub addr: Option<u32>,
    /// Image bytes
    pub data: Vec<u8>,
    /// Sub-images
    pub children: Vec<FirmwareTree>,
}

impl FirmwareTree {
    /// Wrap raw bytes.
    pub fn raw(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            ..Self::default()
        }
    }

    /// Total payload bytes including children.
    pub fn total_size(&self) -> usize {
        self.data.len() + self.children.iter().map(FirmwareTree::total_size).sum::<usize>()
    }
}

type ParseFn = fn(&[u8]) -> Result<FirmwareTree>;

/// Maps firmware kinds to their constructors.
pub struct FirmwareKindRegistry {
    parsers: HashMap<FirmwareKind, ParseFn>,
}

impl Default for FirmwareKindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareKindRegistry {
    /// Create a registry with the built-in kinds registered.
    pub fn new() -> Self {
        let mut parsers: HashMap<FirmwareKind, ParseFn> = HashMap::new();
        parsers.insert(FirmwareKind::Raw, parse_raw);
        parsers.insert(FirmwareKind::IntelHex, parse_intel_hex);
        Self { parsers }
    }

    /// Parse a payload as the given kind.
    pub fn parse(&self, kind: FirmwareKind, payload: &[u8]) -> Result<FirmwareTree> {
        let parser = self.parsers.get(&kind).ok_or_else(|| {
            UpdateError::not_supported(format!("no parser for firmware kind '{}'", kind.id()))
        })?;
        trace!(kind = kind.id(), bytes = payload.len(), "parsing firmware");
        parser(payload)
    }

    /// Parse a payload as the kind named by id.
    pub fn parse_id(&self, id: &str, payload: &[u8]) -> Result<FirmwareTree> {
        self.parse(FirmwareKind::from_id(id)?, payload)
    }
}

fn parse_raw(payload: &[u8]) -> Result<FirmwareTree> {
    if payload.is_empty() {
        return Err(UpdateError::invalid_file("empty firmware payload"));
    }
    Ok(FirmwareTree::raw(payload))
}

/// Parse Intel hex records: `:llaaaatt<data>cc` per line.
///
/// Supports data (00), end-of-file (01) and extended linear address (04)
/// records; the line checksum must hold.
fn parse_intel_hex(payload: &[u8]) -> Result<FirmwareTree> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| UpdateError::invalid_file("intel hex payload is not text"))?;

    let mut data = Vec::new();
    let mut base_addr: u32 = 0;
    let mut start_addr: Option<u32> = None;
    let mut saw_eof = false;

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if saw_eof {
            return Err(UpdateError::invalid_file(format!(
                "record after end-of-file at line {}",
                line_no + 1
            )));
        }
        let hex = line.strip_prefix(':').ok_or_else(|| {
            UpdateError::invalid_file(format!("line {} does not start with ':'", line_no + 1))
        })?;
        let bytes = hex::decode(hex).map_err(|_| {
            UpdateError::invalid_file(format!("bad hex digits at line {}", line_no + 1))
        })?;
        if bytes.len() < 5 {
            return Err(UpdateError::invalid_file(format!(
                "short record at line {}",
                line_no + 1
            )));
        }

        let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(UpdateError::invalid_file(format!(
                "record checksum failed at line {}",
                line_no + 1
            )));
        }

        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(UpdateError::invalid_file(format!(
                "record length mismatch at line {}",
                line_no + 1
            )));
        }
        let addr = u32::from(bytes[1]) << 8 | u32::from(bytes[2]);
        let record_type = bytes[3];
        let record = &bytes[4..4 + count];

        match record_type {
            0x00 => {
                if start_addr.is_none() {
                    start_addr = Some(base_addr + addr);
                }
                data.extend_from_slice(record);
            }
            0x01 => saw_eof = true,
            0x04 => {
                if count != 2 {
                    return Err(UpdateError::invalid_file(format!(
                        "bad extended address record at line {}",
                        line_no + 1
                    )));
                }
                base_addr = (u32::from(record[0]) << 24) | (u32::from(record[1]) << 16);
            }
            other => {
                return Err(UpdateError::invalid_file(format!(
                    "unsupported record type {other:#04x} at line {}",
                    line_no + 1
                )));
            }
        }
    }

    if !saw_eof {
        return Err(UpdateError::invalid_file("missing end-of-file record"));
    }
    if data.is_empty() {
        return Err(UpdateError::invalid_file("intel hex payload has no data"));
    }

    Ok(FirmwareTree {
        addr: start_addr,
        data,
        ..FirmwareTree::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids_are_closed() {
        assert!(FirmwareKind::from_id("raw").is_ok());
        assert!(FirmwareKind::from_id("ihex").is_ok());
        let err = FirmwareKind::from_id("elf");
        assert!(err.is_err_and(|e| e.kind() == ignition_errors::ErrorKind::NotSupported));
    }

    #[test]
    fn test_parse_raw() -> Result<()> {
        let registry = FirmwareKindRegistry::new();
        let tree = registry.parse(FirmwareKind::Raw, b"\x01\x02\x03")?;
        assert_eq!(tree.data, b"\x01\x02\x03");
        assert_eq!(tree.total_size(), 3);
        Ok(())
    }

    #[test]
    fn test_parse_raw_empty_rejected() {
        let registry = FirmwareKindRegistry::new();
        assert!(registry.parse(FirmwareKind::Raw, b"").is_err());
    }

    // two data records at 0x0100, then EOF
    const IHEX: &str = ":0401000001020304F1\n:04010400AABBCCDDE9\n:00000001FF\n";

    #[test]
    fn test_parse_intel_hex() -> Result<()> {
        let registry = FirmwareKindRegistry::new();
        let tree = registry.parse_id("ihex", IHEX.as_bytes())?;
        assert_eq!(tree.data, b"\x01\x02\x03\x04\xAA\xBB\xCC\xDD");
        assert_eq!(tree.addr, Some(0x0100));
        Ok(())
    }

    #[test]
    fn test_intel_hex_bad_checksum_rejected() {
        let registry = FirmwareKindRegistry::new();
        let bad = ":0401000001020304F2\n:00000001FF\n";
        assert!(registry.parse_id("ihex", bad.as_bytes()).is_err());
    }

    #[test]
    fn test_intel_hex_missing_eof_rejected() {
        let registry = FirmwareKindRegistry::new();
        let bad = ":0401000001020304F1\n";
        assert!(registry.parse_id("ihex", bad.as_bytes()).is_err());
    }

    #[test]
    fn test_intel_hex_extended_address() -> Result<()> {
        let registry = FirmwareKindRegistry::new();
        let input = ":020000040800F2\n:0401000001020304F1\n:00000001FF\n";
        let tree = registry.parse_id("ihex", input.as_bytes())?;
        assert_eq!(tree.addr, Some(0x0800_0100));
        Ok(())
    }
}
