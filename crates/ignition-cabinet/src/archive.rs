//! The cabinet container format.
//!
//! A deflate-family archive: local entry records followed by a central
//! directory and an end-of-directory record. Parsing retains the original
//! compressed bytes and header fields of every entry, so [`Archive::write`]
//! reproduces the input byte-for-byte; archives assembled through
//! [`ArchiveBuilder`] use fixed timestamps and so are equally reproducible.
//!
//! Entries are indexed by lowercased basename. Anything structurally
//! surprising (data descriptors, encryption, unknown compression, duplicate
//! basenames, non-ASCII names) fails closed.

use std::collections::HashMap;
use std::io::Read;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use ignition_errors::{Result, UpdateError};
use tracing::{debug, trace};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_DIRECTORY_SIG: u32 = 0x0605_4b50;

const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_DIRECTORY_LEN: usize = 22;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

/// Flag bit meaning the sizes live in a trailing data descriptor.
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// Flag bit meaning the entry is encrypted.
const FLAG_ENCRYPTED: u16 = 1 << 0;

/// Size bounds applied while parsing, before any entry is inflated.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Maximum size of the archive itself
    pub max_archive_size: usize,
    /// Maximum decompressed size of any single entry
    pub max_entry_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_archive_size: 128 * 1024 * 1024,
            max_entry_size: 64 * 1024 * 1024,
        }
    }
}

/// One named blob inside the archive.
///
/// Header fields are retained verbatim so the entry can be re-emitted
/// without rewriting history.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Entry name as stored, forward-slash separated
    pub name: String,
    /// Decompressed contents
    pub data: Vec<u8>,
    compressed: Vec<u8>,
    method: u16,
    crc32: u32,
    version_needed: u16,
    flags: u16,
    mod_time: u16,
    mod_date: u16,
    version_made_by: u16,
    internal_attrs: u16,
    external_attrs: u32,
    local_extra: Vec<u8>,
    central_extra: Vec<u8>,
    comment: Vec<u8>,
}

impl ArchiveEntry {
    /// The lowercased basename used as the lookup key.
    pub fn basename(&self) -> String {
        basename_key(&self.name)
    }

    /// Decompressed size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

fn basename_key(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase()
}

/// A parsed cabinet container.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    entries: Vec<ArchiveEntry>,
    index: HashMap<String, usize>,
    end_comment: Vec<u8>,
}

impl Archive {
    /// Parse an archive from raw bytes.
    pub fn parse(bytes: &[u8], limits: &ParseLimits) -> Result<Self> {
        if bytes.len() > limits.max_archive_size {
            return Err(UpdateError::invalid_file(format!(
                "archive is {} bytes, limit is {}",
                bytes.len(),
                limits.max_archive_size
            )));
        }

        let eocd_offset = find_end_of_directory(bytes)?;
        let entry_count = le_u16(bytes, eocd_offset + 10)?;
        let entry_count_total = le_u16(bytes, eocd_offset + 8)?;
        if entry_count != entry_count_total {
            return Err(UpdateError::invalid_file(
                "multi-disk archives are not supported",
            ));
        }
        let directory_offset = le_u32(bytes, eocd_offset + 16)? as usize;
        let comment_len = le_u16(bytes, eocd_offset + 20)? as usize;
        let end_comment = slice(bytes, eocd_offset + END_OF_DIRECTORY_LEN, comment_len)?.to_vec();

        let mut archive = Archive {
            end_comment,
            ..Archive::default()
        };

        let mut offset = directory_offset;
        for _ in 0..entry_count {
            let (entry, next) = parse_directory_entry(bytes, offset, limits)?;
            offset = next;
            archive.push_entry(entry)?;
        }

        debug!(entries = archive.entries.len(), "parsed cabinet archive");
        Ok(archive)
    }

    fn push_entry(&mut self, entry: ArchiveEntry) -> Result<()> {
        let key = entry.basename();
        if self.index.contains_key(&key) {
            return Err(UpdateError::invalid_file(format!(
                "duplicate archive basename '{key}'"
            )));
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// All entries in archive order.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Look up an entry by basename, case-insensitively.
    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.index
            .get(&basename_key(name))
            .and_then(|&i| self.entries.get(i))
    }

    /// Decompressed contents of the named entry.
    pub fn blob(&self, name: &str) -> Result<&[u8]> {
        self.entry(name)
            .map(|e| e.data.as_slice())
            .ok_or_else(|| UpdateError::not_found(format!("no archive entry named '{name}'")))
    }

    /// Re-emit the archive deterministically.
    ///
    /// For a parsed archive the output is byte-identical to the input; for
    /// a built one it is stable across runs.
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut local_offsets = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            local_offsets.push(out.len() as u32);
            push_u32(&mut out, LOCAL_HEADER_SIG);
            push_u16(&mut out, entry.version_needed);
            push_u16(&mut out, entry.flags);
            push_u16(&mut out, entry.method);
            push_u16(&mut out, entry.mod_time);
            push_u16(&mut out, entry.mod_date);
            push_u32(&mut out, entry.crc32);
            push_u32(&mut out, entry.compressed.len() as u32);
            push_u32(&mut out, entry.data.len() as u32);
            push_u16(&mut out, entry.name.len() as u16);
            push_u16(&mut out, entry.local_extra.len() as u16);
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&entry.local_extra);
            out.extend_from_slice(&entry.compressed);
        }

        let directory_offset = out.len() as u32;
        for (entry, &local_offset) in self.entries.iter().zip(&local_offsets) {
            push_u32(&mut out, CENTRAL_HEADER_SIG);
            push_u16(&mut out, entry.version_made_by);
            push_u16(&mut out, entry.version_needed);
            push_u16(&mut out, entry.flags);
            push_u16(&mut out, entry.method);
            push_u16(&mut out, entry.mod_time);
            push_u16(&mut out, entry.mod_date);
            push_u32(&mut out, entry.crc32);
            push_u32(&mut out, entry.compressed.len() as u32);
            push_u32(&mut out, entry.data.len() as u32);
            push_u16(&mut out, entry.name.len() as u16);
            push_u16(&mut out, entry.central_extra.len() as u16);
            push_u16(&mut out, entry.comment.len() as u16);
            push_u16(&mut out, 0); // disk number
            push_u16(&mut out, entry.internal_attrs);
            push_u32(&mut out, entry.external_attrs);
            push_u32(&mut out, local_offset);
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&entry.central_extra);
            out.extend_from_slice(&entry.comment);
        }
        let directory_len = out.len() as u32 - directory_offset;

        push_u32(&mut out, END_OF_DIRECTORY_SIG);
        push_u16(&mut out, 0); // this disk
        push_u16(&mut out, 0); // directory disk
        push_u16(&mut out, self.entries.len() as u16);
        push_u16(&mut out, self.entries.len() as u16);
        push_u32(&mut out, directory_len);
        push_u32(&mut out, directory_offset);
        push_u16(&mut out, self.end_comment.len() as u16);
        out.extend_from_slice(&self.end_comment);

        out
    }
}

/// Assembles a new archive with reproducible headers.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    archive: Archive,
}

impl ArchiveBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, compressing it with deflate.
    pub fn add(mut self, name: &str, data: &[u8]) -> Result<Self> {
        validate_entry_name(name)?;

        let compressed = deflate(data)?;
        let entry = ArchiveEntry {
            name: name.to_string(),
            crc32: crc32fast::hash(data),
            data: data.to_vec(),
            compressed,
            method: METHOD_DEFLATE,
            version_needed: 20,
            flags: 0,
            // fixed epoch (1980-01-01) keeps the output reproducible
            mod_time: 0,
            mod_date: 0x0021,
            version_made_by: 20,
            internal_attrs: 0,
            external_attrs: 0,
            local_extra: Vec::new(),
            central_extra: Vec::new(),
            comment: Vec::new(),
        };
        self.archive.push_entry(entry)?;
        Ok(self)
    }

    /// Finish and return the archive.
    pub fn build(self) -> Archive {
        self.archive
    }
}

fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name.ends_with('/') {
        return Err(UpdateError::invalid_file("entry name must not be empty"));
    }
    if !name.is_ascii() || name.chars().any(|c| c.is_ascii_control()) {
        return Err(UpdateError::invalid_file(format!(
            "entry name '{}' is not printable ASCII",
            name.escape_default()
        )));
    }
    if name.starts_with('/') || name.split('/').any(|part| part == "..") {
        return Err(UpdateError::invalid_file(format!(
            "entry name '{name}' escapes the archive"
        )));
    }
    Ok(())
}

fn parse_directory_entry(
    bytes: &[u8],
    offset: usize,
    limits: &ParseLimits,
) -> Result<(ArchiveEntry, usize)> {
    if le_u32(bytes, offset)? != CENTRAL_HEADER_SIG {
        return Err(UpdateError::invalid_file("malformed central directory"));
    }
    let version_made_by = le_u16(bytes, offset + 4)?;
    let version_needed = le_u16(bytes, offset + 6)?;
    let flags = le_u16(bytes, offset + 8)?;
    let method = le_u16(bytes, offset + 10)?;
    let mod_time = le_u16(bytes, offset + 12)?;
    let mod_date = le_u16(bytes, offset + 14)?;
    let crc32 = le_u32(bytes, offset + 16)?;
    let compressed_size = le_u32(bytes, offset + 20)? as usize;
    let uncompressed_size = le_u32(bytes, offset + 24)? as usize;
    let name_len = le_u16(bytes, offset + 28)? as usize;
    let extra_len = le_u16(bytes, offset + 30)? as usize;
    let comment_len = le_u16(bytes, offset + 32)? as usize;
    let internal_attrs = le_u16(bytes, offset + 36)?;
    let external_attrs = le_u32(bytes, offset + 38)?;
    let local_offset = le_u32(bytes, offset + 42)? as usize;

    if flags & FLAG_ENCRYPTED != 0 {
        return Err(UpdateError::invalid_file("encrypted entries not supported"));
    }
    if flags & FLAG_DATA_DESCRIPTOR != 0 {
        return Err(UpdateError::invalid_file(
            "streamed entries with data descriptors not supported",
        ));
    }
    if uncompressed_size > limits.max_entry_size {
        return Err(UpdateError::invalid_file(format!(
            "entry decompresses to {uncompressed_size} bytes, limit is {}",
            limits.max_entry_size
        )));
    }

    let name_bytes = slice(bytes, offset + CENTRAL_HEADER_LEN, name_len)?;
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| UpdateError::invalid_file("entry name is not valid UTF-8"))?
        .to_string();
    validate_entry_name(&name)?;
    let central_extra = slice(bytes, offset + CENTRAL_HEADER_LEN + name_len, extra_len)?.to_vec();
    let comment = slice(
        bytes,
        offset + CENTRAL_HEADER_LEN + name_len + extra_len,
        comment_len,
    )?
    .to_vec();
    let next = offset + CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;

    // cross-check against the local record and pull the payload out of it
    if le_u32(bytes, local_offset)? != LOCAL_HEADER_SIG {
        return Err(UpdateError::invalid_file("malformed local entry record"));
    }
    let local_name_len = le_u16(bytes, local_offset + 26)? as usize;
    let local_extra_len = le_u16(bytes, local_offset + 28)? as usize;
    let local_name = slice(bytes, local_offset + LOCAL_HEADER_LEN, local_name_len)?;
    if local_name != name.as_bytes() {
        return Err(UpdateError::invalid_file(format!(
            "local and directory names disagree for '{name}'"
        )));
    }
    let local_extra = slice(
        bytes,
        local_offset + LOCAL_HEADER_LEN + local_name_len,
        local_extra_len,
    )?
    .to_vec();
    let data_offset = local_offset + LOCAL_HEADER_LEN + local_name_len + local_extra_len;
    let compressed = slice(bytes, data_offset, compressed_size)?.to_vec();

    let data = match method {
        METHOD_STORED => compressed.clone(),
        METHOD_DEFLATE => inflate(&compressed, limits.max_entry_size)?,
        other => {
            return Err(UpdateError::invalid_file(format!(
                "unsupported compression method {other} for '{name}'"
            )));
        }
    };
    if data.len() != uncompressed_size {
        return Err(UpdateError::invalid_file(format!(
            "'{name}' decompressed to {} bytes, directory says {uncompressed_size}",
            data.len()
        )));
    }
    if crc32fast::hash(&data) != crc32 {
        return Err(UpdateError::invalid_file(format!(
            "crc mismatch for entry '{name}'"
        )));
    }
    trace!(name = %name, size = data.len(), "parsed archive entry");

    Ok((
        ArchiveEntry {
            name,
            data,
            compressed,
            method,
            crc32,
            version_needed,
            flags,
            mod_time,
            mod_date,
            version_made_by,
            internal_attrs,
            external_attrs,
            local_extra,
            central_extra,
            comment,
        },
        next,
    ))
}

fn find_end_of_directory(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < END_OF_DIRECTORY_LEN {
        return Err(UpdateError::invalid_file("archive too small"));
    }
    // the record sits at the end, before at most a 64 KiB comment
    let earliest = bytes
        .len()
        .saturating_sub(END_OF_DIRECTORY_LEN + u16::MAX as usize);
    for offset in (earliest..=bytes.len() - END_OF_DIRECTORY_LEN).rev() {
        if le_u32(bytes, offset)? == END_OF_DIRECTORY_SIG {
            let comment_len = le_u16(bytes, offset + 20)? as usize;
            if offset + END_OF_DIRECTORY_LEN + comment_len == bytes.len() {
                return Ok(offset);
            }
        }
    }
    Err(UpdateError::invalid_file(
        "no end-of-directory record; not a cabinet archive",
    ))
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(6));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| UpdateError::internal(format!("deflate failed: {e}")))
}

fn inflate(compressed: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(compressed).take(limit as u64 + 1);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|e| UpdateError::invalid_file(format!("inflate failed: {e}")))?;
    if data.len() > limit {
        return Err(UpdateError::invalid_file(format!(
            "entry decompresses past the {limit} byte limit"
        )));
    }
    Ok(data)
}

fn le_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let raw = slice(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn le_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let raw = slice(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn slice(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    bytes
        .get(offset..offset.checked_add(len).unwrap_or(usize::MAX))
        .ok_or_else(|| UpdateError::invalid_file("archive truncated"))
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sample() -> Archive {
        ArchiveBuilder::new()
            .add("firmware.bin", b"\x01\x02\x03\x04payload")
            .and_then(|b| b.add("firmware.metainfo.xml", b"<components/>"))
            .map(ArchiveBuilder::build)
            .unwrap_or_default()
    }

    #[test]
    fn test_build_parse_roundtrip() -> Result<()> {
        let archive = build_sample();
        let bytes = archive.write();
        let parsed = Archive::parse(&bytes, &ParseLimits::default())?;
        assert_eq!(parsed.entries().len(), 2);
        assert_eq!(parsed.blob("firmware.bin")?, b"\x01\x02\x03\x04payload");
        Ok(())
    }

    #[test]
    fn test_write_is_byte_identical_after_parse() -> Result<()> {
        let bytes = build_sample().write();
        let parsed = Archive::parse(&bytes, &ParseLimits::default())?;
        assert_eq!(parsed.write(), bytes);
        Ok(())
    }

    #[test]
    fn test_basename_lookup_is_case_insensitive() -> Result<()> {
        let archive = build_sample();
        assert!(archive.entry("FIRMWARE.BIN").is_some());
        assert!(archive.entry("sub/dir/Firmware.Bin").is_some());
        assert!(archive.entry("missing.bin").is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_basenames_fail_closed() {
        let result = ArchiveBuilder::new()
            .add("a/firmware.bin", b"one")
            .and_then(|b| b.add("b/FIRMWARE.BIN", b"two"));
        assert!(result.is_err());
    }

    #[test]
    fn test_path_escape_rejected() {
        assert!(ArchiveBuilder::new().add("../evil.bin", b"x").is_err());
        assert!(ArchiveBuilder::new().add("/abs.bin", b"x").is_err());
    }

    #[test]
    fn test_non_ascii_name_rejected() {
        assert!(ArchiveBuilder::new().add("firmwäre.bin", b"x").is_err());
    }

    #[test]
    fn test_truncated_archive_rejected() {
        let bytes = build_sample().write();
        let truncated = &bytes[..bytes.len() - 4];
        assert!(Archive::parse(truncated, &ParseLimits::default()).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Archive::parse(b"not an archive at all", &ParseLimits::default()).is_err());
    }

    #[test]
    fn test_archive_size_limit() {
        let bytes = build_sample().write();
        let limits = ParseLimits {
            max_archive_size: 8,
            ..ParseLimits::default()
        };
        assert!(Archive::parse(&bytes, &limits).is_err());
    }

    #[test]
    fn test_entry_size_limit() {
        let big = vec![0u8; 4096];
        let archive = ArchiveBuilder::new()
            .add("big.bin", &big)
            .map(ArchiveBuilder::build);
        let bytes = archive.map(|a| a.write()).unwrap_or_default();
        let limits = ParseLimits {
            max_entry_size: 1024,
            ..ParseLimits::default()
        };
        assert!(Archive::parse(&bytes, &limits).is_err());
    }

    #[test]
    fn test_crc_tamper_detected() -> Result<()> {
        let mut bytes = build_sample().write();
        // flip a payload byte inside the first deflate stream
        bytes[LOCAL_HEADER_LEN + "firmware.bin".len() + 2] ^= 0xff;
        assert!(Archive::parse(&bytes, &ParseLimits::default()).is_err());
        Ok(())
    }
}
