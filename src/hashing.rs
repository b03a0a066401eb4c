//! SHA-256 helpers for record keys and source checksums.

use std::{fs::File, io::Read, path::Path};

use sha2::{Digest, Sha256};

use crate::{error::Result, record::RawRecord};

const READ_BUFFER_BYTES: usize = 8192;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn text_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

pub fn content_hash(record: &RawRecord) -> String {
    text_hash(&record.canonical_json())
}

/// Hashes the non-empty trimmed values (in order) joined by `separator`.
/// Returns `None` when every value is missing or blank.
pub fn fields_hash<I, S>(values: I, separator: &str) -> Option<String>
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let parts: Vec<String> = values
        .into_iter()
        .flatten()
        .map(|v| v.as_ref().trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(text_hash(&parts.join(separator)))
    }
}

pub fn reader_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER_BYTES];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path)?;
    reader_checksum(&mut file)
}

/// Preliminary checksum from what a server reports before download.
///
/// The validator token wins; otherwise the address plus reported length.
/// Returns `None` when neither is available so the caller fails open.
pub fn cache_validator_checksum(
    address: &str,
    etag: Option<&str>,
    content_length: Option<u64>,
) -> Option<String> {
    if let Some(tag) = etag.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(text_hash(tag));
    }
    content_length.map(|len| {
        let mut hasher = Sha256::new();
        hasher.update(address.as_bytes());
        hasher.update(len.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    })
}

/// Short prefix for log lines.
pub fn short(checksum: Option<&str>) -> &str {
    match checksum {
        Some(value) => value.get(..16).unwrap_or(value),
        None => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn short_prefix_tolerates_any_stored_text() {
        assert_eq!(short(Some("0123456789abcdef0123")), "0123456789abcdef");
        assert_eq!(short(Some("abc")), "abc");
        assert_eq!(short(Some("0123456789abcdeé")), "0123456789abcdeé");
        assert_eq!(short(None), "none");
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            text_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn reader_checksum_matches_in_memory_digest() {
        let mut cursor = Cursor::new(b"hello world".to_vec());
        assert_eq!(
            reader_checksum(&mut cursor).unwrap(),
            sha256_hex(b"hello world")
        );
    }

    #[test]
    fn content_hash_ignores_field_order() {
        let a = RawRecord::from_json(json!({"a": 1, "b": 2}));
        let b = RawRecord::from_json(json!({"b": 2, "a": 1}));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn fields_hash_skips_blank_values() {
        let with_blank = fields_hash([Some("A"), None, Some("  "), Some("B ")], "|");
        assert_eq!(with_blank, Some(text_hash("A|B")));
        assert_eq!(fields_hash::<_, &str>([None, Some(" ")], "|"), None);
    }

    #[test]
    fn validator_checksum_prefers_etag() {
        let with_tag = cache_validator_checksum("http://x/a.xml", Some("\"abc\""), Some(10));
        assert_eq!(with_tag, Some(text_hash("\"abc\"")));
        let by_length = cache_validator_checksum("http://x/a.xml", None, Some(10));
        assert_eq!(by_length, Some(text_hash("http://x/a.xml10")));
        assert_eq!(cache_validator_checksum("http://x/a.xml", None, None), None);
    }
}
