//! The legacy binary blob
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! i32     schema version (3)
//! i32     entry count
//! repeat  entry count times:
//!   string  "authority:::resource:::clientId:::subjectType"
//!   string  JSON-serialized result wrapper
//! ```
//!
//! Strings are UTF-8, prefixed by their byte length as a 7-bit variable
//! length integer.
//!
//! Reading never fails: a blob from another schema version, or one that is
//! corrupt, reads as an empty cache and the problem is logged.

use std::{convert::TryFrom, str};

use thiserror::Error;

use super::{
    LegacyCacheKey, LegacyResultWrapper, LegacyTokenDictionary, TokenSubjectType,
    LEGACY_KEY_DELIMITER,
};

/// The schema version written and accepted by this codec
pub const LEGACY_SCHEMA_VERSION: i32 = 3;

/// Why a legacy blob could not be read
#[derive(Debug, Error)]
pub enum LegacyFormatError {
    /// The blob ended early
    #[error("legacy cache ended unexpectedly at offset {offset}")]
    Truncated {
        /// Where the read failed
        offset: usize,
    },
    /// The blob was written with a different schema
    #[error("legacy cache schema version {found} is not {}", LEGACY_SCHEMA_VERSION)]
    UnsupportedVersion {
        /// The version found
        found: i32,
    },
    /// The entry count is negative
    #[error("legacy cache declares a negative entry count: {count}")]
    NegativeCount {
        /// The declared count
        count: i32,
    },
    /// A string length prefix is malformed
    #[error("legacy cache has a malformed string length at offset {offset}")]
    InvalidLength {
        /// Where the length began
        offset: usize,
    },
    /// A string is not UTF-8
    #[error("legacy cache string is not UTF-8")]
    InvalidUtf8(#[from] str::Utf8Error),
    /// A key did not have the expected components
    #[error("legacy cache key is malformed: {key:?}")]
    InvalidKey {
        /// The offending key
        key: String,
    },
    /// A value is not a valid result wrapper
    #[error("legacy cache value is malformed")]
    InvalidValue(#[from] serde_json::Error),
    /// Data follows the last entry
    #[error("legacy cache has {remaining} trailing bytes")]
    TrailingData {
        /// The number of unread bytes
        remaining: usize,
    },
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LegacyFormatError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(LegacyFormatError::Truncated {
                offset: self.offset,
            })?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn read_i32(&mut self) -> Result<i32, LegacyFormatError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(buf))
    }

    fn read_7bit_len(&mut self) -> Result<usize, LegacyFormatError> {
        let start = self.offset;
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.take(1)?[0];
            if shift == 28 && byte > 0x0F {
                return Err(LegacyFormatError::InvalidLength { offset: start });
            }
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return usize::try_from(value)
                    .map_err(|_| LegacyFormatError::InvalidLength { offset: start });
            }
        }
        Err(LegacyFormatError::InvalidLength { offset: start })
    }

    fn read_string(&mut self) -> Result<&'a str, LegacyFormatError> {
        let len = self.read_7bit_len()?;
        Ok(str::from_utf8(self.take(len)?)?)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

fn write_7bit_len(out: &mut Vec<u8>, len: usize) {
    let mut value = len;
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_7bit_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn parse_key(key: &str, value: &LegacyResultWrapper) -> Result<LegacyCacheKey, LegacyFormatError> {
    let invalid = || LegacyFormatError::InvalidKey {
        key: key.to_owned(),
    };

    let parts: Vec<&str> = key.split(LEGACY_KEY_DELIMITER).collect();
    if parts.len() != 4 {
        return Err(invalid());
    }

    let subject_type = parts[3]
        .trim()
        .parse::<i32>()
        .ok()
        .and_then(|i| TokenSubjectType::try_from(i).ok())
        .ok_or_else(invalid)?;

    LegacyCacheKey::new(
        parts[0],
        parts[1],
        parts[2],
        subject_type,
        value.unique_id(),
        value.displayable_id(),
    )
    .map_err(|_| invalid())
}

/// Reads a legacy blob, failing on any structural problem
pub fn try_deserialize(data: &[u8]) -> Result<LegacyTokenDictionary, LegacyFormatError> {
    let mut dict = LegacyTokenDictionary::new();
    if data.is_empty() {
        return Ok(dict);
    }

    let mut reader = Reader::new(data);
    let version = reader.read_i32()?;
    if version != LEGACY_SCHEMA_VERSION {
        return Err(LegacyFormatError::UnsupportedVersion { found: version });
    }

    let count = reader.read_i32()?;
    if count < 0 {
        return Err(LegacyFormatError::NegativeCount { count });
    }

    for _ in 0..count {
        let key = reader.read_string()?;
        let value: LegacyResultWrapper = serde_json::from_str(reader.read_string()?)?;
        let key = parse_key(key, &value)?;
        dict.insert(key, value);
    }

    if reader.remaining() != 0 {
        return Err(LegacyFormatError::TrailingData {
            remaining: reader.remaining(),
        });
    }

    Ok(dict)
}

/// Reads a legacy blob
///
/// Blobs from another schema version, and corrupt blobs, read as empty.
pub fn deserialize(data: &[u8]) -> LegacyTokenDictionary {
    match try_deserialize(data) {
        Ok(dict) => dict,
        Err(LegacyFormatError::UnsupportedVersion { found }) => {
            tracing::warn!(
                version = found,
                expected = LEGACY_SCHEMA_VERSION,
                "discarding legacy cache written with another schema version"
            );
            LegacyTokenDictionary::new()
        }
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "discarding corrupt legacy cache"
            );
            LegacyTokenDictionary::new()
        }
    }
}

/// Writes a legacy blob
///
/// Entries whose value cannot be serialized are skipped and logged.
pub fn serialize(dict: &LegacyTokenDictionary) -> Vec<u8> {
    let mut entries = Vec::with_capacity(dict.len());
    for (key, value) in dict {
        match serde_json::to_string(value) {
            Ok(json) => entries.push((key.to_key_string(), json)),
            Err(error) => tracing::warn!(
                key = %key.to_key_string(),
                error = (&error as &dyn std::error::Error),
                "skipping legacy cache entry that cannot be serialized"
            ),
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&LEGACY_SCHEMA_VERSION.to_le_bytes());
    let count = i32::try_from(entries.len()).unwrap_or(i32::MAX);
    out.extend_from_slice(&count.to_le_bytes());

    for (key, json) in entries.iter().take(count as usize) {
        write_string(&mut out, key);
        write_string(&mut out, json);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::{LegacyResult, LegacyUserInfo};

    fn entry(resource: &str, unique_id: &str) -> (LegacyCacheKey, LegacyResultWrapper) {
        let value = LegacyResultWrapper {
            result: LegacyResult {
                user_info: Some(LegacyUserInfo {
                    unique_id: Some(unique_id.to_owned()),
                    displayable_id: Some("user@contoso.com".to_owned()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            refresh_token: Some("rt".to_owned()),
            resource_in_response: Some(resource.to_owned()),
            ..Default::default()
        };
        let key = LegacyCacheKey::new(
            "https://login.example.com/contoso/",
            resource,
            "client-1",
            TokenSubjectType::User,
            Some(unique_id),
            Some("user@contoso.com"),
        )
        .expect("valid key");
        (key, value)
    }

    #[test]
    fn round_trips_entries_and_user_ids() -> color_eyre::Result<()> {
        let dict: LegacyTokenDictionary =
            vec![entry("r1", "u1"), entry("r2", "u2")].into_iter().collect();

        let blob = serialize(&dict);
        assert_eq!(&blob[0..4], &3i32.to_le_bytes());
        assert_eq!(&blob[4..8], &2i32.to_le_bytes());

        let read = try_deserialize(&blob)?;
        assert_eq!(read, dict);
        Ok(())
    }

    #[test]
    fn string_layout_is_length_prefixed() {
        let (key, value) = entry("r", "u");
        let dict: LegacyTokenDictionary = vec![(key.clone(), value)].into_iter().collect();
        let blob = serialize(&dict);

        let key_string = key.to_key_string();
        assert_eq!(blob[8] as usize, key_string.len());
        assert_eq!(&blob[9..9 + key_string.len()], key_string.as_bytes());
    }

    #[test]
    fn long_strings_use_multi_byte_lengths() -> color_eyre::Result<()> {
        let mut out = Vec::new();
        write_7bit_len(&mut out, 300);
        assert_eq!(out, vec![0xAC, 0x02]);

        let resource = "r".repeat(200);
        let dict: LegacyTokenDictionary = vec![entry(&resource, "u")].into_iter().collect();
        assert_eq!(try_deserialize(&serialize(&dict))?, dict);
        Ok(())
    }

    #[test]
    #[tracing_test::traced_test]
    fn other_schema_versions_read_as_empty() {
        let (key, value) = entry("r", "u");
        let dict: LegacyTokenDictionary = vec![(key, value)].into_iter().collect();
        let mut blob = serialize(&dict);
        blob[0..4].copy_from_slice(&1i32.to_le_bytes());

        assert!(matches!(
            try_deserialize(&blob),
            Err(LegacyFormatError::UnsupportedVersion { found: 1 })
        ));
        assert!(deserialize(&blob).is_empty());
        assert!(logs_contain("another schema version"));
    }

    #[test]
    fn corrupt_blobs_read_as_empty() {
        let dict: LegacyTokenDictionary = vec![entry("r", "u")].into_iter().collect();
        let blob = serialize(&dict);

        assert!(matches!(
            try_deserialize(&blob[..blob.len() - 3]),
            Err(LegacyFormatError::Truncated { .. })
        ));
        assert!(deserialize(&blob[..blob.len() - 3]).is_empty());
        assert!(deserialize(&[3, 0, 0]).is_empty());

        let mut trailing = blob.clone();
        trailing.push(0);
        assert!(matches!(
            try_deserialize(&trailing),
            Err(LegacyFormatError::TrailingData { remaining: 1 })
        ));

        let mut negative = blob;
        negative[4..8].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(deserialize(&negative).is_empty());
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&3i32.to_le_bytes());
        blob.extend_from_slice(&1i32.to_le_bytes());
        write_string(&mut blob, "https://login.example.com/:::r:::c");
        write_string(&mut blob, "{}");

        assert!(matches!(
            try_deserialize(&blob),
            Err(LegacyFormatError::InvalidKey { .. })
        ));

        let mut blob = Vec::new();
        blob.extend_from_slice(&3i32.to_le_bytes());
        blob.extend_from_slice(&1i32.to_le_bytes());
        write_string(&mut blob, "https://login.example.com/:::r:::c:::7");
        write_string(&mut blob, "{}");
        assert!(deserialize(&blob).is_empty());
    }

    #[test]
    fn empty_blob_is_empty_cache() -> color_eyre::Result<()> {
        assert!(try_deserialize(&[])?.is_empty());
        assert_eq!(
            try_deserialize(&serialize(&LegacyTokenDictionary::new()))?,
            LegacyTokenDictionary::new()
        );
        Ok(())
    }
}
