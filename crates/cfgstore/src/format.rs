//! Serialization formats for configuration bodies.
//!
//! Responsibilities:
//! - Select a serializer by format tag (`Json`, `Xml`, `Binary`).
//! - Write and check the fixed header that prefixes binary-format files.
//!
//! Does NOT handle:
//! - Encryption (see `encryption.rs`).
//! - File placement or atomic writes (see `persistence`).
//!
//! Invariants:
//! - `decode(encode(v)) == v` for every value the underlying serializer supports.
//! - Binary bodies always start with the 30-byte header; JSON and XML bodies
//!   carry no header and are only required to be non-empty.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{HEADER_LEN, HEADER_MAGIC, HEADER_VERSION};

/// Errors produced while encoding or decoding a configuration body.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML serialization error: {0}")]
    XmlSerialize(#[from] quick_xml::se::SeError),

    #[error("XML deserialization error: {0}")]
    XmlDeserialize(#[from] quick_xml::de::DeError),

    #[error("XML body is not valid UTF-8: {0}")]
    XmlEncoding(#[from] std::str::Utf8Error),

    #[error("Binary serialization error: {0}")]
    Binary(#[from] serde_cbor::Error),

    #[error("Binary body is missing the configuration header")]
    MissingHeader,

    #[error("Configuration body is empty")]
    Empty,
}

/// Serialization format used for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Format {
    /// Pretty-printed JSON.
    #[default]
    Json,
    /// XML, rooted at the type's name.
    Xml,
    /// Header-prefixed CBOR.
    Binary,
}

impl Format {
    /// Serializes `value` into a complete file body.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, FormatError> {
        match self {
            Self::Json => Ok(serde_json::to_vec_pretty(value)?),
            Self::Xml => Ok(quick_xml::se::to_string(value)?.into_bytes()),
            Self::Binary => {
                let body = serde_cbor::to_vec(value)?;
                let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
                bytes.extend_from_slice(&header());
                bytes.extend_from_slice(&body);
                Ok(bytes)
            }
        }
    }

    /// Deserializes a file body produced by [`Format::encode`].
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, FormatError> {
        self.check(bytes)?;
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Xml => Ok(quick_xml::de::from_str(std::str::from_utf8(bytes)?)?),
            Self::Binary => Ok(serde_cbor::from_slice(&bytes[HEADER_LEN..])?),
        }
    }

    /// Checks that `bytes` looks like a body of this format.
    ///
    /// Binary bodies must start with the configuration header; other formats
    /// only need to be non-empty.
    pub fn check(self, bytes: &[u8]) -> Result<(), FormatError> {
        match self {
            Self::Binary if !has_valid_header(bytes) => Err(FormatError::MissingHeader),
            _ if bytes.is_empty() => Err(FormatError::Empty),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Xml => write!(f, "xml"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// Builds the binary-format header: magic, a reserved zero byte, version marker.
pub fn header() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..HEADER_MAGIC.len()].copy_from_slice(HEADER_MAGIC);
    header[HEADER_LEN - HEADER_VERSION.len()..].copy_from_slice(&HEADER_VERSION);
    header
}

/// Returns true if `bytes` starts with the magic string and version marker.
pub fn has_valid_header(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN
        && &bytes[..HEADER_MAGIC.len()] == HEADER_MAGIC
        && bytes[HEADER_LEN - HEADER_VERSION.len()..HEADER_LEN] == HEADER_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Settings {
        test: String,
        retries: u32,
        verbose: bool,
    }

    fn sample() -> Settings {
        Settings {
            test: "a".to_string(),
            retries: 3,
            verbose: true,
        }
    }

    #[test]
    fn test_roundtrip_all_formats() {
        for format in [Format::Json, Format::Xml, Format::Binary] {
            let bytes = format.encode(&sample()).unwrap();
            let decoded: Settings = format.decode(&bytes).unwrap();
            assert_eq!(decoded, sample(), "roundtrip failed for {format}");
        }
    }

    #[test]
    fn test_header_layout() {
        let header = header();
        assert_eq!(&header[..25], b"cfgConfig-ValidConfigFile");
        assert_eq!(header[25], 0);
        assert_eq!(header[26..30], [0x02u8, 0, 0, 0]);
        assert!(has_valid_header(&header));
    }

    #[test]
    fn test_binary_body_starts_with_header() {
        let bytes = Format::Binary.encode(&sample()).unwrap();
        assert!(has_valid_header(&bytes));
        assert!(bytes.len() > HEADER_LEN);
    }

    #[test]
    fn test_binary_rejects_missing_header() {
        let body = serde_cbor::to_vec(&sample()).unwrap();
        let err = Format::Binary.decode::<Settings>(&body).unwrap_err();
        assert!(matches!(err, FormatError::MissingHeader));
    }

    #[test]
    fn test_binary_rejects_wrong_version() {
        let mut bytes = Format::Binary.encode(&sample()).unwrap();
        bytes[26] = 0x01;
        assert!(!has_valid_header(&bytes));
        assert!(matches!(
            Format::Binary.check(&bytes),
            Err(FormatError::MissingHeader)
        ));
    }

    #[test]
    fn test_text_formats_only_require_content() {
        assert!(matches!(Format::Json.check(b""), Err(FormatError::Empty)));
        assert!(matches!(Format::Xml.check(b""), Err(FormatError::Empty)));
        assert!(Format::Json.check(b"{}").is_ok());
    }

    #[test]
    fn test_default_format_is_json() {
        assert_eq!(Format::default(), Format::Json);
    }
}
