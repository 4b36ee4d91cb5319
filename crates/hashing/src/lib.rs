//! Content fingerprints for the engine.
//!
//! Every blob the engine stores (file contents, encoded directories, captured
//! process output) is addressed by a [`Digest`]: the SHA-256 [`Fingerprint`]
//! of its bytes plus its length. The length travels with the hash so that
//! readers can size buffers and remote stores can batch by size without
//! loading anything.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Length in bytes of a [`Fingerprint`].
pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 of the empty byte string.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// Digest of zero bytes. Also the digest of the empty directory.
pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// A SHA-256 hash, stored as raw bytes.
///
/// Displays as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Parse a 64-character hex string. Upper-case digits are accepted.
    ///
    /// # Errors
    /// Returns [`ParseError`] if the string has the wrong length or contains
    /// a non-hex character.
    pub fn from_hex_string(s: &str) -> Result<Self, ParseError> {
        if s.len() != FINGERPRINT_SIZE * 2 {
            return Err(ParseError {
                value: s.to_owned(),
                reason: format!(
                    "expected {} hex characters, got {}",
                    FINGERPRINT_SIZE * 2,
                    s.len()
                ),
            });
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(pair[0]).ok_or_else(|| invalid_digit(s, pair[0]))?;
            let lo = hex_digit(pair[1]).ok_or_else(|| invalid_digit(s, pair[1]))?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// First byte as two hex characters; used to shard on-disk layouts.
    #[must_use]
    pub fn prefix_hex(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{self}>")
    }
}

impl FromStr for Fingerprint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex_string(&s).map_err(serde::de::Error::custom)
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn invalid_digit(value: &str, b: u8) -> ParseError {
    ParseError {
        value: value.to_owned(),
        reason: format!("invalid hex digit '{}'", b as char),
    }
}

/// Error from parsing a hex string into a [`Fingerprint`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid fingerprint {value:?}: {reason}")]
pub struct ParseError {
    /// The raw value that failed.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// The address of a blob: its fingerprint and its length.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    #[must_use]
    pub const fn new(hash: Fingerprint, size_bytes: usize) -> Self {
        Self { hash, size_bytes }
    }

    /// Hash `bytes` in memory.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            hash: Fingerprint(hasher.finalize().into()),
            size_bytes: bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == EMPTY_DIGEST
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}, {})", self.hash, self.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// A [`Write`] adapter that hashes everything passing through it.
pub struct WriterHasher<W> {
    hasher: Sha256,
    byte_count: usize,
    inner: W,
}

impl<W: Write> WriterHasher<W> {
    pub fn new(inner: W) -> Self {
        Self {
            hasher: Sha256::new(),
            byte_count: 0,
            inner,
        }
    }

    /// Consume the adapter, returning the digest of the written bytes and the
    /// wrapped writer.
    pub fn finish(self) -> (Digest, W) {
        (
            Digest::new(Fingerprint(self.hasher.finalize().into()), self.byte_count),
            self.inner,
        )
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Only hash what the inner writer accepted.
        self.hasher.update(&buf[..written]);
        self.byte_count += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `writer`, returning `true` if the copied bytes hash to
/// `expected`.
///
/// # Errors
/// Propagates I/O errors from either side.
pub fn sync_verified_copy<R: Read, W: Write>(
    expected: Digest,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool> {
    let mut hasher = WriterHasher::new(writer);
    io::copy(reader, &mut hasher)?;
    let (actual, _) = hasher.finish();
    Ok(actual == expected)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_matches_hash_of_nothing() {
        assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
        assert!(EMPTY_DIGEST.is_empty());
        assert_eq!(
            EMPTY_FINGERPRINT.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn known_digest() {
        let digest = Digest::of_bytes(b"meep");
        assert_eq!(
            digest.hash.to_hex(),
            "23e92dfba8fb0c93cfba31ad2962b4e35a47054296d1d375d7f7e13e0185de7a"
        );
        assert_eq!(digest.size_bytes, 4);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        let err = Fingerprint::from_hex_string("abcd").unwrap_err();
        assert!(err.reason.contains("expected 64"));
    }

    #[test]
    fn parse_rejects_bad_digit() {
        let bad = "g".repeat(64);
        let err = Fingerprint::from_hex_string(&bad).unwrap_err();
        assert!(err.reason.contains("invalid hex digit 'g'"));
    }

    #[test]
    fn parse_accepts_uppercase() {
        let upper = EMPTY_FINGERPRINT.to_hex().to_uppercase();
        assert_eq!(Fingerprint::from_hex_string(&upper).unwrap(), EMPTY_FINGERPRINT);
    }

    #[test]
    fn prefix_hex_is_first_byte() {
        assert_eq!(EMPTY_FINGERPRINT.prefix_hex(), "e3");
    }

    #[test]
    fn digest_serializes_hash_as_hex() {
        let json = serde_json::to_string(&EMPTY_DIGEST).unwrap();
        assert_eq!(
            json,
            r#"{"hash":"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855","size_bytes":0}"#
        );
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EMPTY_DIGEST);
    }

    #[test]
    fn writer_hasher_matches_in_memory_digest() {
        let mut hasher = WriterHasher::new(Vec::new());
        hasher.write_all(b"European ").unwrap();
        hasher.write_all(b"Burmese").unwrap();
        let (digest, written) = hasher.finish();
        assert_eq!(written, b"European Burmese");
        assert_eq!(digest, Digest::of_bytes(b"European Burmese"));
    }

    #[test]
    fn verified_copy_detects_mismatch() {
        let expected = Digest::of_bytes(b"roland");
        let mut out = Vec::new();
        assert!(sync_verified_copy(expected, &mut &b"roland"[..], &mut out).unwrap());
        let mut out = Vec::new();
        assert!(!sync_verified_copy(expected, &mut &b"catnip"[..], &mut out).unwrap());
        assert_eq!(out, b"catnip");
    }

    mod proptests {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hex_parse_inverts_display(bytes in proptest::array::uniform32(any::<u8>())) {
                let fp = Fingerprint::from_bytes(bytes);
                prop_assert_eq!(Fingerprint::from_hex_string(&fp.to_hex()).unwrap(), fp);
            }
        }
    }
}
