//! Deterministic hashed names for cache entries
//!
//! A cache key is an opaque request fingerprint. On disk it becomes a
//! [`HashedName`]: an uppercase hex prefix of the key's SHA-256 digest,
//! followed by `.` and a file extension. The prefix length is configurable
//! (2..=64 hex characters, always even) and doubles as the shard-tree depth,
//! so one knob controls both name brevity and directory fan-out.
//!
//! `HashedName` is the only name type the store accepts. It cannot be built
//! from arbitrary strings: construction goes through [`hashed_name`] or the
//! validating [`HashedName::parse`], which reject anything capable of path
//! traversal. Whatever hostile content a key carries, the name derived from
//! it is plain hex.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::{MAX_NAME_LENGTH, MIN_NAME_LENGTH};
use crate::error::{Error, Result};

/// Extensions recognized when deriving a hint from the key itself.
const KNOWN_EXTENSIONS: [&str; 6] = ["bmp", "gif", "jpeg", "jpg", "png", "webp"];

/// A validated, filesystem-safe cache entry name: `{HEX}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashedName(String);

impl HashedName {
    /// Reconstruct a name from its string form, e.g. one recorded by a host.
    ///
    /// The hex portion must be uppercase, even-length and within bounds; the
    /// extension must be a non-empty alphanumeric token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathEscape`] when the candidate contains separators
    /// or parent references, and [`Error::InvalidArgument`] for any other
    /// malformation.
    pub fn parse(candidate: &str) -> Result<Self> {
        if candidate.contains(['/', '\\']) || candidate.contains("..") {
            return Err(Error::path_escape(candidate));
        }
        let Some((hex, extension)) = candidate.split_once('.') else {
            return Err(Error::invalid_argument(format!(
                "cache name has no extension: {candidate:?}"
            )));
        };
        let length = hex.len();
        if length < usize::from(MIN_NAME_LENGTH)
            || length > usize::from(MAX_NAME_LENGTH)
            || length % 2 != 0
        {
            return Err(Error::invalid_argument(format!(
                "cache name hex portion must be even and within \
                 {MIN_NAME_LENGTH}..={MAX_NAME_LENGTH} characters, got {length}"
            )));
        }
        if !hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
        {
            return Err(Error::invalid_argument(format!(
                "cache name hex portion must be uppercase hex: {hex:?}"
            )));
        }
        validate_extension(extension)?;
        Ok(Self(candidate.to_string()))
    }

    /// The full name, hex prefix plus extension.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The uppercase hex prefix, which also defines the shard directories.
    #[must_use]
    pub fn hex(&self) -> &str {
        // Split cannot fail: construction guarantees exactly one dot.
        self.0.split_once('.').map_or(self.0.as_str(), |(h, _)| h)
    }

    /// The extension, without the leading dot.
    #[must_use]
    pub fn extension(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, e)| e)
    }
}

impl fmt::Display for HashedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the on-disk name for a cache key.
///
/// Hashes the key's bytes with SHA-256, keeps the first `length / 2` digest
/// bytes rendered as uppercase hex, and appends `.` plus `extension`. The
/// mapping is a pure function: equal inputs always produce equal names.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] when `length` is odd or outside
/// 2..=64, and [`Error::PathEscape`] when `extension` is not a plain
/// alphanumeric token.
pub fn hashed_name(key: &str, length: u8, extension: &str) -> Result<HashedName> {
    if length < MIN_NAME_LENGTH || length > MAX_NAME_LENGTH {
        return Err(Error::invalid_argument(format!(
            "hash length must be within {MIN_NAME_LENGTH}..={MAX_NAME_LENGTH}, got {length}"
        )));
    }
    if length % 2 != 0 {
        return Err(Error::invalid_argument(format!(
            "hash length must be even, got {length}"
        )));
    }
    validate_extension(extension)?;

    let digest = Sha256::digest(key.as_bytes());
    let mut name = hex::encode_upper(&digest[..usize::from(length) / 2]);
    name.reserve(extension.len() + 1);
    name.push('.');
    name.push_str(extension);
    Ok(HashedName(name))
}

/// Pick the extension hint for a key, looking at the key's own trailing
/// extension before any query or fragment suffix.
///
/// Recognized raster extensions are returned in canonical lowercase form;
/// anything else falls back to `default`. `img/cat.jpg?w=200` yields `jpg`.
#[must_use]
pub fn extension_from_key<'a>(key: &'a str, default: &'a str) -> &'a str {
    let path = key.split(['?', '#']).next().unwrap_or(key);
    match path.rsplit_once('.') {
        Some((_, candidate)) => KNOWN_EXTENSIONS
            .iter()
            .find(|known| candidate.eq_ignore_ascii_case(known))
            .copied()
            .unwrap_or(default),
        None => default,
    }
}

fn validate_extension(extension: &str) -> Result<()> {
    if extension.is_empty() || !extension.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::path_escape(extension));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        let a = hashed_name("img/cat.jpg?w=200", 12, "jpg").unwrap();
        let b = hashed_name("img/cat.jpg?w=200", 12, "jpg").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hex_portion_has_requested_length() {
        for length in [2u8, 8, 12, 32, 64] {
            let name = hashed_name("some/key", length, "png").unwrap();
            assert_eq!(name.hex().len(), usize::from(length));
        }
    }

    #[test]
    fn known_digest_prefix_is_rendered_uppercase() {
        // sha256("hello world") = b94d27b9934d3e08a52e52d7da7dabf...
        let name = hashed_name("hello world", 12, "png").unwrap();
        assert_eq!(name.as_str(), "B94D27B9934D.png");
    }

    #[test]
    fn example_key_yields_expected_name() {
        // sha256("img/cat.jpg?w=200") = 26ddb482245fbc8601d3fffb7fd7644d...
        let name = hashed_name("img/cat.jpg?w=200", 8, "jpg").unwrap();
        assert_eq!(name.as_str(), "26DDB482.jpg");
        assert_eq!(name.hex(), "26DDB482");
        assert_eq!(name.extension(), "jpg");
    }

    #[test]
    fn empty_key_is_hashable() {
        // sha256("") = e3b0c442...
        let name = hashed_name("", 2, "gif").unwrap();
        assert_eq!(name.as_str(), "E3.gif");
    }

    #[test]
    fn odd_length_is_rejected() {
        let err = hashed_name("key", 7, "jpg").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn out_of_bounds_lengths_are_rejected() {
        assert!(hashed_name("key", 0, "jpg").is_err());
        assert!(hashed_name("key", 66, "jpg").is_err());
    }

    #[test]
    fn traversal_capable_extension_is_rejected() {
        let err = hashed_name("key", 8, "../../etc").unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
        assert!(hashed_name("key", 8, "").is_err());
        assert!(hashed_name("key", 8, "jp g").is_err());
    }

    #[test]
    fn parse_accepts_generated_names() {
        let name = hashed_name("img/cat.jpg?w=200", 16, "webp").unwrap();
        let reparsed = HashedName::parse(name.as_str()).unwrap();
        assert_eq!(reparsed, name);
    }

    #[test]
    fn parse_rejects_traversal_and_malformation() {
        assert!(matches!(
            HashedName::parse("../AB.jpg"),
            Err(Error::PathEscape { .. })
        ));
        assert!(matches!(
            HashedName::parse("AB/CD.jpg"),
            Err(Error::PathEscape { .. })
        ));
        // Lowercase hex, missing extension, odd hex length
        assert!(HashedName::parse("abcdef.jpg").is_err());
        assert!(HashedName::parse("ABCDEF").is_err());
        assert!(HashedName::parse("ABC.jpg").is_err());
    }

    #[test]
    fn extension_hint_survives_query_and_fragment() {
        assert_eq!(extension_from_key("img/cat.jpg?w=200", "png"), "jpg");
        assert_eq!(extension_from_key("img/cat.webp#frag", "png"), "webp");
    }

    #[test]
    fn extension_hint_is_canonical_lowercase() {
        assert_eq!(extension_from_key("IMG/CAT.JPG", "png"), "jpg");
        assert_eq!(extension_from_key("a.JPEG?x=1", "png"), "jpeg");
    }

    #[test]
    fn unrecognized_extension_falls_back_to_default() {
        assert_eq!(extension_from_key("img/cat.svg", "jpg"), "jpg");
        assert_eq!(extension_from_key("no-extension", "jpg"), "jpg");
        assert_eq!(extension_from_key("trailing.dot.", "jpg"), "jpg");
    }

    #[test]
    fn distinct_keys_produce_distinct_names() {
        let a = hashed_name("img/cat.jpg?w=200", 16, "jpg").unwrap();
        let b = hashed_name("img/cat.jpg?w=201", 16, "jpg").unwrap();
        assert_ne!(a, b);
    }
}
