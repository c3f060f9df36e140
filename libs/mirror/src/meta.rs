//! Image references, content digests and the tag-to-digest binding.
//!
//! An [`ImageMeta`] is created exactly once per reference, when its digest is
//! resolved, and never changes afterwards. Everything downstream of digest
//! resolution addresses content through the pinned [`Digest`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Errors from parsing image references and digests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image reference is empty")]
    Empty,

    #[error("image reference {0} has neither a tag nor a digest")]
    MissingTag(String),

    #[error("invalid digest {0}")]
    InvalidDigest(String),

    #[error("invalid tag {0:?}: expected [A-Za-z0-9_][A-Za-z0-9._-]{{0,127}}")]
    InvalidTag(String),
}

/// Longest tag the OCI distribution API accepts.
const MAX_TAG_LEN: usize = 128;

/// Check `tag` against the OCI tag grammar `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
///
/// Anything else cannot round-trip through a `repo:tag` reference.
pub fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let mut bytes = tag.bytes();
    let valid = match bytes.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == b'_')
                && tag.len() <= MAX_TAG_LEN
                && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}

/// A sha256 content digest in `sha256:hex` form, e.g. `sha256:a3ed95ca...`.
///
/// Only sha256 is accepted: every blob and manifest check hashes with it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(value: &str) -> Result<Self, ReferenceError> {
        let invalid = || ReferenceError::InvalidDigest(value.to_string());

        let (algorithm, encoded) = value.split_once(':').ok_or_else(invalid)?;
        let is_lower_hex = encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if algorithm != "sha256" || encoded.len() != 64 || !is_lower_hex {
            return Err(invalid());
        }

        Ok(Self(value.to_string()))
    }

    /// Compute the sha256 digest of a byte slice.
    pub fn sha256_of(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }

    /// Algorithm part (`sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// Hex-encoded part.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// A parsed `registry/repo:tag`, `registry/repo@digest` or
/// `registry/repo:tag@digest` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Everything before the tag/digest, registry host included.
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a full image reference.
    ///
    /// A `:` that is followed by a `/` separates a registry port, not a tag.
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        if reference.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (reference, None),
        };

        let (repository, tag) = match name.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') && !tag.is_empty() => {
                (repo, Some(tag.to_string()))
            }
            _ => (name, None),
        };
        if let Some(tag) = &tag {
            validate_tag(tag)?;
        }

        if repository.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if tag.is_none() && digest.is_none() {
            return Err(ReferenceError::MissingTag(reference.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// The tag an [`ImageMeta`] is filed under: the tag itself, or the digest
    /// hex for digest-only references.
    pub fn tag_for_meta(&self) -> String {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => digest.encoded().to_string(),
            (None, None) => String::new(),
        }
    }

    /// `repository:tag`, dropping any digest.
    pub fn with_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.repository, tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Binding of a tag reference to the digest it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Short human tag, e.g. `v1.70.0`.
    pub tag: String,
    /// Full reference the digest was resolved from.
    pub tag_reference: String,
    pub digest: Digest,
}

impl ImageMeta {
    pub fn new(tag: impl Into<String>, tag_reference: impl Into<String>, digest: Digest) -> Self {
        Self {
            tag: tag.into(),
            tag_reference: tag_reference.into(),
            digest,
        }
    }

    /// `repository@digest` for the pinned content.
    pub fn digest_reference(&self) -> String {
        let repository = ImageReference::parse(&self.tag_reference)
            .map(|r| r.repository)
            .unwrap_or_else(|_| self.tag_reference.clone());
        format!("{}@{}", repository, self.digest)
    }
}

/// Derive the `io.deckhouse.image.short_tag` value for a reference.
///
/// Extension images live under `/extra/` and keep their image name so they can
/// share one flat index with ordinary images: `reg/repo/extra/foo:bar` gives
/// `foo:bar`, while `reg/repo:bar` gives `bar`.
pub fn short_tag(tag_reference: &str, tag: &str) -> String {
    match tag_reference.split_once("/extra/") {
        Some((_, extra)) => extra
            .split_once('@')
            .map(|(name, _)| name)
            .unwrap_or(extra)
            .to_string(),
        None => tag.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const HEX: &str = "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

    fn digest() -> Digest {
        Digest::parse(&format!("sha256:{HEX}")).unwrap()
    }

    #[test]
    fn test_digest_parse() {
        let d = digest();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.encoded(), HEX);
        assert_eq!(d.to_string(), format!("sha256:{HEX}"));
    }

    #[rstest]
    #[case("sha256:abc")]
    #[case("md5:d41d8cd98f00b204e9800998ecf8427e")]
    #[case("sha512:4471ab5bd5ca1dd94471ab5bd5ca1dd94471ab5bd5ca1dd94471ab5bd5ca1dd94471ab5bd5ca1dd94471ab5bd5ca1dd94471ab5bd5ca1dd94471ab5bd5ca1dd9")]
    #[case("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4")]
    #[case("sha256:A3ED95CAEB02FFE68CDD9FD84406680AE93D633CB16422D00E8A7C22955B46D4")]
    fn test_digest_parse_rejects(#[case] input: &str) {
        assert!(matches!(
            Digest::parse(input),
            Err(ReferenceError::InvalidDigest(_))
        ));
    }

    #[test]
    fn test_sha256_of() {
        let d = Digest::sha256_of(b"");
        assert_eq!(
            d.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digest_serde_roundtrip_validates() {
        let json = serde_json::to_string(&digest()).unwrap();
        assert_eq!(json, format!("\"sha256:{HEX}\""));
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }

    #[test]
    fn test_parse_tag_reference() {
        let r = ImageReference::parse("registry.example.com/deckhouse/ee/installer:v1.70.0").unwrap();
        assert_eq!(r.repository, "registry.example.com/deckhouse/ee/installer");
        assert_eq!(r.tag.as_deref(), Some("v1.70.0"));
        assert!(r.digest.is_none());
        assert_eq!(r.tag_for_meta(), "v1.70.0");
    }

    #[test]
    fn test_parse_digest_reference() {
        let r = ImageReference::parse(&format!("reg.io/repo@sha256:{HEX}")).unwrap();
        assert_eq!(r.repository, "reg.io/repo");
        assert!(r.tag.is_none());
        assert_eq!(r.digest, Some(digest()));
        assert_eq!(r.tag_for_meta(), HEX);
    }

    #[test]
    fn test_parse_pinned_reference() {
        let raw = format!("reg.io/repo:v1@sha256:{HEX}");
        let r = ImageReference::parse(&raw).unwrap();
        assert_eq!(r.repository, "reg.io/repo");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.digest, Some(digest()));
        assert_eq!(r.to_string(), raw);
    }

    #[test]
    fn test_parse_registry_port() {
        let r = ImageReference::parse("localhost:5000/repo:dev").unwrap();
        assert_eq!(r.repository, "localhost:5000/repo");
        assert_eq!(r.tag.as_deref(), Some("dev"));

        assert!(matches!(
            ImageReference::parse("localhost:5000/repo"),
            Err(ReferenceError::MissingTag(_))
        ));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(ImageReference::parse(""), Err(ReferenceError::Empty));
        assert!(matches!(
            ImageReference::parse("reg.io/repo@sha256:zz"),
            Err(ReferenceError::InvalidDigest(_))
        ));
    }

    #[rstest]
    #[case("v1.70.0", true)]
    #[case("_build-7", true)]
    #[case(&"a".repeat(128), true)]
    #[case("", false)]
    #[case("v2:rc", false)]
    #[case(".hidden", false)]
    #[case("-rc", false)]
    #[case("v1/beta", false)]
    #[case(&"a".repeat(129), false)]
    fn test_validate_tag(#[case] tag: &str, #[case] valid: bool) {
        assert_eq!(validate_tag(tag).is_ok(), valid, "tag {tag:?}");
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        assert!(matches!(
            ImageReference::parse("reg.io/repo:-rc"),
            Err(ReferenceError::InvalidTag(_))
        ));
    }

    #[test]
    fn test_with_tag_drops_digest() {
        let r = ImageReference::parse(&format!("reg.io/repo:v1@sha256:{HEX}")).unwrap();
        assert_eq!(r.with_tag("v2"), "reg.io/repo:v2");
    }

    #[test]
    fn test_digest_reference() {
        let meta = ImageMeta::new("v1", "reg.io/repo:v1", digest());
        assert_eq!(meta.digest_reference(), format!("reg.io/repo@sha256:{HEX}"));
    }

    #[rstest]
    #[case("registry/repo/extra/foo:bar", "bar", "foo:bar")]
    #[case("registry/repo:bar", "bar", "bar")]
    #[case(
        "registry/repo/extra/foo:bar@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4",
        "bar",
        "foo:bar"
    )]
    fn test_short_tag(#[case] reference: &str, #[case] tag: &str, #[case] expected: &str) {
        assert_eq!(short_tag(reference, tag), expected);
    }
}
