//! Content digests.
//!
//! A [`Digest`] is the only identity immutable content has. Its textual form
//! is `sha1-<40 lowercase hex>`, which is also the name a blob answers to
//! in the mounted filesystem.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest as _, Sha1};

use crate::Sha1Hash;

/// Prefix of every textual digest.
pub const DIGEST_PREFIX: &str = "sha1-";

/// Number of hex characters after [`DIGEST_PREFIX`].
pub const DIGEST_HEX_LEN: usize = 40;

/// SHA-1 digest of a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(Sha1Hash);

impl Digest {
    /// Hash `data`.
    #[inline]
    pub fn of(data: &[u8]) -> Self {
        let mut hash = Sha1Hash::default();
        hash.copy_from_slice(&Sha1::digest(data));
        Self(hash)
    }

    /// Lowercase hex without the algorithm prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a bare 40-char hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != DIGEST_HEX_LEN {
            return None;
        }
        let mut hash = Sha1Hash::default();
        hex::decode_to_slice(s, &mut hash).ok()?;
        Some(Self(hash))
    }

    /// Parse `sha1-<hex>`, returning `None` for anything else.
    pub fn parse_ref(s: &str) -> Option<Self> {
        Self::from_hex(s.strip_prefix(DIGEST_PREFIX)?)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", DIGEST_PREFIX, self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps tracing output readable.
        write!(f, "Digest({}{})", DIGEST_PREFIX, &self.to_hex()[..12])
    }
}

/// Error returned when a string is not a valid digest ref.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest: {0:?}")]
pub struct ParseDigestError(pub String);

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_ref(s).ok_or_else(|| ParseDigestError(s.to_string()))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
