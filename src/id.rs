//! Content-derived identifiers.
//!
//! Every object in the store is addressed by the blake3 digest of its bytes.
//! Commits and content payloads share the same digest format but are kept as
//! distinct types so that a reference can never be pointed at a raw payload
//! by accident. Conversions between the two are explicit.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a blake3 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Error returned when parsing an identifier from its hex form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    detail: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid identifier: {}", self.detail)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; DIGEST_LEN]);

        impl $name {
            /// Wraps an existing raw digest.
            pub const fn from_bytes(raw: [u8; DIGEST_LEN]) -> Self {
                Self(raw)
            }

            /// Hashes `bytes` and returns the resulting identifier.
            pub fn digest(bytes: &[u8]) -> Self {
                Self(*blake3::hash(bytes).as_bytes())
            }

            /// Raw digest bytes.
            pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| ParseIdError {
                    detail: e.to_string(),
                })?;
                let raw: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| ParseIdError {
                    detail: format!("expected {} hex bytes", DIGEST_LEN),
                })?;
                Ok(Self(raw))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

digest_id! {
    /// Identifier of a commit object, derived from its canonical encoding.
    CommitId
}

digest_id! {
    /// Identifier of an opaque content payload.
    ContentId
}

// Commits live in the content store under the same digest they are addressed
// by as commits, so the conversion is a plain re-wrap.
impl From<CommitId> for ContentId {
    fn from(id: CommitId) -> Self {
        ContentId(id.0)
    }
}

/// Serde helpers encoding fixed-size byte arrays as lowercase hex strings.
///
/// Used for the signature fields of a commit, keeping the canonical encoding
/// human-readable and free of non-deterministic byte-sequence formats.
pub(crate) mod hexbytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} hex bytes")))
    }
}
