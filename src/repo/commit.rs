//! Commit construction, canonical encoding and signing.
//!
//! A commit is an immutable record of key-level changes relative to its
//! parents. Its identifier is the blake3 digest of its canonical JSON
//! encoding, which keeps the graph content-addressed: the same parents,
//! changes and metadata always produce the same id. Change maps are ordered
//! (`BTreeMap`) and struct field order is fixed, so the encoding is stable
//! across runs and backends.
//!
//! Commits are signed with the repository's ed25519 key. The signature
//! covers everything except the signature fields themselves and can be
//! checked later with [`Commit::verify`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};
use hifitime::Epoch;
use serde::{Deserialize, Serialize};

use crate::id::{CommitId, ContentId};

/// A single edit for one key: either new content or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// The key now points at the given content payload.
    Put(ContentId),
    /// The key is deleted.
    Delete,
}

/// Commit metadata. Opaque to the engine; carried through verbatim and
/// included in the identifier derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    pub author: String,
    pub message: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
}

impl CommitMeta {
    /// Metadata stamped with the current wall-clock time.
    pub fn new(author: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Epoch::now().expect("system time");
        Self {
            author: author.into(),
            message: message.into(),
            timestamp_ms: now.to_unix_milliseconds() as u64,
        }
    }
}

/// The set of key edits a caller proposes for one commit.
///
/// A changeset is transient: it is built up locally, validated by the commit
/// engine against concurrent history and consumed into an immutable
/// [`Commit`] on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    changes: BTreeMap<String, Change>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages new content for `key`.
    pub fn put(mut self, key: impl Into<String>, content: ContentId) -> Self {
        self.changes.insert(key.into(), Change::Put(content));
        self
    }

    /// Stages a deletion of `key`.
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.changes.insert(key.into(), Change::Delete);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, key: &str) -> Option<&Change> {
        self.changes.get(key)
    }

    /// The staged edits, keyed in lexicographic order.
    pub fn changes(&self) -> &BTreeMap<String, Change> {
        &self.changes
    }
}

impl FromIterator<(String, Change)> for Changeset {
    fn from_iter<I: IntoIterator<Item = (String, Change)>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

/// An immutable node of the commit graph.
///
/// `sequence` increases strictly along every parent edge: a normal commit is
/// its parent's sequence plus one, a merge commit is the maximum of its
/// parents' plus one. This makes ancestor walks prunable and gives the
/// merge-base tie-break a total order to work with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Parent commit ids, in order. Empty for a root commit, two or more for
    /// a merge; the first parent is the line the commit was created on.
    pub parents: Vec<CommitId>,
    /// Changed keys mapped to new content or tombstones.
    pub changes: BTreeMap<String, Change>,
    pub meta: CommitMeta,
    pub sequence: u64,
    /// ed25519 public key of the author of the signature.
    #[serde(with = "crate::id::hexbytes")]
    pub signed_by: [u8; 32],
    /// ed25519 signature over the signable encoding.
    #[serde(with = "crate::id::hexbytes")]
    pub signature: [u8; 64],
}

// The signable view leaves out the signature fields; field order must match
// `Commit` so the two encodings stay aligned.
#[derive(Serialize)]
struct Signable<'a> {
    parents: &'a [CommitId],
    changes: &'a BTreeMap<String, Change>,
    meta: &'a CommitMeta,
    sequence: u64,
}

/// Builds and signs a commit from its constituent parts.
pub fn build(
    signing_key: &SigningKey,
    parents: Vec<CommitId>,
    changes: BTreeMap<String, Change>,
    meta: CommitMeta,
    sequence: u64,
) -> Commit {
    let signable = Signable {
        parents: &parents,
        changes: &changes,
        meta: &meta,
        sequence,
    };
    let bytes = serde_json::to_vec(&signable).expect("infallible commit encoding");
    let signature = signing_key.sign(&bytes);

    Commit {
        parents,
        changes,
        meta,
        sequence,
        signed_by: signing_key.verifying_key().to_bytes(),
        signature: signature.to_bytes(),
    }
}

/// Error returned when a commit blob cannot be decoded.
#[derive(Debug)]
pub struct DecodeError(serde_json::Error);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed commit encoding: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Error returned when a commit's signature does not check out.
#[derive(Debug)]
pub enum ValidationError {
    BadPublicKey,
    FailedValidation,
}

impl From<SignatureError> for ValidationError {
    fn from(_: SignatureError) -> Self {
        ValidationError::FailedValidation
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::BadPublicKey => write!(f, "commit public key is malformed"),
            ValidationError::FailedValidation => write!(f, "commit signature does not match"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl Commit {
    /// The canonical order-stable encoding. Hashing these bytes yields the
    /// commit id, and these are the exact bytes stored in the content store.
    pub fn canonical_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("infallible commit encoding"))
    }

    /// The content-derived identifier of this commit.
    pub fn id(&self) -> CommitId {
        CommitId::digest(&self.canonical_bytes())
    }

    /// Decodes a commit from its canonical encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError)
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let signable = Signable {
            parents: &self.parents,
            changes: &self.changes,
            meta: &self.meta,
            sequence: self.sequence,
        };
        serde_json::to_vec(&signable).expect("infallible commit encoding")
    }

    /// Checks that the embedded signature genuinely signs this commit.
    pub fn verify(&self) -> Result<(), ValidationError> {
        let key =
            VerifyingKey::from_bytes(&self.signed_by).map_err(|_| ValidationError::BadPublicKey)?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.signable_bytes(), &signature)?;
        Ok(())
    }
}
