//! Versioned metadata storage with git-like semantics.
//!
//! The design separates storage concerns from the history model and reduces
//! the mutable state of a repository to an absolute minimum, making it easy
//! to reason about and allowing for different storage backends.
//!
//! Content stores are collections of blobs addressed by their hash: commit
//! objects and opaque content payloads. On their own they have no notion of
//! branches, order or history, massively relaxing the constraints on
//! storage — any write-once key-value service qualifies, including those
//! without atomic transactions.
//!
//! Reference stores are the one stateful construct: a mapping from a
//! reference name (branch or tag) to a commit id, updated only through
//! compare-and-swap on a per-reference token. Because commits are immutable
//! and chained through parent ids, the head commit id is sufficient to
//! represent the entire history of a branch.
//!
//! ## Basic usage
//!
//! ```rust,ignore
//! use ed25519_dalek::SigningKey;
//! use rand::rngs::OsRng;
//! use strata::prelude::*;
//!
//! let storage = MemoryRepo::default();
//! let mut repo = Repository::new(storage, SigningKey::generate(&mut OsRng));
//!
//! let root = repo
//!     .initial_commit(Changeset::new(), CommitMeta::new("alice", "init"))
//!     .expect("initial commit");
//! repo.create_ref("main", root).expect("create ref");
//!
//! let payload = repo.put_content(b"table-snapshot".as_ref().into()).unwrap();
//! let head = repo
//!     .propose(
//!         "main",
//!         root,
//!         Changeset::new().put("analytics/orders", payload),
//!         CommitMeta::new("alice", "add orders table"),
//!     )
//!     .expect("propose");
//! assert_eq!(repo.read_ref("main").unwrap().head, head);
//! ```
//!
//! ## Handling contention
//!
//! [`Repository::try_propose`] is the single-attempt primitive: it validates
//! the changeset against whatever the reference currently points at and
//! performs one CAS. [`Repository::propose`] is the retrying wrapper that
//! rebases and re-validates for you, bounded by the repository's maximum
//! attempt count. Key-level conflicts are never auto-resolved; they surface
//! as [`MergeConflict`](merge::MergeConflict) with the conflicting keys and
//! the base/ours/theirs content enumerated.
//!
//! The CAS update is the only mutation in the protocol. Commit construction
//! is pure, and a failed attempt leaves nothing behind but an orphaned
//! commit blob that an external collector may reap. This optimistic scheme
//! keeps references consistent without locking and can be provided by many
//! storage systems (for example conditional writes on S3).

pub mod commit;
pub mod engine;
pub mod graph;
pub mod memoryrepo;
pub mod merge;

use std::error::Error;
use std::fmt::{self, Debug};

use bytes::Bytes;
use ed25519_dalek::SigningKey;

use crate::id::{CommitId, ContentId};
use commit::{Changeset, Commit, CommitMeta};
use engine::DEFAULT_MAX_ATTEMPTS;
use graph::{CommitGraph, GraphError, LogIter};
use merge::MergeConflict;

/// Write-once, content-addressed blob storage.
///
/// `put` derives the key from the bytes, so storing the same payload twice
/// is idempotent and no update-in-place exists. This is what lets the graph
/// share commits freely and lets backends skip mutual exclusion entirely.
pub trait ContentStore {
    type PutError: Error + Debug + Send + Sync + 'static;
    type GetError: Error + Debug + Send + Sync + 'static;

    /// Stores `bytes` and returns its content-derived id.
    fn put(&mut self, bytes: Bytes) -> Result<ContentId, Self::PutError>;

    /// Retrieves the payload addressed by `id`, or `None` if absent.
    fn get(&self, id: ContentId) -> Result<Option<Bytes>, Self::GetError>;

    /// True if `id` is present. Backends may override with a cheaper probe.
    fn contains(&self, id: ContentId) -> Result<bool, Self::GetError> {
        Ok(self.get(id)?.is_some())
    }
}

/// Opaque revision marker of a reference.
///
/// The only property required of a token is that it changes on every
/// successful write to its reference, so a CAS presented with a stale token
/// fails deterministically. A backend may derive it from the commit id, a
/// version counter or a storage etag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefToken(pub u64);

/// Snapshot of a reference as read from a [`RefStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefEntry {
    pub head: CommitId,
    pub token: RefToken,
}

/// Outcome of creating a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The reference was created; its initial token is returned.
    Created(RefToken),
    /// The name is already bound; the current entry is returned.
    AlreadyExists(RefEntry),
}

/// Outcome of a compare-and-swap or delete on a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The update was applied; the reference's new token is returned.
    Committed(RefToken),
    /// The presented token was stale. Carries the current entry so the
    /// caller can re-validate against the winner, or `None` if the
    /// reference no longer exists.
    Stale(Option<RefEntry>),
}

/// The single mutable shared resource in the system.
///
/// Exclusivity is enforced purely through tokens, never through external
/// locking: the atomic compare-and-swap on one reference is the only
/// synchronization primitive the engine requires of a backend.
pub trait RefStore {
    type RefsError: Error + Debug + Send + Sync + 'static;
    type ReadError: Error + Debug + Send + Sync + 'static;
    type UpdateError: Error + Debug + Send + Sync + 'static;

    type NamesIter<'a>: Iterator<Item = Result<String, Self::RefsError>>
    where
        Self: 'a;

    /// Lists all reference names.
    fn refs<'a>(&'a mut self) -> Result<Self::NamesIter<'a>, Self::RefsError>;

    /// Reads the current head and token of `name`, or `None` if unbound.
    fn read(&mut self, name: &str) -> Result<Option<RefEntry>, Self::ReadError>;

    /// Binds `name` to `head` if the name is free.
    fn create(&mut self, name: &str, head: CommitId) -> Result<CreateOutcome, Self::UpdateError>;

    /// Atomically advances `name` to `new_head`, gated on `expected`.
    fn cas(
        &mut self,
        name: &str,
        expected: RefToken,
        new_head: CommitId,
    ) -> Result<CasOutcome, Self::UpdateError>;

    /// Removes `name`, gated on `expected`. The commits it pointed at stay
    /// in the content store.
    fn delete(&mut self, name: &str, expected: RefToken) -> Result<CasOutcome, Self::UpdateError>;
}

/// A commit names a parent or content id that is absent from the content
/// store. Fatal: this indicates backend corruption and is never masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    MissingCommit(CommitId),
    MissingContent(ContentId),
    MalformedCommit { id: CommitId, detail: String },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::MissingCommit(id) => {
                write!(f, "commit {id} is referenced but not stored")
            }
            IntegrityError::MissingContent(id) => {
                write!(f, "content {id} is referenced but not stored")
            }
            IntegrityError::MalformedCommit { id, detail } => {
                write!(f, "commit {id} could not be decoded: {detail}")
            }
        }
    }
}

impl Error for IntegrityError {}

/// Error raised by the commit protocol ([`Repository::propose`] and
/// [`Repository::merge`]).
#[derive(Debug)]
pub enum CommitError<Storage: ContentStore + RefStore> {
    /// The target reference does not exist.
    RefNotFound(String),
    /// One or more keys were changed concurrently with differing content.
    Conflict(MergeConflict),
    /// The bounded rebase-and-retry loop lost every CAS race.
    RetryExhausted { name: String, attempts: usize },
    /// The supplied expected head shares no history with the current head.
    UnrelatedHistories { expected: CommitId, current: CommitId },
    /// A referenced commit or content id is missing or undecodable.
    Integrity(IntegrityError),
    /// The backend failed while writing a blob.
    ContentPut(<Storage as ContentStore>::PutError),
    /// The backend failed while reading a blob.
    ContentGet(<Storage as ContentStore>::GetError),
    /// The backend failed while reading the reference.
    RefRead(<Storage as RefStore>::ReadError),
    /// The backend failed while updating the reference.
    RefUpdate(<Storage as RefStore>::UpdateError),
}

impl<Storage: ContentStore + RefStore> fmt::Display for CommitError<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::RefNotFound(name) => write!(f, "reference {name:?} not found"),
            CommitError::Conflict(c) => write!(f, "{c}"),
            CommitError::RetryExhausted { name, attempts } => {
                write!(f, "gave up on {name:?} after {attempts} contended attempts")
            }
            CommitError::UnrelatedHistories { expected, current } => write!(
                f,
                "expected head {expected} shares no history with current head {current}"
            ),
            CommitError::Integrity(e) => write!(f, "{e}"),
            CommitError::ContentPut(e) => write!(f, "content write failed: {e}"),
            CommitError::ContentGet(e) => write!(f, "content read failed: {e}"),
            CommitError::RefRead(e) => write!(f, "reference read failed: {e}"),
            CommitError::RefUpdate(e) => write!(f, "reference update failed: {e}"),
        }
    }
}

impl<Storage: ContentStore + RefStore + Debug> Error for CommitError<Storage> {}

impl<Storage: ContentStore + RefStore> CommitError<Storage> {
    pub(crate) fn from_graph(e: GraphError<<Storage as ContentStore>::GetError>) -> Self {
        match e {
            GraphError::Storage(e) => CommitError::ContentGet(e),
            GraphError::Missing(id) => CommitError::Integrity(IntegrityError::MissingCommit(id)),
            GraphError::Malformed { id, detail } => {
                CommitError::Integrity(IntegrityError::MalformedCommit { id, detail })
            }
        }
    }
}

/// Error raised by reference management ([`Repository::create_ref`],
/// [`Repository::delete_ref`], [`Repository::read_ref`]).
#[derive(Debug)]
pub enum RefError<Storage: ContentStore + RefStore> {
    /// The reference does not exist.
    NotFound(String),
    /// Reference creation hit a name that is already bound.
    AlreadyExists { name: String, current: RefEntry },
    /// The presented token lost a race; carries the winner's entry when the
    /// reference still exists.
    Stale { name: String, current: Option<RefEntry> },
    /// The commit a new reference should point at is not stored.
    CommitMissing(CommitId),
    /// The backend failed while reading a blob.
    ContentGet(<Storage as ContentStore>::GetError),
    /// The backend failed while reading the reference.
    RefRead(<Storage as RefStore>::ReadError),
    /// The backend failed while updating the reference.
    RefUpdate(<Storage as RefStore>::UpdateError),
}

impl<Storage: ContentStore + RefStore> fmt::Display for RefError<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefError::NotFound(name) => write!(f, "reference {name:?} not found"),
            RefError::AlreadyExists { name, .. } => {
                write!(f, "reference {name:?} already exists")
            }
            RefError::Stale { name, .. } => {
                write!(f, "reference {name:?} was modified concurrently")
            }
            RefError::CommitMissing(id) => {
                write!(f, "commit {id} is not present in the content store")
            }
            RefError::ContentGet(e) => write!(f, "content read failed: {e}"),
            RefError::RefRead(e) => write!(f, "reference read failed: {e}"),
            RefError::RefUpdate(e) => write!(f, "reference update failed: {e}"),
        }
    }
}

impl<Storage: ContentStore + RefStore + Debug> Error for RefError<Storage> {}

/// Error raised when walking the history behind a reference.
#[derive(Debug)]
pub enum HistoryError<Storage: ContentStore + RefStore> {
    RefNotFound(String),
    RefRead(<Storage as RefStore>::ReadError),
    Graph(GraphError<<Storage as ContentStore>::GetError>),
}

impl<Storage: ContentStore + RefStore> fmt::Display for HistoryError<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::RefNotFound(name) => write!(f, "reference {name:?} not found"),
            HistoryError::RefRead(e) => write!(f, "reference read failed: {e}"),
            HistoryError::Graph(e) => write!(f, "{e}"),
        }
    }
}

impl<Storage: ContentStore + RefStore + Debug> Error for HistoryError<Storage> {}

/// High-level façade combining a content store and a reference store.
///
/// `Repository` exposes the reference lifecycle, the commit protocol and
/// history traversal while delegating all persistence to the given backend.
/// It holds no locks and no state beyond the backend handle and the signing
/// key; independent instances over a shared backend coordinate purely
/// through the reference store's CAS.
pub struct Repository<Storage: ContentStore + RefStore> {
    storage: Storage,
    signing_key: SigningKey,
    max_attempts: usize,
}

impl<Storage: ContentStore + RefStore> Repository<Storage> {
    pub fn new(storage: Storage, signing_key: SigningKey) -> Self {
        Self {
            storage,
            signing_key,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides the bound on the rebase-and-retry loop.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Consumes the repository and returns the underlying backend.
    pub fn into_storage(self) -> Storage {
        self.storage
    }

    /// Replaces the repository signing key used for new commits.
    pub fn set_signing_key(&mut self, signing_key: SigningKey) {
        self.signing_key = signing_key;
    }

    /// Read-only view of the commit graph.
    pub fn graph(&self) -> CommitGraph<'_, Storage> {
        CommitGraph::new(&self.storage)
    }

    /// Stores an opaque content payload, returning its id for use in a
    /// [`Changeset`].
    pub fn put_content(
        &mut self,
        bytes: Bytes,
    ) -> Result<ContentId, <Storage as ContentStore>::PutError> {
        self.storage.put(bytes)
    }

    /// Retrieves a previously stored content payload.
    pub fn get_content(
        &self,
        id: ContentId,
    ) -> Result<Option<Bytes>, <Storage as ContentStore>::GetError> {
        self.storage.get(id)
    }

    pub(crate) fn store_commit(
        &mut self,
        commit: &Commit,
    ) -> Result<CommitId, <Storage as ContentStore>::PutError> {
        let content_id = self.storage.put(commit.canonical_bytes())?;
        Ok(CommitId::from_bytes(*content_id.as_bytes()))
    }

    /// Builds, signs and stores a parentless root commit.
    ///
    /// References are created pointing at existing commits, so a fresh
    /// repository starts here. Content ids named by the changeset must
    /// already be stored.
    pub fn initial_commit(
        &mut self,
        changes: Changeset,
        meta: CommitMeta,
    ) -> Result<CommitId, CommitError<Storage>> {
        self.ensure_content_present(&changes)?;
        let commit = commit::build(
            &self.signing_key,
            Vec::new(),
            changes.changes().clone(),
            meta,
            0,
        );
        self.store_commit(&commit).map_err(CommitError::ContentPut)
    }

    /// Creates a new reference pointing at an existing commit.
    pub fn create_ref(&mut self, name: &str, head: CommitId) -> Result<RefToken, RefError<Storage>> {
        let present = self
            .storage
            .contains(head.into())
            .map_err(RefError::ContentGet)?;
        if !present {
            return Err(RefError::CommitMissing(head));
        }
        match self
            .storage
            .create(name, head)
            .map_err(RefError::RefUpdate)?
        {
            CreateOutcome::Created(token) => {
                tracing::debug!(reference = name, head = %head, "reference created");
                Ok(token)
            }
            CreateOutcome::AlreadyExists(current) => Err(RefError::AlreadyExists {
                name: name.to_string(),
                current,
            }),
        }
    }

    /// Reads the current head and token of `name`.
    pub fn read_ref(&mut self, name: &str) -> Result<RefEntry, RefError<Storage>> {
        self.storage
            .read(name)
            .map_err(RefError::RefRead)?
            .ok_or_else(|| RefError::NotFound(name.to_string()))
    }

    /// Removes `name`, gated on the token from a prior read. Commits stay in
    /// the content store; unreachable ones become collectible externally.
    pub fn delete_ref(&mut self, name: &str, expected: RefToken) -> Result<(), RefError<Storage>> {
        match self
            .storage
            .delete(name, expected)
            .map_err(RefError::RefUpdate)?
        {
            CasOutcome::Committed(_) => {
                tracing::debug!(reference = name, "reference deleted");
                Ok(())
            }
            CasOutcome::Stale(current) => Err(RefError::Stale {
                name: name.to_string(),
                current,
            }),
        }
    }

    /// Lists all reference names.
    pub fn ref_names(&mut self) -> Result<Vec<String>, <Storage as RefStore>::RefsError> {
        self.storage.refs()?.collect()
    }

    /// Walks the history behind `name`, newest-first, stopping before
    /// `since` (exclusive) when given.
    pub fn history(
        &mut self,
        name: &str,
        since: Option<CommitId>,
    ) -> Result<LogIter<'_, Storage>, HistoryError<Storage>> {
        let entry = self
            .storage
            .read(name)
            .map_err(HistoryError::RefRead)?
            .ok_or_else(|| HistoryError::RefNotFound(name.to_string()))?;
        CommitGraph::new(&self.storage)
            .log_since(since, entry.head)
            .map_err(HistoryError::Graph)
    }
}
