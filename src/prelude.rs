//! Common imports for working with a repository.

pub use crate::id::{CommitId, ContentId};
pub use crate::repo::commit::{Change, Changeset, Commit, CommitMeta};
pub use crate::repo::engine::Attempt;
pub use crate::repo::graph::CommitGraph;
pub use crate::repo::memoryrepo::MemoryRepo;
pub use crate::repo::merge::{KeyConflict, MergeConflict, MergeResolution};
pub use crate::repo::{
    CasOutcome, CommitError, ContentStore, CreateOutcome, HistoryError, IntegrityError, RefEntry,
    RefError, RefStore, RefToken, Repository,
};
