//! Three-way merge and conflict classification.
//!
//! Merging compares what each side changed relative to the merge base,
//! key by key. A key touched by one side only takes that side's value; a
//! key changed by both sides to the same resulting content is a convergent
//! edit and stays clean; a key changed by both sides to different content
//! is a conflict. The engine never guesses intent: conflicts are reported
//! with the key and the base/ours/theirs content for the caller to resolve.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use tracing::debug;

use crate::id::CommitId;
use crate::repo::commit::{self, Change, CommitMeta};
use crate::repo::graph::{CommitGraph, GraphError};
use crate::repo::{CasOutcome, CommitError, ContentStore, RefStore, Repository};

/// One key both sides changed to different content.
///
/// `base` is the key's effective change as of the merge base (`None` when
/// the key did not exist there); `ours` and `theirs` are the competing
/// edits. Enough structure for a caller to resolve programmatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConflict {
    pub key: String,
    pub base: Option<Change>,
    pub ours: Option<Change>,
    pub theirs: Option<Change>,
}

/// The set of keys that could not be merged cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub conflicts: Vec<KeyConflict>,
}

impl MergeConflict {
    /// The conflicting keys, in the order they were classified.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.conflicts.iter().map(|c| c.key.as_str())
    }
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge conflict on key(s): ")?;
        for (i, key) in self.keys().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MergeConflict {}

/// How a three-way merge resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResolution {
    /// Every key merged cleanly; the unioned changeset is returned.
    Clean(BTreeMap<String, Change>),
    /// One or more keys conflict.
    Conflicted(MergeConflict),
}

/// Classifies every key touched by `ours` or `theirs` relative to `base`.
pub fn three_way_merge<S: ContentStore>(
    graph: &CommitGraph<'_, S>,
    base: CommitId,
    ours: CommitId,
    theirs: CommitId,
) -> Result<MergeResolution, GraphError<S::GetError>> {
    let our_changes = graph.changes_since(Some(base), ours)?;
    let their_changes = graph.changes_since(Some(base), theirs)?;

    let mut merged = BTreeMap::new();
    let mut conflicts = Vec::new();

    // Both maps are key-ordered, so a merge-dedup over the key streams
    // visits every touched key exactly once.
    for key in our_changes.keys().merge(their_changes.keys()).dedup() {
        match (our_changes.get(key), their_changes.get(key)) {
            (Some(change), None) | (None, Some(change)) => {
                merged.insert(key.clone(), change.clone());
            }
            (Some(o), Some(t)) if o == t => {
                // Convergent edit: both sides arrived at the same content.
                merged.insert(key.clone(), o.clone());
            }
            (Some(o), Some(t)) => {
                conflicts.push(KeyConflict {
                    key: key.clone(),
                    base: graph.value_at(base, key)?,
                    ours: Some(o.clone()),
                    theirs: Some(t.clone()),
                });
            }
            (None, None) => unreachable!("key came from one of the two maps"),
        }
    }

    if conflicts.is_empty() {
        Ok(MergeResolution::Clean(merged))
    } else {
        Ok(MergeResolution::Conflicted(MergeConflict { conflicts }))
    }
}

impl<Storage: ContentStore + RefStore> Repository<Storage> {
    /// Merges `other` into the reference `name`.
    ///
    /// Computes the merge base of the current head and `other`, classifies
    /// every touched key and, if clean, advances the reference to a new
    /// commit with parents `[head, other]` — the order is significant for
    /// identifier derivation and first-parent traversal. If `other` is
    /// already an ancestor of the head there is nothing to do and the
    /// current head is returned unchanged.
    ///
    /// The reference update uses the same bounded CAS loop as
    /// [`Repository::propose`]; the merge is recomputed against the fresh
    /// head after every lost race.
    pub fn merge(
        &mut self,
        name: &str,
        other: CommitId,
        meta: CommitMeta,
    ) -> Result<CommitId, CommitError<Storage>> {
        let mut attempts = 0;
        loop {
            attempts += 1;

            let entry = self
                .storage
                .read(name)
                .map_err(CommitError::RefRead)?
                .ok_or_else(|| CommitError::RefNotFound(name.to_string()))?;
            let ours = entry.head;

            let (resolution, sequence) = {
                let graph = CommitGraph::new(&self.storage);
                let base = graph
                    .common_ancestor(ours, other)
                    .map_err(CommitError::from_graph)?
                    .ok_or(CommitError::UnrelatedHistories {
                        expected: other,
                        current: ours,
                    })?;
                if base == other {
                    debug!(reference = name, other = %other, "merge source already contained");
                    return Ok(ours);
                }

                let resolution = three_way_merge(&graph, base, ours, other)
                    .map_err(CommitError::from_graph)?;
                let our_seq = graph.get(ours).map_err(CommitError::from_graph)?.sequence;
                let their_seq = graph.get(other).map_err(CommitError::from_graph)?.sequence;
                (resolution, our_seq.max(their_seq) + 1)
            };

            let merged = match resolution {
                MergeResolution::Clean(changes) => changes,
                MergeResolution::Conflicted(conflict) => {
                    return Err(CommitError::Conflict(conflict))
                }
            };

            let commit = commit::build(
                &self.signing_key,
                vec![ours, other],
                merged,
                meta.clone(),
                sequence,
            );
            let id = self.store_commit(&commit).map_err(CommitError::ContentPut)?;

            match self
                .storage
                .cas(name, entry.token, id)
                .map_err(CommitError::RefUpdate)?
            {
                CasOutcome::Committed(_) => {
                    debug!(reference = name, commit = %id, "merge commit applied");
                    return Ok(id);
                }
                CasOutcome::Stale(Some(_)) => {
                    debug!(reference = name, attempts, "merge lost reference race, recomputing");
                    if attempts >= self.max_attempts {
                        return Err(CommitError::RetryExhausted {
                            name: name.to_string(),
                            attempts,
                        });
                    }
                }
                CasOutcome::Stale(None) => {
                    return Err(CommitError::RefNotFound(name.to_string()))
                }
            }
        }
    }
}
