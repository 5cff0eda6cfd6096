//! The propose-validate-commit-apply protocol.
//!
//! A proposal names the reference it targets, the head the caller believed
//! it had when the data was read, and a changeset. Validation happens
//! against whatever the reference points at *now*: if another writer has
//! advanced it, the changeset is checked key-by-key against every commit in
//! the range between the merge base and the current head. Disjoint edits
//! rebase cleanly onto the new head; overlapping edits surface as conflicts
//! and are never auto-resolved.
//!
//! Commit construction is pure. The only observable mutation is the final
//! CAS on the reference, so a caller may abandon an attempt at any point
//! with no side effect beyond an inert orphaned commit blob.

use tracing::debug;

use crate::id::CommitId;
use crate::repo::commit::{self, Change, Changeset, CommitMeta};
use crate::repo::graph::CommitGraph;
use crate::repo::merge::{KeyConflict, MergeConflict};
use crate::repo::{
    CasOutcome, CommitError, ContentStore, IntegrityError, RefStore, Repository,
};

/// Default bound on the rebase-and-retry loop.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Result of a single proposal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The reference was advanced to the new commit.
    Committed(CommitId),
    /// A third writer won the CAS between validation and write; carries the
    /// head that beat us. Re-validation against it may still succeed.
    Raced { current: CommitId },
}

impl<Storage: ContentStore + RefStore> Repository<Storage> {
    /// Proposes a commit on `name`, rebasing and retrying on contention up
    /// to the repository's attempt bound.
    ///
    /// `expected_head` is the commit id the caller read its data at. On
    /// success the reference points at the returned commit. Exhausting the
    /// retry bound surfaces as [`CommitError::RetryExhausted`]; the change
    /// is never silently dropped.
    pub fn propose(
        &mut self,
        name: &str,
        expected_head: CommitId,
        changes: Changeset,
        meta: CommitMeta,
    ) -> Result<CommitId, CommitError<Storage>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_propose(name, expected_head, &changes, &meta)? {
                Attempt::Committed(id) => return Ok(id),
                Attempt::Raced { current } => {
                    debug!(
                        reference = name,
                        attempts,
                        head = %current,
                        "lost reference race, revalidating"
                    );
                    if attempts >= self.max_attempts {
                        return Err(CommitError::RetryExhausted {
                            name: name.to_string(),
                            attempts,
                        });
                    }
                }
            }
        }
    }

    /// Single-attempt proposal: validate against the current head, build
    /// the commit and try the CAS once.
    ///
    /// Returns [`Attempt::Raced`] when the CAS lost to a concurrent writer;
    /// semantic conflicts and all other failures surface as errors.
    pub fn try_propose(
        &mut self,
        name: &str,
        expected_head: CommitId,
        changes: &Changeset,
        meta: &CommitMeta,
    ) -> Result<Attempt, CommitError<Storage>> {
        let entry = self
            .storage
            .read(name)
            .map_err(CommitError::RefRead)?
            .ok_or_else(|| CommitError::RefNotFound(name.to_string()))?;
        let current = entry.head;

        self.ensure_content_present(changes)?;

        let parent_sequence = {
            let graph = CommitGraph::new(&self.storage);
            if current != expected_head {
                self.validate_rebase(&graph, expected_head, current, changes)?;
                debug!(reference = name, head = %current, "rebasing proposal onto advanced head");
            }
            graph
                .get(current)
                .map_err(CommitError::from_graph)?
                .sequence
        };

        let commit = commit::build(
            &self.signing_key,
            vec![current],
            changes.changes().clone(),
            meta.clone(),
            parent_sequence + 1,
        );
        let id = self.store_commit(&commit).map_err(CommitError::ContentPut)?;

        match self
            .storage
            .cas(name, entry.token, id)
            .map_err(CommitError::RefUpdate)?
        {
            CasOutcome::Committed(_) => {
                debug!(reference = name, commit = %id, sequence = parent_sequence + 1, "reference advanced");
                Ok(Attempt::Committed(id))
            }
            CasOutcome::Stale(Some(winner)) => Ok(Attempt::Raced {
                current: winner.head,
            }),
            CasOutcome::Stale(None) => Err(CommitError::RefNotFound(name.to_string())),
        }
    }

    /// Checks that a changeset built against `expected` is still compatible
    /// with `current`: no key of the changeset may have been changed by any
    /// commit in `(merge base, current]`.
    fn validate_rebase(
        &self,
        graph: &CommitGraph<'_, Storage>,
        expected: CommitId,
        current: CommitId,
        changes: &Changeset,
    ) -> Result<(), CommitError<Storage>> {
        let base = graph
            .common_ancestor(expected, current)
            .map_err(CommitError::from_graph)?
            .ok_or(CommitError::UnrelatedHistories { expected, current })?;

        let touched = graph
            .changes_since(Some(base), current)
            .map_err(CommitError::from_graph)?;

        let mut conflicts = Vec::new();
        for (key, proposed) in changes.changes() {
            if let Some(committed) = touched.get(key) {
                let base_change = graph
                    .value_at(base, key)
                    .map_err(CommitError::from_graph)?;
                conflicts.push(KeyConflict {
                    key: key.clone(),
                    base: base_change,
                    ours: Some(committed.clone()),
                    theirs: Some(proposed.clone()),
                });
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(CommitError::Conflict(MergeConflict { conflicts }))
        }
    }

    /// Integrity gate: every content id a changeset puts must already be
    /// stored before the commit referencing it can exist.
    pub(crate) fn ensure_content_present(
        &self,
        changes: &Changeset,
    ) -> Result<(), CommitError<Storage>> {
        for change in changes.changes().values() {
            if let Change::Put(id) = change {
                let present = self.storage.contains(*id).map_err(CommitError::ContentGet)?;
                if !present {
                    return Err(CommitError::Integrity(IntegrityError::MissingContent(*id)));
                }
            }
        }
        Ok(())
    }
}
