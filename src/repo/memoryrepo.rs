//! Simple in-memory implementation of [`ContentStore`] and [`RefStore`].
//!
//! Useful for unit tests or ephemeral repositories where persistence is not
//! required. Tokens come from a store-wide revision counter bumped on every
//! successful reference write, so a stale token always fails the CAS.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;

use bytes::Bytes;

use crate::id::{CommitId, ContentId};
use crate::repo::{CasOutcome, ContentStore, CreateOutcome, RefEntry, RefStore, RefToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RefSlot {
    head: CommitId,
    token: RefToken,
}

/// In-memory backend holding blobs and references in plain maps.
#[derive(Debug, Default)]
pub struct MemoryRepo {
    blobs: BTreeMap<ContentId, Bytes>,
    refs: HashMap<String, RefSlot>,
    revision: u64,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs, commits included.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    fn next_token(&mut self) -> RefToken {
        self.revision += 1;
        RefToken(self.revision)
    }
}

impl ContentStore for MemoryRepo {
    type PutError = Infallible;
    type GetError = Infallible;

    fn put(&mut self, bytes: Bytes) -> Result<ContentId, Self::PutError> {
        let id = ContentId::digest(&bytes);
        // Write-once: identical bytes hash to the same id, so re-insertion
        // is a no-op.
        self.blobs.entry(id).or_insert(bytes);
        Ok(id)
    }

    fn get(&self, id: ContentId) -> Result<Option<Bytes>, Self::GetError> {
        Ok(self.blobs.get(&id).cloned())
    }

    fn contains(&self, id: ContentId) -> Result<bool, Self::GetError> {
        Ok(self.blobs.contains_key(&id))
    }
}

impl RefStore for MemoryRepo {
    type RefsError = Infallible;
    type ReadError = Infallible;
    type UpdateError = Infallible;

    type NamesIter<'a> = std::vec::IntoIter<Result<String, Self::RefsError>>;

    fn refs<'a>(&'a mut self) -> Result<Self::NamesIter<'a>, Self::RefsError> {
        let mut names: Vec<String> = self.refs.keys().cloned().collect();
        names.sort();
        Ok(names.into_iter().map(Ok).collect::<Vec<_>>().into_iter())
    }

    fn read(&mut self, name: &str) -> Result<Option<RefEntry>, Self::ReadError> {
        Ok(self.refs.get(name).map(|slot| RefEntry {
            head: slot.head,
            token: slot.token,
        }))
    }

    fn create(&mut self, name: &str, head: CommitId) -> Result<CreateOutcome, Self::UpdateError> {
        if let Some(slot) = self.refs.get(name) {
            return Ok(CreateOutcome::AlreadyExists(RefEntry {
                head: slot.head,
                token: slot.token,
            }));
        }
        let token = self.next_token();
        self.refs.insert(name.to_string(), RefSlot { head, token });
        Ok(CreateOutcome::Created(token))
    }

    fn cas(
        &mut self,
        name: &str,
        expected: RefToken,
        new_head: CommitId,
    ) -> Result<CasOutcome, Self::UpdateError> {
        let current = match self.refs.get(name) {
            Some(slot) => *slot,
            None => return Ok(CasOutcome::Stale(None)),
        };
        if current.token != expected {
            return Ok(CasOutcome::Stale(Some(RefEntry {
                head: current.head,
                token: current.token,
            })));
        }
        let token = self.next_token();
        self.refs.insert(
            name.to_string(),
            RefSlot {
                head: new_head,
                token,
            },
        );
        Ok(CasOutcome::Committed(token))
    }

    fn delete(&mut self, name: &str, expected: RefToken) -> Result<CasOutcome, Self::UpdateError> {
        let current = match self.refs.get(name) {
            Some(slot) => *slot,
            None => return Ok(CasOutcome::Stale(None)),
        };
        if current.token != expected {
            return Ok(CasOutcome::Stale(Some(RefEntry {
                head: current.head,
                token: current.token,
            })));
        }
        self.refs.remove(name);
        let token = self.next_token();
        Ok(CasOutcome::Committed(token))
    }
}
