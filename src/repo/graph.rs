//! Traversal over the immutable commit graph.
//!
//! The graph is acyclic by construction: a commit can only name parents that
//! already exist, and existing commits are never mutated. No cycle detection
//! is performed at runtime; a missing or malformed node is reported as an
//! error rather than skipped, since it indicates either a caller bug or a
//! corrupted backend.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;

use crate::id::CommitId;
use crate::repo::commit::{Change, Commit};
use crate::repo::ContentStore;

/// Error raised by graph traversal.
#[derive(Debug)]
pub enum GraphError<E: Error> {
    /// The backend failed while reading a commit blob.
    Storage(E),
    /// A referenced commit id is absent from the content store.
    Missing(CommitId),
    /// A stored commit blob could not be decoded.
    Malformed { id: CommitId, detail: String },
}

impl<E: Error> fmt::Display for GraphError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Storage(e) => write!(f, "storage error: {e}"),
            GraphError::Missing(id) => write!(f, "commit {id} not found"),
            GraphError::Malformed { id, detail } => {
                write!(f, "commit {id} is malformed: {detail}")
            }
        }
    }
}

impl<E: Error + 'static> Error for GraphError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GraphError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

fn load_commit<S: ContentStore>(
    store: &S,
    id: CommitId,
) -> Result<Commit, GraphError<S::GetError>> {
    let bytes = store.get(id.into()).map_err(GraphError::Storage)?;
    let Some(bytes) = bytes else {
        return Err(GraphError::Missing(id));
    };
    Commit::from_bytes(&bytes).map_err(|e| GraphError::Malformed {
        id,
        detail: e.to_string(),
    })
}

/// Read-only view of the commit DAG stored in a [`ContentStore`].
///
/// Purely computational: all methods are in-memory walks over immutable
/// data, with storage reads as the only fallible operation.
pub struct CommitGraph<'a, S: ContentStore> {
    store: &'a S,
}

impl<'a, S: ContentStore> CommitGraph<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Loads and decodes the commit identified by `id`.
    pub fn get(&self, id: CommitId) -> Result<Commit, GraphError<S::GetError>> {
        load_commit(self.store, id)
    }

    /// The ordered parent ids of `id`.
    pub fn parents(&self, id: CommitId) -> Result<Vec<CommitId>, GraphError<S::GetError>> {
        Ok(self.get(id)?.parents)
    }

    /// True if `a` is reachable by walking parent edges from `b`.
    ///
    /// `is_ancestor(x, x)` is true. The walk prunes on sequence numbers:
    /// parents always carry a strictly smaller sequence than their children,
    /// so anything at or below `a`'s sequence cannot lead to `a`.
    pub fn is_ancestor(&self, a: CommitId, b: CommitId) -> Result<bool, GraphError<S::GetError>> {
        if a == b {
            return Ok(true);
        }
        let floor = self.get(a)?.sequence;

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([b]);
        while let Some(id) = queue.pop_front() {
            if id == a {
                return Ok(true);
            }
            if !visited.insert(id) {
                continue;
            }
            let commit = self.get(id)?;
            if commit.sequence <= floor {
                continue;
            }
            queue.extend(commit.parents);
        }
        Ok(false)
    }

    /// The set of all commits reachable from `from`, including `from` itself.
    pub fn reachable(&self, from: CommitId) -> Result<HashSet<CommitId>, GraphError<S::GetError>> {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            for parent in self.get(id)?.parents {
                stack.push(parent);
            }
        }
        Ok(visited)
    }

    /// The nearest common ancestor of `a` and `b`, or `None` for unrelated
    /// histories.
    ///
    /// A dual-direction breadth-first walk expands one generation on each
    /// side per round and compares the visited sets. The first non-empty
    /// intersection holds the candidates; ties between equally-near
    /// candidates are broken by the highest sequence number, i.e. the most
    /// recent one. Expanding both sides in lockstep keeps the result
    /// symmetric in its arguments.
    pub fn common_ancestor(
        &self,
        a: CommitId,
        b: CommitId,
    ) -> Result<Option<CommitId>, GraphError<S::GetError>> {
        let mut seen_a = HashSet::from([a]);
        let mut seen_b = HashSet::from([b]);
        let mut frontier_a = vec![a];
        let mut frontier_b = vec![b];

        loop {
            let meet: Vec<CommitId> = seen_a.intersection(&seen_b).copied().collect();
            if !meet.is_empty() {
                let mut best: Option<(u64, CommitId)> = None;
                for id in meet {
                    let sequence = self.get(id)?.sequence;
                    if best.map_or(true, |(s, _)| sequence > s) {
                        best = Some((sequence, id));
                    }
                }
                return Ok(best.map(|(_, id)| id));
            }
            if frontier_a.is_empty() && frontier_b.is_empty() {
                return Ok(None);
            }
            frontier_a = self.expand(frontier_a, &mut seen_a)?;
            frontier_b = self.expand(frontier_b, &mut seen_b)?;
        }
    }

    fn expand(
        &self,
        frontier: Vec<CommitId>,
        seen: &mut HashSet<CommitId>,
    ) -> Result<Vec<CommitId>, GraphError<S::GetError>> {
        let mut next = Vec::new();
        for id in frontier {
            for parent in self.get(id)?.parents {
                if seen.insert(parent) {
                    next.push(parent);
                }
            }
        }
        Ok(next)
    }

    /// Lazy walk of the commits reachable from `to` but not from `from`,
    /// yielded newest-first (descending sequence).
    ///
    /// With `from = None` the walk covers the full history of `to`. The
    /// iterator is finite and is not restartable; re-invoke to walk again.
    pub fn log_since(
        &self,
        from: Option<CommitId>,
        to: CommitId,
    ) -> Result<LogIter<'a, S>, GraphError<S::GetError>> {
        let stop = match from {
            Some(f) => self.reachable(f)?,
            None => HashSet::new(),
        };

        let mut heap = BinaryHeap::new();
        let mut pending = HashMap::new();
        if !stop.contains(&to) {
            let commit = self.get(to)?;
            heap.push((commit.sequence, to));
            pending.insert(to, commit);
        }

        Ok(LogIter {
            store: self.store,
            heap,
            pending,
            visited: HashSet::new(),
            stop,
        })
    }

    /// The surviving change per key across the range `(from, to]`.
    ///
    /// Newest-first iteration means the first change seen for a key is the
    /// one that wins; earlier edits of the same key are shadowed.
    pub fn changes_since(
        &self,
        from: Option<CommitId>,
        to: CommitId,
    ) -> Result<std::collections::BTreeMap<String, Change>, GraphError<S::GetError>> {
        let mut acc = std::collections::BTreeMap::new();
        for item in self.log_since(from, to)? {
            let (_, commit) = item?;
            for (key, change) in &commit.changes {
                acc.entry(key.clone()).or_insert_with(|| change.clone());
            }
        }
        Ok(acc)
    }

    /// The effective change recorded for `key` as of `commit`, walking the
    /// full history. `None` means the key was never touched.
    pub fn value_at(
        &self,
        commit: CommitId,
        key: &str,
    ) -> Result<Option<Change>, GraphError<S::GetError>> {
        for item in self.log_since(None, commit)? {
            let (_, c) = item?;
            if let Some(change) = c.changes.get(key) {
                return Ok(Some(change.clone()));
            }
        }
        Ok(None)
    }
}

/// Iterator produced by [`CommitGraph::log_since`].
pub struct LogIter<'a, S: ContentStore> {
    store: &'a S,
    heap: BinaryHeap<(u64, CommitId)>,
    pending: HashMap<CommitId, Commit>,
    visited: HashSet<CommitId>,
    stop: HashSet<CommitId>,
}

impl<'a, S: ContentStore> Iterator for LogIter<'a, S> {
    type Item = Result<(CommitId, Commit), GraphError<S::GetError>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, id) = self.heap.pop()?;
            if !self.visited.insert(id) {
                continue;
            }
            let commit = match self.pending.remove(&id) {
                Some(c) => c,
                None => match load_commit(self.store, id) {
                    Ok(c) => c,
                    Err(e) => return Some(Err(e)),
                },
            };
            for parent in &commit.parents {
                if self.stop.contains(parent) || self.visited.contains(parent) {
                    continue;
                }
                match load_commit(self.store, *parent) {
                    Ok(pc) => {
                        self.heap.push((pc.sequence, *parent));
                        self.pending.insert(*parent, pc);
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            return Some(Ok((id, commit)));
        }
    }
}
