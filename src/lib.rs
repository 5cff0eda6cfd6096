//! Strata is a versioned metadata store: git-like branches, tags, commits
//! and merges over structured datasets rather than file blobs.
//!
//! History is an immutable, content-addressed DAG of commits held in an
//! append-only [content store](repo::ContentStore). The only mutable state
//! is the [reference store](repo::RefStore), a mapping from names to head
//! commit ids advanced exclusively through compare-and-swap. Everything
//! else — graph traversal, merge-base computation, conflict classification —
//! is a pure function over immutable data, which is what makes lock-free
//! multi-writer correctness tractable.
//!
//! Start with [`repo::Repository`] for the high-level API, or implement
//! the two storage traits to plug in a backend.

pub mod id;
pub mod prelude;
pub mod repo;
