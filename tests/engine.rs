use std::convert::Infallible;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use strata::prelude::*;

fn meta(msg: &str) -> CommitMeta {
    CommitMeta::new("tester", msg)
}

fn repo_with_main() -> (Repository<MemoryRepo>, CommitId) {
    let key = SigningKey::generate(&mut OsRng);
    let mut repo = Repository::new(MemoryRepo::default(), key);
    let root = repo.initial_commit(Changeset::new(), meta("init")).unwrap();
    repo.create_ref("main", root).unwrap();
    (repo, root)
}

#[test]
fn disjoint_concurrent_writers_both_land() {
    let (mut repo, root) = repo_with_main();

    // Writer A advances main while writer B still believes the head is the
    // root commit.
    let v1 = repo.put_content(Bytes::from_static(b"v1")).unwrap();
    let c1 = repo
        .propose("main", root, Changeset::new().put("key1", v1), meta("a"))
        .unwrap();

    let v2 = repo.put_content(Bytes::from_static(b"v2")).unwrap();
    let c2 = repo
        .propose("main", root, Changeset::new().put("key2", v2), meta("b"))
        .unwrap();

    // B's commit was rebased onto A's, not onto its stale expected head.
    let head = repo.read_ref("main").unwrap().head;
    assert_eq!(head, c2);
    let commit = repo.graph().get(c2).unwrap();
    assert_eq!(commit.parents, vec![c1]);
    assert_eq!(commit.sequence, 2);

    // The final head sees the union of both changesets.
    let graph = repo.graph();
    assert_eq!(graph.value_at(head, "key1").unwrap(), Some(Change::Put(v1)));
    assert_eq!(graph.value_at(head, "key2").unwrap(), Some(Change::Put(v2)));
}

#[test]
fn overlapping_writers_conflict_with_details() {
    let (mut repo, root) = repo_with_main();

    let v1 = repo.put_content(Bytes::from_static(b"v1")).unwrap();
    let c1 = repo
        .propose("main", root, Changeset::new().put("key1", v1), meta("a"))
        .unwrap();

    // Writer B edits the same key to different content, still expecting the
    // root head.
    let v2 = repo.put_content(Bytes::from_static(b"v2")).unwrap();
    let err = repo
        .propose("main", root, Changeset::new().put("key1", v2), meta("b"))
        .unwrap_err();

    match err {
        CommitError::Conflict(conflict) => {
            assert_eq!(conflict.conflicts.len(), 1);
            let kc = &conflict.conflicts[0];
            assert_eq!(kc.key, "key1");
            assert_eq!(kc.base, None);
            assert_eq!(kc.ours, Some(Change::Put(v1)));
            assert_eq!(kc.theirs, Some(Change::Put(v2)));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The reference is untouched by the failed proposal.
    assert_eq!(repo.read_ref("main").unwrap().head, c1);
}

#[test]
fn delete_against_concurrent_put_conflicts() {
    let (mut repo, root) = repo_with_main();

    let v1 = repo.put_content(Bytes::from_static(b"v1")).unwrap();
    repo.propose("main", root, Changeset::new().put("key1", v1), meta("a"))
        .unwrap();

    let err = repo
        .propose("main", root, Changeset::new().delete("key1"), meta("b"))
        .unwrap_err();
    match err {
        CommitError::Conflict(conflict) => {
            let keys: Vec<&str> = conflict.keys().collect();
            assert_eq!(keys, vec!["key1"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn proposing_unstored_content_is_an_integrity_error() {
    let (mut repo, root) = repo_with_main();
    let ghost = ContentId::digest(b"never stored");

    let err = repo
        .propose("main", root, Changeset::new().put("k", ghost), meta("x"))
        .unwrap_err();
    match err {
        CommitError::Integrity(IntegrityError::MissingContent(id)) => assert_eq!(id, ghost),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn proposing_on_missing_reference_fails() {
    let (mut repo, root) = repo_with_main();
    let err = repo
        .propose("ghost", root, Changeset::new(), meta("x"))
        .unwrap_err();
    match err {
        CommitError::RefNotFound(name) => assert_eq!(name, "ghost"),
        other => panic!("unexpected error: {other:?}"),
    }
}

/// Backend whose CAS always loses on one reference, emulating a third
/// writer winning between validation and write on every attempt. Other
/// references behave normally so contended scenarios can be set up.
#[derive(Debug)]
struct ContendedRepo {
    inner: MemoryRepo,
    contended: &'static str,
}

impl ContendedRepo {
    fn new(contended: &'static str) -> Self {
        Self {
            inner: MemoryRepo::default(),
            contended,
        }
    }
}

impl ContentStore for ContendedRepo {
    type PutError = Infallible;
    type GetError = Infallible;

    fn put(&mut self, bytes: Bytes) -> Result<ContentId, Self::PutError> {
        self.inner.put(bytes)
    }

    fn get(&self, id: ContentId) -> Result<Option<Bytes>, Self::GetError> {
        self.inner.get(id)
    }
}

impl RefStore for ContendedRepo {
    type RefsError = Infallible;
    type ReadError = Infallible;
    type UpdateError = Infallible;

    type NamesIter<'a> = <MemoryRepo as RefStore>::NamesIter<'a>;

    fn refs<'a>(&'a mut self) -> Result<Self::NamesIter<'a>, Self::RefsError> {
        self.inner.refs()
    }

    fn read(&mut self, name: &str) -> Result<Option<RefEntry>, Self::ReadError> {
        self.inner.read(name)
    }

    fn create(&mut self, name: &str, head: CommitId) -> Result<CreateOutcome, Self::UpdateError> {
        self.inner.create(name, head)
    }

    fn cas(
        &mut self,
        name: &str,
        expected: RefToken,
        new_head: CommitId,
    ) -> Result<CasOutcome, Self::UpdateError> {
        if name == self.contended {
            return Ok(CasOutcome::Stale(self.inner.read(name)?));
        }
        self.inner.cas(name, expected, new_head)
    }

    fn delete(&mut self, name: &str, expected: RefToken) -> Result<CasOutcome, Self::UpdateError> {
        self.inner.delete(name, expected)
    }
}

#[test]
fn unbounded_contention_surfaces_retry_exhausted() {
    let key = SigningKey::generate(&mut OsRng);
    let mut repo = Repository::new(ContendedRepo::new("main"), key).with_max_attempts(3);

    let root = repo.initial_commit(Changeset::new(), meta("init")).unwrap();
    repo.create_ref("main", root).unwrap();

    let v = repo.put_content(Bytes::from_static(b"v")).unwrap();
    let err = repo
        .propose("main", root, Changeset::new().put("k", v), meta("w"))
        .unwrap_err();
    match err {
        CommitError::RetryExhausted { name, attempts } => {
            assert_eq!(name, "main");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The reference still points at a fully validated commit.
    assert_eq!(repo.read_ref("main").unwrap().head, root);

    // Failed attempts leave only inert orphans: the root commit, the content
    // payload and one orphaned proposal commit. Retries against the same head
    // rebuild the identical commit, so the orphans collapse into one blob.
    assert_eq!(repo.into_storage().inner.blob_count(), 3);
}

#[test]
fn merge_under_contention_surfaces_retry_exhausted() {
    let key = SigningKey::generate(&mut OsRng);
    let mut repo = Repository::new(ContendedRepo::new("main"), key).with_max_attempts(3);

    let root = repo.initial_commit(Changeset::new(), meta("init")).unwrap();
    repo.create_ref("main", root).unwrap();
    repo.create_ref("topic", root).unwrap();

    // The topic side diverges normally; only main is contended.
    let v = repo.put_content(Bytes::from_static(b"v")).unwrap();
    let topic_head = repo
        .propose("topic", root, Changeset::new().put("k", v), meta("topic work"))
        .unwrap();

    let err = repo
        .merge("main", topic_head, meta("merge topic"))
        .unwrap_err();
    match err {
        CommitError::RetryExhausted { name, attempts } => {
            assert_eq!(name, "main");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The contended reference still points at the head it had before the
    // merge was attempted.
    assert_eq!(repo.read_ref("main").unwrap().head, root);
}

#[test]
fn proposals_with_unrelated_expected_head_are_rejected() {
    let (mut repo, _root) = repo_with_main();

    // A root commit from a disconnected history.
    let stray = repo
        .initial_commit(
            Changeset::new().delete("unrelated"),
            meta("stray root"),
        )
        .unwrap();

    let err = repo
        .propose("main", stray, Changeset::new(), meta("x"))
        .unwrap_err();
    match err {
        CommitError::UnrelatedHistories { expected, .. } => assert_eq!(expected, stray),
        other => panic!("unexpected error: {other:?}"),
    }
}
