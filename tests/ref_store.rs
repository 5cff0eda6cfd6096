use strata::prelude::*;

fn commit_id(tag: &[u8]) -> CommitId {
    CommitId::digest(tag)
}

#[test]
fn create_update_and_conflict() {
    let mut store = MemoryRepo::default();
    let h1 = commit_id(b"c1");
    let h2 = commit_id(b"c2");

    let token = match store.create("main", h1).unwrap() {
        CreateOutcome::Created(token) => token,
        other => panic!("unexpected result: {other:?}"),
    };

    match store.create("main", h2).unwrap() {
        CreateOutcome::AlreadyExists(entry) => {
            assert_eq!(entry.head, h1);
            assert_eq!(entry.token, token);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // A stale token must fail deterministically and report the winner.
    let stale = RefToken(token.0 + 100);
    match store.cas("main", stale, h2).unwrap() {
        CasOutcome::Stale(Some(entry)) => assert_eq!(entry.head, h1),
        other => panic!("unexpected result: {other:?}"),
    }

    let token2 = match store.cas("main", token, h2).unwrap() {
        CasOutcome::Committed(token2) => token2,
        other => panic!("unexpected result: {other:?}"),
    };
    assert_ne!(token, token2);

    let entry = store.read("main").unwrap().unwrap();
    assert_eq!(entry.head, h2);
    assert_eq!(entry.token, token2);
}

#[test]
fn delete_requires_fresh_token() {
    let mut store = MemoryRepo::default();
    let h1 = commit_id(b"c1");
    let h2 = commit_id(b"c2");

    let token = match store.create("main", h1).unwrap() {
        CreateOutcome::Created(token) => token,
        other => panic!("unexpected result: {other:?}"),
    };
    // Advance the reference so the original token goes stale.
    match store.cas("main", token, h2).unwrap() {
        CasOutcome::Committed(_) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    match store.delete("main", token).unwrap() {
        CasOutcome::Stale(Some(entry)) => assert_eq!(entry.head, h2),
        other => panic!("unexpected result: {other:?}"),
    }

    // Retry with a freshly read token succeeds.
    let fresh = store.read("main").unwrap().unwrap().token;
    match store.delete("main", fresh).unwrap() {
        CasOutcome::Committed(_) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(store.read("main").unwrap().is_none());
}

#[test]
fn cas_on_missing_reference_reports_absence() {
    let mut store = MemoryRepo::default();
    match store.cas("ghost", RefToken(1), commit_id(b"c")).unwrap() {
        CasOutcome::Stale(None) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn lists_reference_names_in_order() {
    let mut store = MemoryRepo::default();
    let head = commit_id(b"c");
    store.create("release/v1", head).unwrap();
    store.create("main", head).unwrap();

    let names: Vec<String> = store.refs().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(names, vec!["main".to_string(), "release/v1".to_string()]);
}
