//! Engine-level operation semantics under concurrency.
//!
//! Exercises the testable properties that live below the HTTP layer:
//! - N parallel no-overwrite PUTs on one path: one winner, N-1 conflicts
//! - M parallel POSTs on one collection: M documents with distinct names
//! - concurrent `ObjectAdd` patches with disjoint pointers: set-union result
//! - metadata lifecycle across overwrite and patch

use std::sync::Arc;
use std::thread;

use roostdb::error::Error;
use roostdb::json::JsonValue;
use roostdb::schema::SchemaValidator;
use roostdb::store::{Body, Outcome, Request, Store, Verb};

fn permissive_store() -> Arc<Store> {
    let validator = SchemaValidator::from_value(&serde_json::json!({})).unwrap();
    Arc::new(Store::new(Arc::new(validator)))
}

fn segments(path: &[&str]) -> Vec<String> {
    path.iter().map(|s| s.to_string()).collect()
}

fn run(store: &Store, verb: Verb, path: &[String], body: &[u8]) -> roostdb::Result<roostdb::store::Response> {
    store.handle(&Request {
        verb,
        path,
        body,
        username: "tester",
        interval: None,
        no_overwrite: false,
    })
}

fn get_doc(store: &Store, path: &[String]) -> JsonValue {
    match run(store, Verb::Get, path, b"").unwrap().body {
        Body::Document(content) => content.doc,
        other => panic!("expected a document body, got {other:?}"),
    }
}

#[test]
fn parallel_no_overwrite_puts_have_one_winner() {
    let store = permissive_store();
    run(&store, Verb::Put, &segments(&["db"]), b"").unwrap();

    let workers = 12;
    let mut handles = Vec::new();
    for t in 0..workers {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let path = segments(&["db", "doc"]);
            let body = format!(r#"{{"writer": {t}}}"#);
            store.handle(&Request {
                verb: Verb::Put,
                path: &path,
                body: body.as_bytes(),
                username: "tester",
                interval: None,
                no_overwrite: true,
            })
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(response) => {
                assert_eq!(response.outcome, Outcome::Created);
                created += 1;
            }
            Err(Error::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, workers - 1);

    // Exactly one body is observable afterwards.
    let doc = get_doc(&store, &segments(&["db", "doc"]));
    let text = doc.to_json_string().unwrap();
    assert!(text.starts_with(r#"{"writer":"#));
}

#[test]
fn parallel_posts_create_distinct_documents() {
    let store = permissive_store();
    run(&store, Verb::Put, &segments(&["db"]), b"").unwrap();

    let workers = 4;
    let posts_each = 10;
    let mut handles = Vec::new();
    for _ in 0..workers {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let path = segments(&["db"]);
            let mut uris = Vec::new();
            for _ in 0..posts_each {
                let response = run(&store, Verb::Post, &path, br#"{"posted": true}"#).unwrap();
                match response.body {
                    Body::Uri(put) => uris.push(put.uri),
                    other => panic!("expected a uri body, got {other:?}"),
                }
            }
            uris
        }));
    }

    let mut all_uris = Vec::new();
    for handle in handles {
        all_uris.extend(handle.join().unwrap());
    }
    let unique: std::collections::HashSet<_> = all_uris.iter().collect();
    assert_eq!(unique.len(), workers * posts_each);

    // A listing returns every posted document.
    let listing = match run(&store, Verb::Get, &segments(&["db"]), b"").unwrap().body {
        Body::Listing(listing) => listing,
        other => panic!("expected a listing body, got {other:?}"),
    };
    assert_eq!(listing.len(), workers * posts_each);
}

#[test]
fn concurrent_disjoint_object_adds_union() {
    let store = permissive_store();
    run(&store, Verb::Put, &segments(&["db"]), b"").unwrap();
    run(&store, Verb::Put, &segments(&["db", "doc"]), b"{}").unwrap();

    let keys = 10;
    let mut handles = Vec::new();
    for k in 0..keys {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let path = segments(&["db", "doc"]);
            let body = format!(r#"[{{"op": "ObjectAdd", "path": "/k{k}", "value": {k}}}]"#);
            run(&store, Verb::Patch, &path, body.as_bytes()).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let doc = get_doc(&store, &segments(&["db", "doc"]));
    let mut expected = std::collections::BTreeMap::new();
    for k in 0..keys {
        expected.insert(format!("k{k}"), JsonValue::from(k as f64));
    }
    assert_eq!(doc, JsonValue::from(expected));
}

#[test]
fn metadata_lifecycle_across_writes() {
    let store = permissive_store();
    run(&store, Verb::Put, &segments(&["db"]), b"").unwrap();
    let path = segments(&["db", "doc"]);

    run(&store, Verb::Put, &path, br#"{"v": 1}"#).unwrap();
    let created = match run(&store, Verb::Get, &path, b"").unwrap().body {
        Body::Document(content) => content.meta,
        _ => unreachable!(),
    };
    assert_eq!(created.created_at(), created.last_modified_at());

    thread::sleep(std::time::Duration::from_millis(5));
    run(&store, Verb::Patch, &path, br#"[{"op": "ObjectAdd", "path": "/w", "value": 2}]"#)
        .unwrap();
    let patched = match run(&store, Verb::Get, &path, b"").unwrap().body {
        Body::Document(content) => content.meta,
        _ => unreachable!(),
    };
    assert_eq!(patched.created_at(), created.created_at());
    assert!(patched.last_modified_at() > created.created_at());
}

#[test]
fn array_ops_sequence() {
    let store = permissive_store();
    run(&store, Verb::Put, &segments(&["db"]), b"").unwrap();
    let path = segments(&["db", "doc"]);
    run(&store, Verb::Put, &path, br#"{"a": [1, 2]}"#).unwrap();

    // Adding an existing value changes nothing.
    run(
        &store,
        Verb::Patch,
        &path,
        br#"[{"op": "ArrayAdd", "path": "/a", "value": 2}]"#,
    )
    .unwrap();
    assert_eq!(
        get_doc(&store, &path),
        JsonValue::from_slice(br#"{"a": [1, 2]}"#).unwrap()
    );

    // Removing deletes all equal elements.
    run(
        &store,
        Verb::Patch,
        &path,
        br#"[{"op": "ArrayRemove", "path": "/a", "value": 1}]"#,
    )
    .unwrap();
    assert_eq!(
        get_doc(&store, &path),
        JsonValue::from_slice(br#"{"a": [2]}"#).unwrap()
    );
}
