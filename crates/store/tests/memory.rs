#![forbid(unsafe_code)]

use std::sync::Arc;

use kstore_core::ObjectKey;
use kstore_store::{Backend, MemoryStore, StoreError};

#[tokio::test]
async fn write_is_idempotent_upsert() {
    let s = MemoryStore::new();
    let k = ObjectKey::cluster("a");
    s.write(&k, b"v1").await.unwrap();
    s.write(&k, b"v1").await.unwrap();
    assert_eq!(s.len().await, 1);
    s.write(&k, b"v2").await.unwrap();
    assert_eq!(s.read(&k).await.unwrap(), b"v2");
    assert_eq!(s.len().await, 1);
}

#[tokio::test]
async fn list_with_keys_recovers_identity() {
    let s = MemoryStore::new();
    s.write(&ObjectKey::namespaced("ns1", "a"), b"1").await.unwrap();
    s.write(&ObjectKey::namespaced("ns2", "a"), b"2").await.unwrap();
    s.write(&ObjectKey::cluster("c"), b"3").await.unwrap();

    let mut keyed = s.list_with_keys().await.unwrap();
    keyed.sort();
    assert_eq!(
        keyed,
        vec![
            (ObjectKey::cluster("c"), b"3".to_vec()),
            (ObjectKey::namespaced("ns1", "a"), b"1".to_vec()),
            (ObjectKey::namespaced("ns2", "a"), b"2".to_vec()),
        ]
    );
    let mut plain = s.list().await.unwrap();
    plain.sort();
    assert_eq!(plain, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
}

#[tokio::test]
async fn delete_then_recreate() {
    let s = MemoryStore::new();
    let k = ObjectKey::namespaced("ns", "x");
    s.insert(&k, b"1").await.unwrap();
    s.delete(&k).await.unwrap();
    assert!(s.is_empty().await);
    assert!(matches!(s.delete(&k).await, Err(StoreError::NotFound(_))));
    s.insert(&k, b"2").await.unwrap();
    assert!(s.exists(&k).await.unwrap());
}

#[tokio::test]
async fn replace_after_delete_does_not_resurrect() {
    let s = MemoryStore::new();
    let k = ObjectKey::namespaced("ns", "x");
    s.insert(&k, b"1").await.unwrap();
    s.delete(&k).await.unwrap();
    assert!(matches!(s.replace(&k, b"2").await, Err(StoreError::NotFound(_))));
    assert!(!s.exists(&k).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_admit_exactly_one() {
    let s = Arc::new(MemoryStore::new());
    let k = ObjectKey::namespaced("ns", "race");
    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let s = Arc::clone(&s);
        let k = k.clone();
        tasks.push(tokio::spawn(async move { s.insert(&k, &[i]).await }));
    }
    let mut ok = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(()) => ok += 1,
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(s.len().await, 1);
}
