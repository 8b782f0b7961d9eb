use ndclink::core::cache::{CacheKey, SessionCache};
use ndclink::core::config::CacheConfig;
use ndclink::core::types::{Account, CachedAccount, UserProfile};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use std::time::Duration;
use tempfile::TempDir;

fn cached(email: &str) -> CachedAccount {
    CachedAccount::new(
        Account {
            session_id: format!("sid-{}", email),
            device_id: "device-1".to_string(),
            user: UserProfile {
                uid: format!("uid-{}", email),
                nickname: None,
                extra: Map::new(),
            },
        },
        email,
        "hunter2",
    )
}

fn config(dir: &TempDir) -> CacheConfig {
    CacheConfig::new(dir.path().join("cache.json")).with_debounce(Duration::from_millis(50))
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let key = CacheKey::from_credentials("a@example.com", "hunter2");

    let cache = SessionCache::open(config(&dir)).await.unwrap();
    cache.set(&key, cached("a@example.com"));
    cache.shutdown().await.unwrap();

    let reopened = SessionCache::open(config(&dir)).await.unwrap();
    let entry = reopened.get(&key).unwrap();
    assert_eq!(entry.account.session_id, "sid-a@example.com");
    assert_eq!(entry.password.expose_secret(), "hunter2");
}

#[tokio::test]
async fn test_writes_are_coalesced() {
    let dir = TempDir::new().unwrap();
    let cache = SessionCache::open(config(&dir)).await.unwrap();

    for i in 0..10 {
        let email = format!("user{}@example.com", i);
        cache.set(&CacheKey::from_credentials(&email, "pw"), cached(&email));
    }
    assert_eq!(cache.flush_count(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.flush_count(), 1);

    let raw = std::fs::read_to_string(dir.path().join("cache.json")).unwrap();
    let file: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(file.as_object().unwrap().len(), 10);
}

#[tokio::test]
async fn test_delete_is_persisted() {
    let dir = TempDir::new().unwrap();
    let key = CacheKey::from_credentials("b@example.com", "pw");

    let cache = SessionCache::open(config(&dir)).await.unwrap();
    cache.set(&key, cached("b@example.com"));
    assert!(cache.delete(&key));
    assert!(!cache.delete(&key));
    cache.shutdown().await.unwrap();

    let reopened = SessionCache::open(config(&dir)).await.unwrap();
    assert!(reopened.is_empty());
}

#[tokio::test]
async fn test_corrupt_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("cache.json"), "{not json").unwrap();

    let cache = SessionCache::open(config(&dir)).await.unwrap();
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_capacity_survives_reload() {
    let dir = TempDir::new().unwrap();
    let small = config(&dir).with_max_size(2);

    let cache = SessionCache::open(small.clone()).await.unwrap();
    for email in ["a", "b", "c"] {
        cache.set(&CacheKey::from_credentials(email, "pw"), cached(email));
    }
    assert_eq!(cache.len(), 2);
    cache.shutdown().await.unwrap();

    let reopened = SessionCache::open(small).await.unwrap();
    assert!(reopened.get(&CacheKey::from_credentials("a", "pw")).is_none());
    assert!(reopened.get(&CacheKey::from_credentials("c", "pw")).is_some());
}
