//! Tests for the durable backend.

use super::*;
use crate::query::{Pagination, QueryFilter, TimeRange};
use std::collections::HashSet;
use tempfile::TempDir;

async fn memory() -> DurableBackend {
    DurableBackend::open(&DurableConfig::in_memory()).await.unwrap()
}

async fn memory_with_sweep(interval: Duration) -> DurableBackend {
    DurableBackend::open_with_sweep_interval(&DurableConfig::in_memory(), interval)
        .await
        .unwrap()
}

fn keys(page: &QueryPage) -> Vec<&str> {
    page.items.iter().map(|item| item.key.as_str()).collect()
}

#[tokio::test]
async fn test_set_and_get() {
    let store = memory().await;
    store.set("key1", b"value1".to_vec()).await.unwrap();

    let entry = store.get("key1").await.unwrap();
    assert_eq!(entry.value, b"value1");
    assert!(entry.metadata.expires_at.is_none());
}

#[tokio::test]
async fn test_get_nonexistent_key() {
    let store = memory().await;
    let err = store.get("nonexistent").await.unwrap_err();
    assert!(matches!(err, Error::KeyNotFound { ref key } if key == "nonexistent"));
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let store = memory().await;
    store.set("k", b"v".to_vec()).await.unwrap();
    store.set("k", b"v".to_vec()).await.unwrap();

    assert_eq!(store.row_count().await.unwrap(), 1);
    assert_eq!(store.get("k").await.unwrap().value, b"v");
}

#[tokio::test]
async fn test_set_overwrites_and_clears_ttl() {
    let store = memory().await;
    store
        .set_with_ttl("k", b"v1".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    store.set("k", b"v2".to_vec()).await.unwrap();

    let entry = store.get("k").await.unwrap();
    assert_eq!(entry.value, b"v2");
    assert!(entry.metadata.expires_at.is_none());
}

#[tokio::test]
async fn test_ttl_visibility_before_sweep() {
    let store = memory().await;
    store
        .set_with_ttl("k", b"v".to_vec(), Duration::from_millis(100))
        .await
        .unwrap();
    assert!(store.get("k").await.is_ok());

    tokio::time::sleep(Duration::from_millis(200)).await;

    // The default sweep interval is a minute, so the row is still stored.
    assert_eq!(store.row_count().await.unwrap(), 1);
    assert!(store.get("k").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_expires_at_metadata() {
    let store = memory().await;
    store
        .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(30))
        .await
        .unwrap();

    let meta = store.get("k").await.unwrap().metadata;
    let ttl = meta.expires_at.unwrap() - meta.created_at;
    assert_eq!(ttl, chrono::Duration::seconds(30));
}

#[tokio::test]
async fn test_metadata_rendered_in_configured_timezone() {
    let config = DurableConfig {
        timezone: "+05:30".to_string(),
        ..DurableConfig::in_memory()
    };
    let store = DurableBackend::open(&config).await.unwrap();
    store.set("k", b"v".to_vec()).await.unwrap();

    let meta = store.get("k").await.unwrap().metadata;
    assert_eq!(meta.created_at.offset().local_minus_utc(), 5 * 3600 + 1800);
}

#[tokio::test]
async fn test_sweep_removes_expired_rows() {
    let store = memory_with_sweep(Duration::from_millis(100)).await;
    store
        .set_with_ttl("short", b"v".to_vec(), Duration::from_millis(50))
        .await
        .unwrap();
    store.set("forever", b"v".to_vec()).await.unwrap();
    assert_eq!(store.row_count().await.unwrap(), 2);

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(store.row_count().await.unwrap(), 1);
    assert!(store.get("forever").await.is_ok());
}

#[tokio::test]
async fn test_manual_purge() {
    let store = memory().await;
    store
        .set_with_ttl("a", b"v".to_vec(), Duration::from_millis(20))
        .await
        .unwrap();
    store
        .set_with_ttl("b", b"v".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert_eq!(store.purge_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete() {
    let store = memory().await;
    store.set("k", b"v".to_vec()).await.unwrap();
    store.delete("k").await.unwrap();

    assert!(store.get("k").await.unwrap_err().is_not_found());
    assert!(store.delete("k").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_expired_unswept_record() {
    let store = memory().await;
    store
        .set_with_ttl("k", b"v".to_vec(), Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    store.delete("k").await.unwrap();
    assert_eq!(store.row_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_update_requires_live_record() {
    let store = memory().await;
    assert!(store.update("k", b"v".to_vec()).await.unwrap_err().is_not_found());

    store
        .set_with_ttl("k", b"v1".to_vec(), Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(store.update("k", b"v2".to_vec()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_update_keeps_ttl_state() {
    let store = memory().await;
    store
        .set_with_ttl("k", b"v1".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let before = store.get("k").await.unwrap().metadata;

    store.update("k", b"v2".to_vec()).await.unwrap();
    let entry = store.get("k").await.unwrap();
    assert_eq!(entry.value, b"v2");
    assert_eq!(entry.metadata.expires_at, before.expires_at);
    assert!(entry.metadata.created_at >= before.created_at);
}

#[tokio::test]
async fn test_update_with_ttl_installs_expiry() {
    let store = memory().await;
    store.set("k", b"v1".to_vec()).await.unwrap();
    store
        .update_with_ttl("k", b"v2".to_vec(), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(store.get("k").await.unwrap().value, b"v2");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get("k").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_insert_only_when_absent() {
    let store = memory().await;
    store.insert("k", b"v1".to_vec()).await.unwrap();

    let err = store.insert("k", b"v2".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::KeyAlreadyExists { ref key } if key == "k"));
    assert_eq!(store.get("k").await.unwrap().value, b"v1");
}

#[tokio::test]
async fn test_insert_replaces_expired_record() {
    let store = memory().await;
    store
        .insert_with_ttl("k", b"v1".to_vec(), Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    store.insert("k", b"v2".to_vec()).await.unwrap();
    let entry = store.get("k").await.unwrap();
    assert_eq!(entry.value, b"v2");
    assert!(entry.metadata.expires_at.is_none());
}

#[tokio::test]
async fn test_invalid_input_rejected() {
    let store = memory().await;
    let err = store.set("", b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "key"));

    let err = store
        .set_with_ttl("k", b"v".to_vec(), Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "ttl"));
}

#[tokio::test]
async fn test_concurrent_writers_same_key() {
    let store = Arc::new(memory().await);
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.set("shared", format!("v{i}").into_bytes()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let written: HashSet<Vec<u8>> = (0..16).map(|i| format!("v{i}").into_bytes()).collect();
    assert_eq!(store.row_count().await.unwrap(), 1);
    assert!(written.contains(&store.get("shared").await.unwrap().value));
}

#[tokio::test]
async fn test_concurrent_inserts_one_winner() {
    let store = Arc::new(memory().await);
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.insert("once", vec![i]).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => winners += 1,
            Err(Error::KeyAlreadyExists { .. }) => {},
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_query_pattern() {
    let store = memory().await;
    for key in ["user/1", "user/42/profile", "admin/1"] {
        store.set(key, b"v".to_vec()).await.unwrap();
    }

    let page = store.query(&Query::new("user/*")).await.unwrap();
    assert_eq!(page.total, 2);
    let found: HashSet<&str> = keys(&page).into_iter().collect();
    assert_eq!(found, HashSet::from(["user/1", "user/42/profile"]));
}

#[tokio::test]
async fn test_query_orders_newest_first() {
    let store = memory().await;
    for key in ["item/a", "item/b", "item/c"] {
        store.set(key, b"v".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let page = store.query(&Query::new("item/*")).await.unwrap();
    assert_eq!(keys(&page), vec!["item/c", "item/b", "item/a"]);
}

#[tokio::test]
async fn test_query_pagination() {
    let store = memory().await;
    for i in 0..10 {
        store.set(&format!("page/{i:02}"), vec![i]).await.unwrap();
    }

    for (limit, offset) in [(3u64, 0u64), (3, 8), (5, 10), (20, 2)] {
        let query = Query::new("page/*").with_page(Pagination::new().limit(limit).offset(offset));
        let page = store.query(&query).await.unwrap();
        let expected = limit.min(10u64.saturating_sub(offset));
        assert_eq!(page.items.len() as u64, expected, "limit={limit} offset={offset}");
        assert_eq!(page.total, 10);
    }

    let all = store.query(&Query::new("page/*")).await.unwrap();
    assert_eq!(all.items.len(), 10);
}

#[tokio::test]
async fn test_query_pages_do_not_overlap() {
    let store = memory().await;
    for i in 0..7 {
        store.set(&format!("p/{i}"), vec![i]).await.unwrap();
    }

    let mut seen = HashSet::new();
    for offset in (0..7).step_by(3) {
        let query = Query::new("p/*").with_page(Pagination::new().limit(3).offset(offset));
        for item in store.query(&query).await.unwrap().items {
            assert!(seen.insert(item.key));
        }
    }
    assert_eq!(seen.len(), 7);
}

#[tokio::test]
async fn test_query_excludes_expired() {
    let store = memory().await;
    store
        .set_with_ttl("q/short", b"v".to_vec(), Duration::from_millis(20))
        .await
        .unwrap();
    store.set("q/long", b"v".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let page = store.query(&Query::new("q/*")).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(keys(&page), vec!["q/long"]);
}

#[tokio::test]
async fn test_query_filter() {
    let store = memory().await;
    store.set("f/plain", b"red".to_vec()).await.unwrap();
    store
        .set_with_ttl("f/ttl", b"red".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    store.set("f/blue", b"blue".to_vec()).await.unwrap();

    let query = Query::new("f/*").with_filter(QueryFilter::new().value("red").ttl_based(true));
    let page = store.query(&query).await.unwrap();
    assert_eq!(keys(&page), vec!["f/ttl"]);

    let query =
        Query::new("f/*").with_filter(QueryFilter::from_json(r#"{"value": "red"}"#).unwrap());
    assert_eq!(store.query(&query).await.unwrap().total, 2);
}

#[tokio::test]
async fn test_query_pattern_and_key_filter_are_anded() {
    let store = memory().await;
    store.set("user/1", b"v".to_vec()).await.unwrap();
    store.set("admin/1", b"v".to_vec()).await.unwrap();

    let query = Query::new("user/*").with_filter(QueryFilter::new().key("admin/1"));
    let page = store.query(&query).await.unwrap();
    assert_eq!(page.total, 0);
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_query_time_range() {
    let store = memory().await;
    store.set("t/old", b"v".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cutoff = chrono::Utc::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.set("t/new", b"v".to_vec()).await.unwrap();

    let query = Query::new("t/*").with_range(TimeRange::new(Some(cutoff), None).unwrap());
    assert_eq!(keys(&store.query(&query).await.unwrap()), vec!["t/new"]);

    let query = Query::new("t/*").with_range(TimeRange::new(None, Some(cutoff)).unwrap());
    assert_eq!(keys(&store.query(&query).await.unwrap()), vec!["t/old"]);
}

#[tokio::test]
async fn test_query_rejects_empty_pattern() {
    let store = memory().await;
    let err = store.query(&Query::new("")).await.unwrap_err();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "pattern"));
}

#[tokio::test]
async fn test_session_scenario() {
    let store = memory().await;
    store
        .set_with_ttl("session/abc", b"token".to_vec(), Duration::from_secs(2))
        .await
        .unwrap();

    let entry = store.get("session/abc").await.unwrap();
    assert_eq!(entry.value, b"token");
    assert!(entry.metadata.expires_at.is_some());

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(store.get("session/abc").await.unwrap_err().is_not_found());
    let page = store.query(&Query::new("session/*")).await.unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let store = memory().await;
    store.set("k", b"v".to_vec()).await.unwrap();
    assert_eq!(store.sweeper_state().await, Some(SweeperState::Idle));

    store.close().await.unwrap();
    store.close().await.unwrap();

    assert!(store.sweeper_state().await.is_none());
    assert!(matches!(store.get("k").await, Err(Error::Closed)));
    assert!(matches!(
        store.set("k", b"v".to_vec()).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test_persists_across_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = DurableConfig::at(tmp.path().join("nested"));

    let store = DurableBackend::open(&config).await.unwrap();
    store.set("durable", b"yes".to_vec()).await.unwrap();
    store.close().await.unwrap();
    assert!(config.database_path().exists());

    let store = DurableBackend::open(&config).await.unwrap();
    assert_eq!(store.get("durable").await.unwrap().value, b"yes");
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_custom_table_name() {
    let tmp = TempDir::new().unwrap();
    let config = DurableConfig {
        database_name: "custom".to_string(),
        table_name: "sessions".to_string(),
        ..DurableConfig::at(tmp.path())
    };

    let store = DurableBackend::open(&config).await.unwrap();
    store.set("k", b"v".to_vec()).await.unwrap();
    store.close().await.unwrap();

    let conn = Connection::open(tmp.path().join("custom.db")).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_invalid_table_name_rejected() {
    let config = DurableConfig {
        table_name: "kv; DROP TABLE x".to_string(),
        ..DurableConfig::in_memory()
    };
    let err = DurableBackend::open(&config).await.err().unwrap();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "table_name"));
}
