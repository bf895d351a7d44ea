//! Tests for StateManager

use super::*;
use crate::database::TableId;
use crate::offset::Offset;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn orders() -> TableId {
    TableId::new(Some("main"), "orders")
}

// ============================================================================
// Partition Key Tests
// ============================================================================

#[test]
fn test_partition_shapes() {
    let v1 = SourcePartition::table_v1(&orders());
    assert_eq!(v1.get(PROTOCOL_KEY), Some(PROTOCOL_V1));
    assert_eq!(v1.get(TABLE_KEY), Some("main.orders"));

    let v0 = SourcePartition::table_v0(&orders());
    assert_eq!(v0.get(PROTOCOL_KEY), None);
    assert_eq!(v0.get(TABLE_KEY), Some("orders"));

    let query = SourcePartition::query();
    assert_eq!(query.get(QUERY_KEY), Some("query"));
    assert_eq!(query.to_string(), "{query=query}");
}

#[test]
fn test_partition_serializes_as_map() {
    let json = serde_json::to_value(SourcePartition::table_v1(&orders())).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"protocol": "1", "table": "main.orders"})
    );
}

// ============================================================================
// Construction Tests
// ============================================================================

#[test]
fn test_state_manager_new() {
    let manager = StateManager::new("/tmp/test-offsets.json");
    assert!(!manager.is_in_memory());
    assert_eq!(manager.path().to_str().unwrap(), "/tmp/test-offsets.json");
}

#[test]
fn test_state_manager_in_memory() {
    let manager = StateManager::in_memory();
    assert!(manager.is_in_memory());
}

#[test]
fn test_from_json_invalid() {
    let err = StateManager::from_json("{not json").unwrap_err();
    assert!(matches!(err, crate::Error::State { .. }));
}

// ============================================================================
// Offset Tests
// ============================================================================

#[tokio::test]
async fn test_get_set_offset() {
    let manager = StateManager::in_memory();
    let key = SourcePartition::table_v1(&orders());

    assert!(manager.get_offset(&key).await.is_none());

    manager
        .set_offset(key.clone(), Offset::from_incrementing(5))
        .await
        .unwrap();
    manager
        .set_offset(key.clone(), Offset::from_incrementing(7))
        .await
        .unwrap();

    assert_eq!(
        manager.get_offset(&key).await,
        Some(Offset::from_incrementing(7))
    );
}

#[tokio::test]
async fn test_find_offset_prefers_first_candidate() {
    let v1 = SourcePartition::table_v1(&orders());
    let v0 = SourcePartition::table_v0(&orders());
    let manager = StateManager::in_memory();

    manager
        .set_offset(v0.clone(), Offset::from_incrementing(3))
        .await
        .unwrap();
    let found = manager.find_offset(&[v1.clone(), v0.clone()]).await;
    assert_eq!(found, Some((v0.clone(), Offset::from_incrementing(3))));

    manager
        .set_offset(v1.clone(), Offset::from_incrementing(9))
        .await
        .unwrap();
    let found = manager.find_offset(&[v1.clone(), v0]).await;
    assert_eq!(found, Some((v1, Offset::from_incrementing(9))));
}

#[tokio::test]
async fn test_clear() {
    let manager = StateManager::in_memory();
    let a = SourcePartition::table_v1(&orders());
    let b = SourcePartition::query();
    manager
        .set_offsets([
            (a.clone(), Offset::from_incrementing(1)),
            (b.clone(), Offset::from_incrementing(2)),
        ])
        .await
        .unwrap();

    manager.clear_partition(&a).await.unwrap();
    assert!(manager.get_offset(&a).await.is_none());
    assert!(manager.get_offset(&b).await.is_some());

    manager.clear().await.unwrap();
    assert!(manager.snapshot().await.is_empty());
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_save_and_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offsets.json");
    let key = SourcePartition::table_v1(&orders());

    {
        let manager = StateManager::new(&path);
        manager
            .set_offset(key.clone(), Offset::from_incrementing(42))
            .await
            .unwrap();
    }

    assert!(path.exists());
    assert!(!path.with_extension("tmp").exists());

    let manager = StateManager::from_file(&path).unwrap();
    assert_eq!(
        manager.get_offset(&key).await,
        Some(Offset::from_incrementing(42))
    );
}

#[tokio::test]
async fn test_file_format() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offsets.json");
    let manager = StateManager::new(&path);
    manager
        .set_offset(SourcePartition::query(), Offset::from_incrementing(1))
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "offsets": [
                {"partition": {"query": "query"}, "offset": {"incrementing": 1}}
            ]
        })
    );
}

#[tokio::test]
async fn test_without_auto_save_needs_explicit_save() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offsets.json");
    let manager = StateManager::without_auto_save(&path);

    manager
        .set_offset(SourcePartition::query(), Offset::from_incrementing(1))
        .await
        .unwrap();
    assert!(!path.exists());

    manager.save().await.unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_load_refreshes_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offsets.json");
    let writer = StateManager::new(&path);
    let reader = StateManager::from_file(&path).unwrap();

    writer
        .set_offset(SourcePartition::query(), Offset::from_incrementing(8))
        .await
        .unwrap();
    assert!(reader.get_offset(&SourcePartition::query()).await.is_none());

    reader.load().await.unwrap();
    assert_eq!(
        reader.get_offset(&SourcePartition::query()).await,
        Some(Offset::from_incrementing(8))
    );
}

#[tokio::test]
async fn test_clone_shares_state() {
    let manager = StateManager::in_memory();
    let clone = manager.clone();
    clone
        .set_offset(SourcePartition::query(), Offset::from_incrementing(4))
        .await
        .unwrap();
    assert_eq!(manager.snapshot().await.len(), 1);
}
