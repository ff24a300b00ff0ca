use flamenco_storage::{Store, StoreOptions};

/// `Store::connect` against an on-disk database, not the in-memory pool
/// `#[sqlx::test]` hands out: confirms WAL mode actually takes effect and
/// that migrations/integrity checks/checkpointing work against a real file
/// (§10, §14).
#[tokio::test]
async fn connect_enables_wal_and_applies_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("flamenco.sqlite3");
    let database_url = format!("sqlite://{}", db_path.display());

    let store = Store::connect(&database_url, StoreOptions::default()).await.unwrap();
    store.migrate().await.unwrap();

    let mut txn = store.begin_read().await.unwrap();
    flamenco_storage::check_foreign_keys_enabled(txn.conn()).await.unwrap();

    let report = flamenco_storage::check_integrity(txn.conn()).await.unwrap();
    assert!(report.is_ok());
    drop(txn);

    let mut txn = store.begin_write().await.unwrap();
    flamenco_storage::checkpoint_wal(txn.conn()).await.unwrap();
    txn.commit().await.unwrap();

    assert!(db_path.exists());
}
