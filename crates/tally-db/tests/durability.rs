//! Counts parked in the queue must survive the process going away.

use tally_core::NewCountRecord;
use tally_db::{Database, DbConfig};

#[tokio::test]
async fn test_parked_counts_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let parked = NewCountRecord::new(5, chrono::Utc::now());
    {
        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        db.queue().add_records(std::slice::from_ref(&parked)).await.unwrap();
        db.queue().add_record(2).await.unwrap();
        db.close().await;
    }

    let db = Database::new(DbConfig::new(&path)).await.unwrap();
    let pending = db.queue().get_pending().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].upload_id, parked.upload_id);
    assert_eq!(db.queue().total_pending().await.unwrap(), 7);
    db.close().await;
}

#[tokio::test]
async fn test_uploaded_flag_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let id = db.queue().add_record(4).await.unwrap();
        db.queue().mark_uploaded(&[id]).await.unwrap();
        db.close().await;
    }

    let db = Database::new(DbConfig::new(&path)).await.unwrap();
    assert_eq!(db.queue().total_pending().await.unwrap(), 0);
    assert!(db.queue().get_pending().await.unwrap().is_empty());
    db.close().await;
}
