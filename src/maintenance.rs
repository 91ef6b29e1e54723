use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::Store;

/// Background task that compacts the WAL once enough records have been
/// appended since the last compaction.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&store, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when the appends since the last compaction reach `threshold`.
/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &Store, threshold: u64) -> Result<bool, crate::Error> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    store.compact().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn register(store: &Store, email: &str) {
        let user_id = Ulid::new();
        store
            .with_user_lock(user_id, |txn| {
                txn.stage(Event::UserRegistered {
                    member: Member::unassigned(user_id, email.into()),
                });
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Store::open(path.clone()).unwrap();

        for i in 0..3 {
            register(&store, &format!("{i}@x.com")).await;
        }
        assert!(!compact_if_due(&store, 5).await.unwrap());
        assert_eq!(store.wal_appends_since_compact().await, 3);

        for i in 3..5 {
            register(&store, &format!("{i}@x.com")).await;
        }
        assert!(compact_if_due(&store, 5).await.unwrap());
        assert_eq!(store.wal_appends_since_compact().await, 0);

        let reopened = Store::open(path).unwrap();
        assert_eq!(reopened.members.len(), 5);
    }
}
