use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL as a snapshot once it grows past `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compactor pass. Returns true if a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not needed");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{Recorder, dispatcher};
    use crate::engine::{EngineDeps, EngineSettings, SystemClock};
    use crate::geo::PostalDirectory;
    use crate::model::OwnerProfile;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("petdispatch_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(path: PathBuf) -> Engine {
        Engine::open(
            path,
            EngineSettings::default(),
            EngineDeps {
                clock: Arc::new(SystemClock),
                regions: Arc::new(PostalDirectory::default()),
                dispatcher: Arc::new(dispatcher(Arc::new(Recorder::default()))),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn compacts_past_threshold_only() {
        let path = test_wal_path("threshold.wal");
        let engine = open(path.clone());

        for i in 0..5 {
            engine
                .upsert_owner(OwnerProfile {
                    id: Ulid::new(),
                    name: format!("owner {i}"),
                    email: format!("owner{i}@example.com"),
                    phone: None,
                })
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&engine, 10).await);
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        drop(engine);

        let reopened = open(path);
        assert_eq!(reopened.store.owners().len(), 5);
    }
}
