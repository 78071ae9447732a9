use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;

pub const COMPACT_INTERVAL: Duration = Duration::from_secs(60);

/// Compact the canvas WAL whenever enough appends pile up. Stops on `shutdown`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    run_compactor_every(engine, threshold, COMPACT_INTERVAL, shutdown).await
}

async fn run_compactor_every(
    engine: Arc<Engine>,
    threshold: u64,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("compactor stopped");
                return;
            }
            _ = interval.tick() => {}
        }
        engine.notify.prune();
        if compact_if_needed(&engine, threshold).await {
            info!("WAL compacted (threshold {threshold})");
        }
    }
}

/// Returns true when a compaction ran and succeeded.
async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed after {appends} appends: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spotledger_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn claim(x: Coord) -> NewSpot {
        NewSpot {
            x,
            y: 0,
            width: 1,
            height: 1,
            owner_wallet: "w".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        for x in 0..3 {
            engine.create_spot(claim(x)).await.unwrap();
        }
        assert!(!compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.store.spot_count(), 3);
    }

    #[tokio::test]
    async fn background_task_compacts_and_stops() {
        let path = test_wal_path("background.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
        for x in 0..4 {
            engine.create_spot(claim(x)).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_compactor_every(
            engine.clone(),
            2,
            Duration::from_millis(20),
            shutdown.clone(),
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.wal_appends_since_compact().await != 0 {
            assert!(tokio::time::Instant::now() < deadline, "compactor never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
