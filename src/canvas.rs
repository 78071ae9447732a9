use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Open canvases, keyed by the database name clients connect with.
///
/// Each canvas is an independent grid with its own engine, WAL file
/// (`<data_dir>/<name>.wal`) and compactor task. Canvases open lazily on
/// first use and stay loaded for the life of the process.
pub struct CanvasRegistry {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    shutdown: CancellationToken,
}

impl CanvasRegistry {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, shutdown: CancellationToken) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            shutdown,
        }
    }

    pub fn get_or_create(&self, canvas: &str) -> io::Result<Arc<Engine>> {
        if canvas.len() > MAX_CANVAS_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "canvas name too long",
            ));
        }
        let safe_name = sanitize_name(canvas).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty canvas name")
        })?;

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_CANVASES {
            return Err(io::Error::other("too many canvases"));
        }

        // Two raw names can sanitize to the same file; they must share one engine.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                slot.insert(engine.clone());
                engine
            }
        };
        tokio::spawn(compactor::run_compactor(
            engine.clone(),
            self.compact_threshold,
            self.shutdown.child_token(),
        ));
        info!("opened canvas {safe_name}");
        metrics::gauge!(crate::observability::CANVASES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// Keep `[A-Za-z0-9_-]`, so a name can never leave the data directory.
fn sanitize_name(name: &str) -> Option<String> {
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!safe.is_empty()).then_some(safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spotledger_test_canvas").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn registry(dir: PathBuf) -> CanvasRegistry {
        CanvasRegistry::new(dir, 1000, CancellationToken::new())
    }

    fn claim(x: Coord, y: Coord) -> NewSpot {
        NewSpot {
            x,
            y,
            width: 10,
            height: 10,
            owner_wallet: "w".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn canvases_are_isolated() {
        let reg = registry(test_data_dir("isolation"));
        let a = reg.get_or_create("canvas_a").unwrap();
        let b = reg.get_or_create("canvas_b").unwrap();

        a.create_spot(claim(0, 0)).await.unwrap();
        // Same rectangle is free on the other canvas.
        b.create_spot(claim(0, 0)).await.unwrap();
        assert!(a.create_spot(claim(5, 5)).await.is_err());
        assert_eq!(a.get_stats().total_spots, 1);
        assert_eq!(b.get_stats().total_spots, 1);
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn canvas_opens_lazily() {
        let dir = test_data_dir("lazy");
        let reg = registry(dir.clone());
        assert!(reg.is_empty());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = reg.get_or_create("my_canvas").unwrap();
        assert!(dir.join("my_canvas.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let reg = registry(test_data_dir("same_engine"));
        let e1 = reg.get_or_create("foo").unwrap();
        let e2 = reg.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[tokio::test]
    async fn names_are_sanitized() {
        let dir = test_data_dir("sanitize");
        let reg = registry(dir.clone());

        let evil = reg.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Collides with the sanitized name above.
        let plain = reg.get_or_create("evil").unwrap();
        assert!(Arc::ptr_eq(&evil, &plain));

        assert!(reg.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn name_too_long() {
        let reg = registry(test_data_dir("too_long"));
        let err = reg
            .get_or_create(&"x".repeat(MAX_CANVAS_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("canvas name too long"));
        assert!(reg.get_or_create(&"x".repeat(MAX_CANVAS_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn canvases_survive_reopen() {
        let dir = test_data_dir("reopen");
        let spot = {
            let reg = registry(dir.clone());
            let engine = reg.get_or_create("persist").unwrap();
            engine.create_spot(claim(40, 40)).await.unwrap()
        };
        let reg = registry(dir);
        let engine = reg.get_or_create("persist").unwrap();
        assert_eq!(engine.get_spot(&spot.id).unwrap(), spot);
    }

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_name("Main-Canvas_2").as_deref(), Some("Main-Canvas_2"));
        assert_eq!(sanitize_name("a/b\\c.d").as_deref(), Some("abcd"));
        assert_eq!(sanitize_name("../"), None);
        assert_eq!(sanitize_name("ünï"), Some("n".to_string()));
    }
}
