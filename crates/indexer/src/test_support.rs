use crate::catalog::AnnotationCatalog;
use crate::loader::{LoadedRecord, RecordLoader, SignalMeta};
use crate::store::{IndexPaths, IndexSettings, ServiceEvent, SignalIndex};
use crate::{IndexerError, Result};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Loader whose hash and mtime are chosen by the test, keyed by file name.
pub(crate) struct StaticLoader {
    root: PathBuf,
    entries: Mutex<HashMap<String, LoadedRecord>>,
}

impl StaticLoader {
    /// Registers `name` and creates a placeholder file for it.
    pub(crate) fn put(&self, name: &str, hash: &str, modified: SystemTime, timestamp: &str) {
        std::fs::write(self.root.join(name), hash).unwrap();
        let record = LoadedRecord {
            content_hash: hash.to_string(),
            modified,
            signal: vec![vec![0.0, 1.0]],
            meta: SignalMeta {
                timestamp: NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S")
                    .unwrap(),
                frequency: 500.0,
                units: vec!["mV".to_string()],
                signame: vec!["I".to_string()],
            },
        };
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), record);
    }
}

impl RecordLoader for StaticLoader {
    fn load(&self, path: &Path) -> Result<LoadedRecord> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !path.exists() {
            return Err(IndexerError::load(path, "file no longer exists"));
        }
        self.entries
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| IndexerError::load(path, "unknown fixture"))
    }
}

pub(crate) struct Fixture {
    _temp: TempDir,
    pub(crate) paths: IndexPaths,
    pub(crate) loader: Arc<StaticLoader>,
    pub(crate) catalog: Arc<AnnotationCatalog>,
    pub(crate) events: broadcast::Sender<ServiceEvent>,
}

impl Fixture {
    pub(crate) fn watch(&self, name: &str) -> PathBuf {
        self.paths.watch_dir.join(name)
    }

    pub(crate) fn index(&self) -> SignalIndex {
        SignalIndex::new(
            self.paths.clone(),
            IndexSettings::default(),
            self.catalog.clone(),
            self.loader.clone(),
            self.events.clone(),
        )
    }
}

pub(crate) fn fixture(catalog: &str) -> Fixture {
    let temp = TempDir::new().unwrap();
    let watch_dir = temp.path().join("watch");
    std::fs::create_dir_all(&watch_dir).unwrap();
    let paths = IndexPaths {
        watch_dir: watch_dir.clone(),
        dump_dir: temp.path().join("dump"),
        annotation_count_path: temp.path().join("state").join("annotation_count.json"),
        submitted_annotation_path: temp.path().join("state").join("submitted.json"),
    };
    let (events, _) = broadcast::channel(64);
    Fixture {
        _temp: temp,
        paths,
        loader: Arc::new(StaticLoader {
            root: watch_dir,
            entries: Mutex::new(HashMap::new()),
        }),
        catalog: Arc::new(AnnotationCatalog::from_json(catalog.as_bytes()).unwrap()),
        events,
    }
}
