use crate::catalog::AnnotationCatalog;
use crate::loader::{RecordLoader, RetryPolicy};
use crate::scanner::FilePattern;
use crate::store::{CommonAnnotationPolicy, IndexPaths, IndexSettings, ServiceEvent, SignalIndex};
use crate::watcher::{self, EventTranslator, FsChange, WatcherCommand};
use crate::{IndexerError, Result};
use log::{debug, error, info, warn};
use notify::RecommendedWatcher;
use signal_protocol::{
    AnnotationGroup, CommonAnnotations, DumpReport, RecordDetail, RecordSummary,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;
const FS_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub paths: IndexPaths,
    pub annotation_list_path: PathBuf,
    pub file_pattern: String,
    pub initial_retry: RetryPolicy,
    pub created_retry: RetryPolicy,
    pub common: CommonAnnotationPolicy,
    /// Hold time for an unpaired rename-from before it counts as a deletion.
    pub rename_settle: Duration,
    /// Start the directory watcher. Tests drive changes by hand when off.
    pub watch: bool,
    pub allow_shutdown: bool,
}

impl ServiceConfig {
    pub fn new(paths: IndexPaths, annotation_list_path: impl Into<PathBuf>) -> Self {
        let defaults = IndexSettings::default();
        Self {
            paths,
            annotation_list_path: annotation_list_path.into(),
            file_pattern: defaults.pattern.as_str().to_string(),
            initial_retry: defaults.initial_retry,
            created_retry: defaults.created_retry,
            common: defaults.common,
            rename_settle: Duration::from_millis(250),
            watch: true,
            allow_shutdown: false,
        }
    }

    fn settings(&self) -> Result<IndexSettings> {
        Ok(IndexSettings {
            pattern: FilePattern::new(&self.file_pattern)?,
            initial_retry: self.initial_retry,
            created_retry: self.created_retry,
            common: self.common.clone(),
        })
    }
}

/// State shared by the request facade and the watch loop.
pub(crate) struct Shared {
    index: Mutex<SignalIndex>,
    events: broadcast::Sender<ServiceEvent>,
    halted: OnceLock<String>,
}

impl Shared {
    pub(crate) async fn apply_change(&self, change: &FsChange) -> Result<()> {
        if let Some(reason) = self.halted.get() {
            debug!("Dropping {change:?}, service halted: {reason}");
            return Ok(());
        }
        let mut index = self.index.lock().await;
        let result = watcher::apply_change(&mut index, change).await;
        if let Err(err) = &result {
            if !self.escalate("watcher", err) {
                warn!("watcher: {err}");
            }
        }
        result
    }

    async fn lock_for_mutation(&self) -> Result<MutexGuard<'_, SignalIndex>> {
        if let Some(reason) = self.halted.get() {
            return Err(IndexerError::LedgerInvariant(reason.clone()));
        }
        Ok(self.index.lock().await)
    }

    /// Halts the service on a fatal error. Other errors are left to the
    /// caller to log. Returns whether the service halted.
    fn escalate(&self, context: &str, err: &IndexerError) -> bool {
        if !err.is_fatal() {
            return false;
        }
        error!("{context}: {err}; refusing further mutations");
        let _ = self.halted.set(err.to_string());
        let _ = self.events.send(ServiceEvent::Fatal(err.to_string()));
        true
    }
}

struct WatchHandle {
    fs_watcher: RecommendedWatcher,
    command_tx: mpsc::Sender<WatcherCommand>,
    task: JoinHandle<()>,
}

/// The annotation service: an owned index plus its directory watcher.
///
/// Cheap to clone; all clones share one index.
#[derive(Clone)]
pub struct AnnotationService {
    shared: Arc<Shared>,
    allow_shutdown: bool,
    watch: Arc<StdMutex<Option<WatchHandle>>>,
}

impl AnnotationService {
    /// Loads the catalog, scans the watched directory, merges persisted
    /// counts and submissions, then starts watching.
    pub async fn open(config: ServiceConfig, loader: Arc<dyn RecordLoader>) -> Result<Self> {
        if !config.paths.watch_dir.is_dir() {
            return Err(IndexerError::config(format!(
                "watch directory {} does not exist",
                config.paths.watch_dir.display()
            )));
        }
        let catalog = Arc::new(AnnotationCatalog::load(&config.annotation_list_path)?);
        info!(
            "Loaded {} annotation labels from {}",
            catalog.labels().len(),
            config.annotation_list_path.display()
        );
        let settings = config.settings()?;
        let pattern = settings.pattern.clone();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        // Subscribe to the directory before scanning so nothing written
        // during the scan is missed; the buffered events replay afterwards.
        let fs_channel = if config.watch {
            let (tx, rx) = mpsc::channel(FS_EVENT_CAPACITY);
            let fs_watcher =
                watcher::create_fs_watcher(&config.paths.watch_dir, tx, Duration::from_millis(500))?;
            Some((fs_watcher, rx))
        } else {
            None
        };

        let mut index = SignalIndex::new(
            config.paths.clone(),
            settings,
            catalog,
            loader,
            events.clone(),
        );
        index.load_initial().await?;

        let shared = Arc::new(Shared {
            index: Mutex::new(index),
            events,
            halted: OnceLock::new(),
        });

        let handle = fs_channel.map(|(fs_watcher, event_rx)| {
            let (command_tx, command_rx) = mpsc::channel(4);
            let translator = EventTranslator::new(pattern, config.rename_settle);
            let task = watcher::spawn_watch_loop(shared.clone(), translator, event_rx, command_rx);
            info!("Watching {}", config.paths.watch_dir.display());
            WatchHandle {
                fs_watcher,
                command_tx,
                task,
            }
        });

        Ok(Self {
            shared,
            allow_shutdown: config.allow_shutdown,
            watch: Arc::new(StdMutex::new(handle)),
        })
    }

    /// Stops the watcher. Pending filesystem events are dropped.
    pub async fn close(&self) {
        let handle = self.watch.lock().ok().and_then(|mut guard| guard.take());
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.command_tx.send(WatcherCommand::Shutdown).await;
        drop(handle.fs_watcher);
        if let Err(err) = handle.task.await {
            warn!("Watch loop ended abnormally: {err}");
        }
        info!("Service closed");
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.shared.halted.get().is_some()
    }

    pub async fn annotation_list(&self) -> Vec<AnnotationGroup> {
        self.shared.index.lock().await.annotation_list()
    }

    pub async fn common_annotation_list(&self) -> CommonAnnotations {
        self.shared.index.lock().await.common_annotations()
    }

    pub async fn record_list(&self) -> Vec<RecordSummary> {
        self.shared.index.lock().await.record_list()
    }

    pub async fn item_data(&self, id: &str) -> Result<RecordDetail> {
        self.shared.index.lock().await.record_detail(id)
    }

    pub async fn set_annotation(&self, id: &str, labels: Vec<String>) -> Result<()> {
        let mut index = self.shared.lock_for_mutation().await?;
        index
            .set_annotation(id, labels)
            .inspect_err(|err| {
                self.shared.escalate("set annotation", err);
            })
    }

    pub async fn dump_signals(&self) -> Result<DumpReport> {
        let mut index = self.shared.lock_for_mutation().await?;
        let result = index.dump().await;
        if let Err(err) = &result {
            self.shared.escalate("dump", err);
        }
        result
    }

    /// Feeds one filesystem change through the index, as the watch loop does.
    pub async fn apply_change(&self, change: FsChange) -> Result<()> {
        self.shared.apply_change(&change).await
    }

    /// Accepts a shutdown request when enabled and `connected` is exactly one.
    /// Publishes [`ServiceEvent::Shutdown`]; the owner of the process exits.
    pub fn shutdown(&self, connected: usize) -> Result<()> {
        self.check_shutdown(connected)?;
        info!("Shutdown requested");
        let _ = self.shared.events.send(ServiceEvent::Shutdown);
        Ok(())
    }

    pub fn check_shutdown(&self, connected: usize) -> Result<()> {
        if !self.allow_shutdown {
            return Err(IndexerError::validation("Shutdown is disabled"));
        }
        if connected != 1 {
            return Err(IndexerError::validation(format!(
                "Shutdown refused: {connected} clients connected"
            )));
        }
        Ok(())
    }

    /// Runs `f` against the index under the lock.
    pub async fn with_index<R>(&self, f: impl FnOnce(&SignalIndex) -> R) -> R {
        let index = self.shared.index.lock().await;
        f(&index)
    }
}
