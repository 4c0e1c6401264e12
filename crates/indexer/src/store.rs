use crate::catalog::AnnotationCatalog;
use crate::ledger::CountLedger;
use crate::loader::{resolve, LoadedRecord, RecordLoader, RetryPolicy, SignalMeta};
use crate::scanner::{file_name, FilePattern, FileScanner};
use crate::submissions::SubmissionTable;
use crate::{IndexerError, Result};
use indexmap::IndexMap;
use signal_protocol::{AnnotationGroup, CommonAnnotations, RecordDetail, RecordSummary};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Unsolicited notifications published after internal mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    RecordList(Vec<RecordSummary>),
    CommonAnnotations(CommonAnnotations),
    /// The process should terminate (shutdown request accepted).
    Shutdown,
    /// An internal consistency fault; the service stops accepting mutations.
    Fatal(String),
}

/// One decoded signal file tracked by content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    pub content_hash: String,
    pub file_name: String,
    pub modified: SystemTime,
    pub signal: Vec<Vec<f64>>,
    pub meta: SignalMeta,
    pub annotation: Vec<String>,
}

impl SignalRecord {
    pub fn from_loaded(file_name: String, loaded: LoadedRecord) -> Self {
        Self {
            content_hash: loaded.content_hash,
            file_name,
            modified: loaded.modified,
            signal: loaded.signal,
            meta: loaded.meta,
            annotation: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_annotated(&self) -> bool {
        !self.annotation.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub watch_dir: PathBuf,
    pub dump_dir: PathBuf,
    pub annotation_count_path: PathBuf,
    pub submitted_annotation_path: PathBuf,
}

/// Ranking rules for the common-annotation shortlist.
#[derive(Debug, Clone)]
pub struct CommonAnnotationPolicy {
    pub top_n: usize,
    /// Labels containing any of these substrings are never suggested.
    pub stoplist: Vec<String>,
    pub defaults: Vec<String>,
}

impl Default for CommonAnnotationPolicy {
    fn default() -> Self {
        Self {
            top_n: 5,
            stoplist: vec![
                "Uninterpretable ECG".to_string(),
                "Other pathology".to_string(),
                "Other pathology in this group".to_string(),
            ],
            defaults: vec!["Normal rhythm".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub pattern: FilePattern,
    /// Budget for files found by the startup scan.
    pub initial_retry: RetryPolicy,
    /// Budget for files announced by the watcher; they may still be flushing.
    pub created_retry: RetryPolicy,
    pub common: CommonAnnotationPolicy,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            pattern: FilePattern::default(),
            initial_retry: RetryPolicy::new(1, Duration::from_millis(100)),
            created_retry: RetryPolicy::new(5, Duration::from_millis(100)),
            common: CommonAnnotationPolicy::default(),
        }
    }
}

/// What [`SignalIndex::reconcile`] did with an incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// New content.
    Inserted,
    /// Same content, incoming file is older: it replaced the stored one.
    Replaced { removed_file: String },
    /// Same content, incoming file is a redundant copy and was deleted.
    Discarded,
    /// The stored record already points at this file.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vanished {
    /// Dump-induced deletion; one guard entry consumed.
    Guarded,
    Removed { records: usize, annotated: usize },
}

/// The deduplicated record set, the count ledger and the dump guard.
///
/// Not synchronised by itself: the service wraps it in a single mutex shared
/// by the watcher loop and request handlers. Mutations publish their follow-up
/// notifications on `events` while still inside that critical section.
pub struct SignalIndex {
    pub(crate) paths: IndexPaths,
    pub(crate) settings: IndexSettings,
    pub(crate) catalog: Arc<AnnotationCatalog>,
    pub(crate) ledger: CountLedger,
    pub(crate) records: IndexMap<String, SignalRecord>,
    pub(crate) dumped: HashSet<String>,
    loader: Arc<dyn RecordLoader>,
    events: broadcast::Sender<ServiceEvent>,
}

impl SignalIndex {
    pub fn new(
        paths: IndexPaths,
        settings: IndexSettings,
        catalog: Arc<AnnotationCatalog>,
        loader: Arc<dyn RecordLoader>,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Self {
        let ledger = catalog.initial_ledger();
        Self {
            paths,
            settings,
            catalog,
            ledger,
            records: IndexMap::new(),
            dumped: HashSet::new(),
            loader,
            events,
        }
    }

    /// Startup sequence: scan, then carry over persisted counts and submissions.
    pub async fn load_initial(&mut self) -> Result<()> {
        log::info!("Initial loading started");
        let files = FileScanner::new(&self.paths.watch_dir, &self.settings.pattern).scan()?;
        for path in files {
            let policy = self.settings.initial_retry;
            match resolve(self.loader.as_ref(), &path, policy).await {
                Ok(loaded) => {
                    self.reconcile(&path, loaded)?;
                }
                Err(err) => log::warn!("Skipping {}: {err}", path.display()),
            }
        }
        self.merge_count_snapshot()?;
        self.merge_submitted_table()?;
        log::info!("Initial loading finished");
        self.log_records();
        Ok(())
    }

    pub fn merge_count_snapshot(&mut self) -> Result<()> {
        match CountLedger::read_snapshot(&self.paths.annotation_count_path)? {
            Some(snapshot) => {
                self.ledger.merge_snapshot(&snapshot);
                log::debug!("Counts for submitted annotations are loaded");
            }
            None => log::debug!("There is no annotation count file"),
        }
        Ok(())
    }

    /// Adds the table's column sums to the ledger and seeds live records from
    /// rows keyed by their file name. A row with labels the catalog does not
    /// know still counts but is not used for seeding.
    pub fn merge_submitted_table(&mut self) -> Result<()> {
        let Some(table) = SubmissionTable::read(&self.paths.submitted_annotation_path)? else {
            log::debug!("There are no submitted annotations");
            return Ok(());
        };
        self.ledger.merge_counts(table.column_sums());

        let mut seeded = 0usize;
        for record in self.records.values_mut() {
            let Some(labels) = table.row(&record.file_name) else {
                continue;
            };
            let unknown = self.catalog.unknown(&labels);
            if !unknown.is_empty() {
                log::warn!(
                    "Submitted annotation for signal {} contains unknown values {} and will not be used",
                    record.file_name,
                    unknown.join(", ")
                );
                continue;
            }
            record.annotation = labels;
            seeded += 1;
        }
        log::debug!("Submitted annotations for {seeded} signals are loaded");
        Ok(())
    }

    /// Inserts `loaded` (read from `path`) unless its content is already stored.
    ///
    /// Of all files with the same content the one with the earliest
    /// modification time survives; every other copy is deleted from disk.
    pub fn reconcile(&mut self, path: &Path, loaded: LoadedRecord) -> Result<Reconciled> {
        let name = file_name(path)
            .ok_or_else(|| IndexerError::Other(format!("no file name in {}", path.display())))?;
        let incoming = SignalRecord::from_loaded(name, loaded);
        self.evict_stale_name(&incoming)?;

        let Some(existing) = self.records.get(&incoming.content_hash) else {
            self.records.insert(incoming.content_hash.clone(), incoming);
            return Ok(Reconciled::Inserted);
        };

        if existing.file_name == incoming.file_name {
            return Ok(Reconciled::Unchanged);
        }

        if existing.modified > incoming.modified {
            let mut incoming = incoming;
            let removed_file = existing.file_name.clone();
            incoming.annotation = existing.annotation.clone();
            let carried = incoming.is_annotated();
            // IndexMap::insert on an existing key keeps the original slot.
            self.records.insert(incoming.content_hash.clone(), incoming);
            if carried {
                self.persist_submissions()?;
            }
            self.remove_duplicate(&self.paths.watch_dir.join(&removed_file))?;
            Ok(Reconciled::Replaced { removed_file })
        } else {
            self.remove_duplicate(path)?;
            Ok(Reconciled::Discarded)
        }
    }

    /// A file name now holds different content: forget what it used to hold.
    fn evict_stale_name(&mut self, incoming: &SignalRecord) -> Result<()> {
        let stale: Vec<String> = self
            .records
            .values()
            .filter(|r| {
                r.file_name == incoming.file_name && r.content_hash != incoming.content_hash
            })
            .map(|r| r.content_hash.clone())
            .collect();
        let mut annotated = false;
        for hash in stale {
            if let Some(record) = self.records.shift_remove(&hash) {
                log::info!(
                    "{} was overwritten with new content, dropping the old record",
                    record.file_name
                );
                if record.is_annotated() {
                    self.ledger.decrement(&record.annotation)?;
                    annotated = true;
                }
            }
        }
        if annotated {
            self.persist_submissions()?;
            self.publish_common_annotations();
        }
        Ok(())
    }

    fn remove_duplicate(&self, path: &Path) -> Result<()> {
        log::debug!(
            "The same signal already exists, deleting the file {}",
            path.display()
        );
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("{} is already gone", path.display());
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Watcher entry for a new matching file.
    pub async fn file_appeared(&mut self, path: &Path) -> Result<Reconciled> {
        log::info!(
            "File created: {}",
            file_name(path).unwrap_or_else(|| path.display().to_string())
        );
        let policy = self.settings.created_retry;
        let loaded = resolve(self.loader.as_ref(), path, policy).await?;
        let outcome = self.reconcile(path, loaded)?;
        self.log_records();
        self.publish_record_list();
        Ok(outcome)
    }

    /// Watcher entry for a matching file that left the directory.
    pub fn file_vanished(&mut self, name: &str) -> Result<Vanished> {
        if self.dumped.remove(name) {
            log::debug!("Ignoring deletion of dumped file {name}");
            return Ok(Vanished::Guarded);
        }
        log::info!("File deleted: {name}");

        let doomed: Vec<String> = self
            .records
            .values()
            .filter(|r| r.file_name == name)
            .map(|r| r.content_hash.clone())
            .collect();
        let mut annotated = 0usize;
        for hash in &doomed {
            if let Some(record) = self.records.shift_remove(hash) {
                if record.is_annotated() {
                    self.ledger.decrement(&record.annotation)?;
                    annotated += 1;
                }
            }
        }
        if annotated > 0 {
            self.persist_submissions()?;
            self.publish_common_annotations();
        }
        self.log_records();
        self.publish_record_list();
        Ok(Vanished::Removed {
            records: doomed.len(),
            annotated,
        })
    }

    /// Watcher entry for a rename where both names match. Returns `false` if
    /// no record carried the old name.
    pub fn file_renamed(&mut self, from: &str, to: &str) -> Result<bool> {
        log::info!("File renamed: {from} -> {to}");
        let mut released = false;
        if from != to && self.records.values().any(|r| r.file_name == from) {
            let overwritten: Vec<String> = self
                .records
                .values()
                .filter(|r| r.file_name == to)
                .map(|r| r.content_hash.clone())
                .collect();
            for hash in overwritten {
                if let Some(record) = self.records.shift_remove(&hash) {
                    log::info!("{to} was replaced by {from}, dropping its old record");
                    if record.is_annotated() {
                        self.ledger.decrement(&record.annotation)?;
                        released = true;
                    }
                }
            }
        }

        let mut found = false;
        let mut annotated = released;
        for record in self.records.values_mut() {
            if record.file_name == from {
                record.file_name = to.to_string();
                found = true;
                annotated |= record.is_annotated();
            }
        }
        if annotated {
            self.persist_submissions()?;
        }
        if released {
            self.publish_common_annotations();
        }
        self.log_records();
        self.publish_record_list();
        Ok(found)
    }

    /// Replaces the annotation of record `id` and updates the ledger.
    pub fn set_annotation(&mut self, id: &str, labels: Vec<String>) -> Result<()> {
        if !self.records.contains_key(id) {
            return Err(IndexerError::NotFound(id.to_string()));
        }
        let mut labels = labels;
        let mut seen = HashSet::new();
        labels.retain(|label| seen.insert(label.clone()));
        if labels.is_empty() {
            return Err(IndexerError::validation("Empty annotation"));
        }
        let unknown = self.catalog.unknown(&labels);
        if !unknown.is_empty() {
            return Err(IndexerError::validation(format!(
                "Unknown annotation: {}",
                unknown.join(", ")
            )));
        }

        let previous = self
            .records
            .get(id)
            .map(|r| r.annotation.clone())
            .unwrap_or_default();
        self.ledger.decrement(&previous)?;
        if let Err(err) = self.ledger.increment(&labels) {
            self.ledger.increment(&previous)?;
            return Err(err);
        }
        if let Some(record) = self.records.get_mut(id) {
            record.annotation = labels;
        }
        self.persist_submissions()?;
        self.publish_common_annotations();
        Ok(())
    }

    /// Writes the submission table for every annotated live record.
    pub(crate) fn persist_submissions(&self) -> Result<()> {
        let table = self.submission_table();
        if table.is_empty() {
            log::info!("No annotation to dump");
        } else {
            log::info!("Dumping annotations for {}", table.index.join(", "));
        }
        table.write(&self.paths.submitted_annotation_path)?;
        log::debug!(
            "Annotations written to {}",
            self.paths.submitted_annotation_path.display()
        );
        Ok(())
    }

    pub(crate) fn submission_table(&self) -> SubmissionTable {
        SubmissionTable::encode(
            self.ledger.labels(),
            self.records
                .values()
                .filter(|r| r.is_annotated())
                .map(|r| (r.file_name.as_str(), r.annotation.as_slice())),
        )
    }

    #[must_use]
    pub fn annotation_list(&self) -> Vec<AnnotationGroup> {
        self.catalog.groups()
    }

    /// Most used labels, ties broken by name, padded with the defaults.
    #[must_use]
    pub fn common_annotations(&self) -> CommonAnnotations {
        let policy = &self.settings.common;
        let mut ranked: Vec<(&str, u64)> = self
            .ledger
            .iter()
            .filter(|(label, count)| {
                *count > 0 && !policy.stoplist.iter().any(|word| label.contains(word.as_str()))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut annotations: Vec<String> =
            ranked.into_iter().map(|(label, _)| label.to_string()).collect();
        let mut defaults = policy.defaults.clone();
        defaults.sort();
        for default in defaults {
            if !annotations.contains(&default) {
                annotations.push(default);
            }
        }
        annotations.truncate(policy.top_n);
        log::debug!(
            "Top {} most common annotations: {}",
            policy.top_n,
            annotations.join(", ")
        );
        CommonAnnotations { annotations }
    }

    /// Every record, newest timestamp first.
    #[must_use]
    pub fn record_list(&self) -> Vec<RecordSummary> {
        let mut records: Vec<&SignalRecord> = self.records.values().collect();
        records.sort_by(|a, b| b.meta.timestamp.cmp(&a.meta.timestamp));
        records
            .into_iter()
            .map(|r| RecordSummary {
                id: r.content_hash.clone(),
                timestamp: r.meta.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                is_annotated: r.is_annotated(),
            })
            .collect()
    }

    pub fn record_detail(&self, id: &str) -> Result<RecordDetail> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| IndexerError::NotFound(id.to_string()))?;
        Ok(RecordDetail {
            id: record.content_hash.clone(),
            signal: record.signal.clone(),
            frequency: record.meta.frequency,
            units: record.meta.units.clone(),
            signame: record.meta.signame.clone(),
            annotation: record.annotation.clone(),
        })
    }

    #[must_use]
    pub fn ledger(&self) -> &CountLedger {
        &self.ledger
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SignalRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &SignalRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn is_guarded(&self, name: &str) -> bool {
        self.dumped.contains(name)
    }

    pub(crate) fn publish_record_list(&self) {
        let _ = self.events.send(ServiceEvent::RecordList(self.record_list()));
    }

    pub(crate) fn publish_common_annotations(&self) {
        let _ = self
            .events
            .send(ServiceEvent::CommonAnnotations(self.common_annotations()));
    }

    pub(crate) fn log_records(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let names: Vec<&str> = self.records.values().map(|r| r.file_name.as_str()).collect();
        log::debug!("{} signals are stored: {}", names.len(), names.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use pretty_assertions::assert_eq;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn older_duplicate_replaces_newer_in_place_and_keeps_annotation() {
        let fx = fixture(r#"{"Rhythm": ["Normal", "AFib"]}"#);
        fx.loader.put("first.json", "H0", at(10), "2024-01-01T00:00:00");
        fx.loader.put("b.json", "H1", at(100), "2024-01-02T00:00:00");
        fx.loader.put("c.json", "H1", at(50), "2024-01-02T00:00:00");
        let mut index = fx.index();

        index.file_appeared(&fx.watch("first.json")).await.unwrap();
        index.file_appeared(&fx.watch("b.json")).await.unwrap();
        index
            .set_annotation("H1", vec!["Rhythm/AFib".into()])
            .unwrap();

        let outcome = index.file_appeared(&fx.watch("c.json")).await.unwrap();
        assert_eq!(
            outcome,
            Reconciled::Replaced {
                removed_file: "b.json".to_string()
            }
        );
        let order: Vec<_> = index.records().map(|r| r.file_name.clone()).collect();
        assert_eq!(order, ["first.json", "c.json"]);
        assert_eq!(index.get("H1").unwrap().annotation, ["Rhythm/AFib"]);
        assert!(!fx.watch("b.json").exists());
        assert!(fx.watch("c.json").exists());
        assert_eq!(index.ledger().get("Rhythm/AFib"), Some(1));

        let table = SubmissionTable::read(&fx.paths.submitted_annotation_path)
            .unwrap()
            .unwrap();
        assert_eq!(table.index, ["c.json"]);
    }

    #[tokio::test]
    async fn newer_duplicate_is_deleted() {
        let fx = fixture(r#"{"Rhythm": ["Normal"]}"#);
        fx.loader.put("c.json", "H1", at(50), "2024-01-02T00:00:00");
        fx.loader.put("b.json", "H1", at(100), "2024-01-02T00:00:00");
        let mut index = fx.index();

        index.file_appeared(&fx.watch("c.json")).await.unwrap();
        let outcome = index.file_appeared(&fx.watch("b.json")).await.unwrap();

        assert_eq!(outcome, Reconciled::Discarded);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("H1").unwrap().file_name, "c.json");
        assert!(!fx.watch("b.json").exists());
    }

    #[tokio::test]
    async fn re_announced_file_is_not_deleted() {
        let fx = fixture(r#"{"Rhythm": ["Normal"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        let mut index = fx.index();

        index.file_appeared(&fx.watch("a.json")).await.unwrap();
        let outcome = index.file_appeared(&fx.watch("a.json")).await.unwrap();
        assert_eq!(outcome, Reconciled::Unchanged);
        assert!(fx.watch("a.json").exists());
    }

    #[tokio::test]
    async fn overwritten_file_drops_old_content_and_its_counts() {
        let fx = fixture(r#"{"Rhythm": ["Normal"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        let mut index = fx.index();
        index.file_appeared(&fx.watch("a.json")).await.unwrap();
        index
            .set_annotation("H1", vec!["Rhythm/Normal".into()])
            .unwrap();

        fx.loader.put("a.json", "H2", at(60), "2024-01-03T00:00:00");
        index.file_appeared(&fx.watch("a.json")).await.unwrap();

        assert!(index.get("H1").is_none());
        assert!(index.get("H2").is_some());
        assert_eq!(index.ledger().get("Rhythm/Normal"), Some(0));
    }

    #[tokio::test]
    async fn set_annotation_validates_and_moves_counts() {
        let fx = fixture(r#"{"Rhythm": ["Normal", "AFib"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        let mut index = fx.index();
        index.file_appeared(&fx.watch("a.json")).await.unwrap();

        assert!(matches!(
            index.set_annotation("nope", vec!["Rhythm/AFib".into()]),
            Err(IndexerError::NotFound(_))
        ));
        assert!(matches!(
            index.set_annotation("H1", Vec::new()),
            Err(IndexerError::Validation(_))
        ));
        assert!(matches!(
            index.set_annotation("H1", vec!["Rhythm/AFib".into(), "Rhythm".into()]),
            Err(IndexerError::Validation(_))
        ));

        index
            .set_annotation("H1", vec!["Rhythm/AFib".into(), "Rhythm/AFib".into()])
            .unwrap();
        assert_eq!(index.ledger().get("Rhythm/AFib"), Some(1));
        index
            .set_annotation("H1", vec!["Rhythm/Normal".into()])
            .unwrap();
        assert_eq!(index.ledger().get("Rhythm/AFib"), Some(0));
        assert_eq!(index.ledger().get("Rhythm/Normal"), Some(1));
        assert_eq!(
            index.record_detail("H1").unwrap().annotation,
            ["Rhythm/Normal"]
        );
    }

    #[tokio::test]
    async fn vanished_annotated_file_releases_counts() {
        let fx = fixture(r#"{"Rhythm": ["Normal", "AFib"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        let mut index = fx.index();
        let mut events = fx.events.subscribe();
        index.file_appeared(&fx.watch("a.json")).await.unwrap();
        index
            .set_annotation("H1", vec!["Rhythm/AFib".into()])
            .unwrap();
        while events.try_recv().is_ok() {}

        let outcome = index.file_vanished("a.json").unwrap();
        assert_eq!(
            outcome,
            Vanished::Removed {
                records: 1,
                annotated: 1
            }
        );
        assert!(index.is_empty());
        assert_eq!(index.ledger().get("Rhythm/AFib"), Some(0));
        assert!(matches!(
            events.try_recv().unwrap(),
            ServiceEvent::CommonAnnotations(_)
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            ServiceEvent::RecordList(Vec::new())
        );
    }

    #[tokio::test]
    async fn guarded_deletion_is_consumed_once() {
        let fx = fixture(r#"{"Rhythm": ["Normal"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        let mut index = fx.index();
        index.file_appeared(&fx.watch("a.json")).await.unwrap();
        index.dumped.insert("a.json".to_string());

        assert_eq!(index.file_vanished("a.json").unwrap(), Vanished::Guarded);
        assert!(!index.is_guarded("a.json"));
        assert_eq!(index.len(), 1);

        assert_eq!(
            index.file_vanished("a.json").unwrap(),
            Vanished::Removed {
                records: 1,
                annotated: 0
            }
        );
    }

    #[tokio::test]
    async fn rename_updates_file_name_and_table() {
        let fx = fixture(r#"{"Rhythm": ["Normal"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        let mut index = fx.index();
        index.file_appeared(&fx.watch("a.json")).await.unwrap();
        index
            .set_annotation("H1", vec!["Rhythm/Normal".into()])
            .unwrap();

        assert!(index.file_renamed("a.json", "z.json").unwrap());
        assert_eq!(index.get("H1").unwrap().file_name, "z.json");
        let table = SubmissionTable::read(&fx.paths.submitted_annotation_path)
            .unwrap()
            .unwrap();
        assert_eq!(table.index, ["z.json"]);
        assert!(!index.file_renamed("missing.json", "other.json").unwrap());
    }

    #[tokio::test]
    async fn rename_onto_indexed_name_drops_overwritten_record() {
        let fx = fixture(r#"{"Rhythm": ["Normal", "AFib"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        fx.loader.put("b.json", "H2", at(60), "2024-01-03T00:00:00");
        let mut index = fx.index();
        index.file_appeared(&fx.watch("a.json")).await.unwrap();
        index.file_appeared(&fx.watch("b.json")).await.unwrap();
        index
            .set_annotation("H1", vec!["Rhythm/AFib".into()])
            .unwrap();
        index
            .set_annotation("H2", vec!["Rhythm/Normal".into()])
            .unwrap();

        std::fs::rename(fx.watch("a.json"), fx.watch("b.json")).unwrap();
        assert!(index.file_renamed("a.json", "b.json").unwrap());

        let names: Vec<(&str, &str)> = index
            .records()
            .map(|r| (r.content_hash.as_str(), r.file_name.as_str()))
            .collect();
        assert_eq!(names, [("H1", "b.json")]);
        assert_eq!(index.ledger().get("Rhythm/Normal"), Some(0));
        assert_eq!(index.ledger().get("Rhythm/AFib"), Some(1));
        let table = SubmissionTable::read(&fx.paths.submitted_annotation_path)
            .unwrap()
            .unwrap();
        assert_eq!(table.index, ["b.json"]);

        let report = index.dump().await.unwrap();
        assert_eq!(report.moved, 1);
    }

    #[tokio::test]
    async fn submitted_rows_with_retired_labels_count_but_do_not_seed() {
        let fx = fixture(r#"{"Rhythm": ["Normal", "AFib"]}"#);
        fx.loader.put("a.json", "H1", at(50), "2024-01-02T00:00:00");
        let columns = vec![
            "Rhythm/Normal".to_string(),
            "Rhythm/AFib".to_string(),
            "Retired/X".to_string(),
        ];
        let labels = vec!["Rhythm/AFib".to_string(), "Retired/X".to_string()];
        SubmissionTable::encode(columns, [("a.json", labels.as_slice())])
            .write(&fx.paths.submitted_annotation_path)
            .unwrap();

        let mut index = fx.index();
        index.load_initial().await.unwrap();

        assert_eq!(index.ledger().get("Rhythm/AFib"), Some(1));
        assert_eq!(index.ledger().get("Rhythm/Normal"), Some(0));
        assert_eq!(index.ledger().get("Retired/X"), None);
        assert!(index.get("H1").unwrap().annotation.is_empty());
    }

    #[tokio::test]
    async fn record_list_is_newest_first() {
        let fx = fixture(r#"{"Rhythm": ["Normal"]}"#);
        fx.loader.put("a.json", "H1", at(1), "2024-01-02T08:00:00");
        fx.loader.put("b.json", "H2", at(2), "2024-03-02T09:30:15");
        let mut index = fx.index();
        index.file_appeared(&fx.watch("a.json")).await.unwrap();
        index.file_appeared(&fx.watch("b.json")).await.unwrap();

        let list = index.record_list();
        assert_eq!(list[0].id, "H2");
        assert_eq!(list[0].timestamp, "02.03.2024 09:30:15");
        assert_eq!(list[1].timestamp, "02.01.2024 08:00:00");
        assert!(!list[0].is_annotated);
    }

    #[test]
    fn common_annotations_rank_filter_and_pad() {
        let fx = fixture(
            r#"{"Rhythm": ["Normal rhythm", "AFib", "Other pathology"], "A": [], "B": [], "C": [], "D": []}"#,
        );
        let mut index = fx.index();
        index.ledger.merge_counts([
            ("Rhythm/AFib", 4),
            ("Rhythm/Other pathology", 9),
            ("B", 2),
            ("A", 2),
        ]);

        assert_eq!(
            index.common_annotations().annotations,
            ["Rhythm/AFib", "A", "B", "Normal rhythm"]
        );

        index.ledger.merge_counts([("C", 1), ("D", 1), ("Rhythm/Normal rhythm", 1)]);
        assert_eq!(
            index.common_annotations().annotations,
            ["Rhythm/AFib", "A", "B", "C", "D"]
        );
    }
}
