use crate::{IndexerError, Result};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;

/// Per-label occurrence counts across live and archived records.
///
/// The key set is fixed by the catalog. Counts from archived submissions are
/// carried in through [`CountLedger::merge_snapshot`] and
/// [`CountLedger::merge_counts`]; live records adjust them through
/// [`CountLedger::increment`] and [`CountLedger::decrement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountLedger {
    counts: IndexMap<String, u64>,
}

impl CountLedger {
    pub fn zeroed(labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            counts: labels.into_iter().map(|label| (label, 0)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, label: &str) -> Option<u64> {
        self.counts.get(label).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(label, count)| (label.as_str(), *count))
    }

    /// Label columns in ledger order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }

    /// Adds counts for known labels; unknown labels are ignored.
    pub fn merge_counts<'a>(&mut self, counts: impl IntoIterator<Item = (&'a str, u64)>) {
        for (label, count) in counts {
            if let Some(slot) = self.counts.get_mut(label) {
                *slot = slot.saturating_add(count);
            }
        }
    }

    pub fn merge_snapshot(&mut self, snapshot: &HashMap<String, u64>) {
        self.merge_counts(snapshot.iter().map(|(label, count)| (label.as_str(), *count)));
    }

    pub fn increment(&mut self, labels: &[String]) -> Result<()> {
        if let Some(unknown) = labels.iter().find(|label| !self.counts.contains_key(*label)) {
            return Err(IndexerError::LedgerInvariant(format!(
                "cannot count unknown label {unknown}"
            )));
        }
        for label in labels {
            if let Some(slot) = self.counts.get_mut(label) {
                *slot += 1;
            }
        }
        Ok(())
    }

    /// Fails without touching any count if one of `labels` is unknown or already zero.
    pub fn decrement(&mut self, labels: &[String]) -> Result<()> {
        for label in labels {
            match self.counts.get(label) {
                Some(count) if *count > 0 => {}
                Some(_) => {
                    return Err(IndexerError::LedgerInvariant(format!(
                        "decrementing unassigned label {label}"
                    )))
                }
                None => {
                    return Err(IndexerError::LedgerInvariant(format!(
                        "decrementing unknown label {label}"
                    )))
                }
            }
        }
        for label in labels {
            if let Some(slot) = self.counts.get_mut(label) {
                *slot -= 1;
            }
        }
        Ok(())
    }

    /// Reads a persisted snapshot; `None` when the file does not exist.
    pub fn read_snapshot(path: &Path) -> Result<Option<HashMap<String, u64>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec(&self.counts)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CountLedger;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn ledger() -> CountLedger {
        CountLedger::zeroed(["Rhythm/Normal".to_string(), "Rhythm/AFib".to_string()])
    }

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn snapshot_merge_ignores_unknown_labels() {
        let mut ledger = ledger();
        let snapshot = HashMap::from([
            ("Rhythm/AFib".to_string(), 3),
            ("Retired/Label".to_string(), 9),
        ]);
        ledger.merge_snapshot(&snapshot);
        assert_eq!(ledger.get("Rhythm/AFib"), Some(3));
        assert_eq!(ledger.get("Retired/Label"), None);
    }

    #[test]
    fn decrement_below_zero_is_rejected_atomically() {
        let mut ledger = ledger();
        ledger.increment(&labels(&["Rhythm/Normal"])).unwrap();

        let err = ledger
            .decrement(&labels(&["Rhythm/Normal", "Rhythm/AFib"]))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.get("Rhythm/Normal"), Some(1));
    }

    #[test]
    fn increment_rejects_unknown_label() {
        let mut ledger = ledger();
        assert!(ledger.increment(&labels(&["Nope"])).is_err());
        assert_eq!(ledger.get("Rhythm/Normal"), Some(0));
    }

    #[test]
    fn persists_and_reads_back_snapshot() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("counts").join("annotation_count.json");
        let mut ledger = ledger();
        ledger.increment(&labels(&["Rhythm/AFib"])).unwrap();
        ledger.persist(&path).unwrap();

        let snapshot = CountLedger::read_snapshot(&path).unwrap().unwrap();
        assert_eq!(snapshot.get("Rhythm/AFib"), Some(&1));
        assert_eq!(snapshot.get("Rhythm/Normal"), Some(&0));
        assert!(CountLedger::read_snapshot(&temp.path().join("missing.json"))
            .unwrap()
            .is_none());
    }
}
