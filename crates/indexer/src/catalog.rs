use crate::ledger::CountLedger;
use crate::{IndexerError, Result};
use indexmap::IndexMap;
use signal_protocol::AnnotationGroup;
use std::collections::HashSet;
use std::path::Path;

/// Reference list of annotation groups and their labels.
///
/// A group with sub-labels contributes `group/label` entries; a group without
/// sub-labels is itself a label. The catalog is immutable once loaded.
#[derive(Debug, Clone)]
pub struct AnnotationCatalog {
    groups: IndexMap<String, Vec<String>>,
    labels: Vec<String>,
    known: HashSet<String>,
}

impl AnnotationCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|err| {
            IndexerError::config(format!(
                "cannot read annotation list {}: {err}",
                path.display()
            ))
        })?;
        let catalog = Self::from_json(&bytes)?;
        log::debug!(
            "{} groups with {} possible annotations are loaded",
            catalog.groups.len(),
            catalog.labels.len()
        );
        Ok(catalog)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let groups: IndexMap<String, Vec<String>> = serde_json::from_slice(bytes)
            .map_err(|err| IndexerError::config(format!("malformed annotation list: {err}")))?;
        Self::from_groups(groups)
    }

    pub fn from_groups(groups: IndexMap<String, Vec<String>>) -> Result<Self> {
        if groups.is_empty() {
            return Err(IndexerError::config(
                "a list of possible annotations can not be empty",
            ));
        }

        let mut labels = Vec::new();
        for (group, annotations) in &groups {
            if annotations.is_empty() {
                labels.push(group.clone());
            } else {
                labels.extend(annotations.iter().map(|label| format!("{group}/{label}")));
            }
        }
        let known = labels.iter().cloned().collect();

        Ok(Self {
            groups,
            labels,
            known,
        })
    }

    /// Every label in catalog order.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.known.contains(label)
    }

    /// Labels from `candidates` that the catalog does not know, in input order.
    #[must_use]
    pub fn unknown<'a>(&self, candidates: &'a [String]) -> Vec<&'a str> {
        candidates
            .iter()
            .filter(|label| !self.contains(label))
            .map(String::as_str)
            .collect()
    }

    #[must_use]
    pub fn groups(&self) -> Vec<AnnotationGroup> {
        self.groups
            .iter()
            .map(|(group, annotations)| AnnotationGroup {
                id: group.clone(),
                annotations: annotations.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn initial_ledger(&self) -> CountLedger {
        CountLedger::zeroed(self.labels.iter().cloned())
    }
}
