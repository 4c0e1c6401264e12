use crate::{IndexerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Submitted annotations keyed by record file name.
///
/// Stored as a split-orientation table: one column per catalog label, one row
/// per annotated file, cells are 0 or 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionTable {
    pub columns: Vec<String>,
    pub index: Vec<String>,
    pub data: Vec<Vec<u8>>,
}

impl SubmissionTable {
    /// One-hot encodes `rows` against `columns`.
    pub fn encode<'a>(
        columns: Vec<String>,
        rows: impl IntoIterator<Item = (&'a str, &'a [String])>,
    ) -> Self {
        let mut index = Vec::new();
        let mut data = Vec::new();
        for (file_name, labels) in rows {
            index.push(file_name.to_string());
            data.push(
                columns
                    .iter()
                    .map(|column| u8::from(labels.contains(column)))
                    .collect(),
            );
        }
        Self {
            columns,
            index,
            data,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.index.len() != self.data.len() {
            return Err(IndexerError::config(format!(
                "submission table has {} index entries but {} rows",
                self.index.len(),
                self.data.len()
            )));
        }
        for (row, values) in self.index.iter().zip(&self.data) {
            if values.len() != self.columns.len() {
                return Err(IndexerError::config(format!(
                    "submission row {row} has {} values, expected {}",
                    values.len(),
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }

    /// Per-column sums, including columns the current catalog may not know.
    pub fn column_sums(&self) -> Vec<(&str, u64)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(col, label)| {
                let sum = self
                    .data
                    .iter()
                    .map(|row| u64::from(row.get(col).copied().unwrap_or(0) != 0))
                    .sum();
                (label.as_str(), sum)
            })
            .collect()
    }

    /// Labels set for `file_name`, in column order.
    #[must_use]
    pub fn row(&self, file_name: &str) -> Option<Vec<String>> {
        let pos = self.index.iter().position(|name| name == file_name)?;
        let values = self.data.get(pos)?;
        Some(
            self.columns
                .iter()
                .zip(values)
                .filter(|(_, value)| **value != 0)
                .map(|(label, _)| label.clone())
                .collect(),
        )
    }

    pub fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let table: Self = serde_json::from_slice(&bytes)?;
        table.validate()?;
        Ok(Some(table))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
