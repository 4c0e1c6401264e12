use serde::{Deserialize, Serialize};

/// Catalog group as shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnotationGroup {
    pub id: String,
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommonAnnotations {
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSummary {
    pub id: String,
    /// `DD.MM.YYYY HH:MM:SS`
    pub timestamp: String,
    #[serde(rename = "isAnnotated")]
    pub is_annotated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordDetail {
    pub id: String,
    pub signal: Vec<Vec<f64>>,
    pub frequency: f64,
    pub units: Vec<String>,
    pub signame: Vec<String>,
    pub annotation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemDataRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetAnnotationRequest {
    pub id: String,
    #[serde(default)]
    pub annotation: Vec<String>,
}

/// Result of an archive run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DumpReport {
    pub moved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}
