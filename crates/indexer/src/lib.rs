//! # Signal Indexer
//!
//! Watched-directory index of signal records awaiting annotation.
//!
//! ## Pipeline
//!
//! ```text
//! Watch directory
//!     │
//!     ├──> Watcher bridge (notify, rename pairing)
//!     │      └─> Appeared / Vanished / Renamed
//!     │
//!     ├──> Record store (dedup by content hash)
//!     │      └─> Count ledger + submission table
//!     │
//!     └──> Dump (tar.gz of annotated records)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use signal_indexer::{AnnotationService, IndexPaths, JsonSignalLoader, ServiceConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let paths = IndexPaths {
//!         watch_dir: "/data/incoming".into(),
//!         dump_dir: "/data/dumps".into(),
//!         annotation_count_path: "/data/annotation_count.json".into(),
//!         submitted_annotation_path: "/data/submitted.json".into(),
//!     };
//!     let config = ServiceConfig::new(paths, "/data/annotations.json");
//!     let service = AnnotationService::open(config, Arc::new(JsonSignalLoader)).await?;
//!
//!     println!("{} signals indexed", service.record_list().await.len());
//!     service.close().await;
//!     Ok(())
//! }
//! ```

mod archive;
mod catalog;
mod error;
mod ledger;
mod loader;
mod scanner;
mod service;
mod store;
mod submissions;
mod watcher;

#[cfg(test)]
mod test_support;

pub use catalog::AnnotationCatalog;
pub use error::{IndexerError, Result};
pub use ledger::CountLedger;
pub use loader::{resolve, JsonSignalLoader, LoadedRecord, RecordLoader, RetryPolicy, SignalMeta};
pub use scanner::{file_name, FilePattern, FileScanner, DEFAULT_FILE_PATTERN};
pub use service::{AnnotationService, ServiceConfig};
pub use store::{
    CommonAnnotationPolicy, IndexPaths, IndexSettings, Reconciled, ServiceEvent, SignalIndex,
    SignalRecord, Vanished,
};
pub use submissions::SubmissionTable;
pub use watcher::{classify_rename, FsChange};
