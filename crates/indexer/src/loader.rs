use crate::{IndexerError, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::time::{Duration, SystemTime};

const HASH_BLOCK_SIZE: usize = 1 << 16;

/// Metadata decoded alongside a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMeta {
    pub timestamp: NaiveDateTime,
    pub frequency: f64,
    pub units: Vec<String>,
    pub signame: Vec<String>,
}

/// Output of a [`RecordLoader`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRecord {
    pub content_hash: String,
    pub modified: SystemTime,
    pub signal: Vec<Vec<f64>>,
    pub meta: SignalMeta,
}

/// Decodes one record file.
///
/// Implementations return [`IndexerError::TransientLoad`] when the file may
/// still be being written, so the caller can retry.
pub trait RecordLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Loads `path`, retrying transient failures with a fixed delay.
pub async fn resolve(
    loader: &dyn RecordLoader,
    path: &Path,
    policy: RetryPolicy,
) -> Result<LoadedRecord> {
    log::debug!("Loading the file from {}", path.display());
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match loader.load(path) {
            Ok(record) => {
                log::debug!("Loading finished");
                return Ok(record);
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                log::debug!(
                    "Loading failed ({err}), retrying after {}ms",
                    policy.delay.as_millis()
                );
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignalFile {
    timestamp: NaiveDateTime,
    frequency: f64,
    units: Vec<String>,
    signame: Vec<String>,
    signal: Vec<Vec<f64>>,
}

/// Loader for JSON signal files. Every channel is converted to millivolts.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSignalLoader;

impl RecordLoader for JsonSignalLoader {
    fn load(&self, path: &Path) -> Result<LoadedRecord> {
        let (bytes, content_hash, modified) = match read_hashed(path) {
            Ok(pair) => pair,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexerError::load(path, "file no longer exists"))
            }
            Err(err) => return Err(IndexerError::transient(path, err.to_string())),
        };

        let file: SignalFile = serde_json::from_slice(&bytes)
            .map_err(|err| IndexerError::transient(path, format!("malformed record: {err}")))?;
        if file.units.len() != file.signal.len() {
            return Err(IndexerError::load(
                path,
                format!(
                    "{} channels but {} units",
                    file.signal.len(),
                    file.units.len()
                ),
            ));
        }

        let mut signal = file.signal;
        let mut units = Vec::with_capacity(file.units.len());
        for (channel, unit) in signal.iter_mut().zip(&file.units) {
            let multiplier = millivolt_multiplier(unit)
                .ok_or_else(|| IndexerError::load(path, format!("unsupported units {unit}")))?;
            if multiplier != 1.0 {
                channel.iter_mut().for_each(|sample| *sample *= multiplier);
            }
            units.push("mV".to_string());
        }

        Ok(LoadedRecord {
            content_hash,
            modified,
            signal,
            meta: SignalMeta {
                timestamp: file.timestamp,
                frequency: file.frequency,
                units,
                signame: file.signame,
            },
        })
    }
}

/// Reads the file in fixed-size blocks, hashing as it goes. Returns the
/// bytes, their hex SHA-256 and the modification time.
fn read_hashed(path: &Path) -> std::io::Result<(Vec<u8>, String, SystemTime)> {
    let mut file = std::fs::File::open(path)?;
    let modified = file.metadata()?.modified()?;
    let mut hasher = Sha256::new();
    let mut bytes = Vec::new();
    let mut block = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
        bytes.extend_from_slice(&block[..n]);
    }
    Ok((bytes, format!("{:x}", hasher.finalize()), modified))
}

fn millivolt_multiplier(unit: &str) -> Option<f64> {
    match unit.trim() {
        "V" | "v" => Some(1_000.0),
        "mV" | "mv" => Some(1.0),
        "uV" | "uv" | "µV" | "μV" => Some(0.001),
        _ => None,
    }
}
