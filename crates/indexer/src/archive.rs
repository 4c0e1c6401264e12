use crate::store::SignalIndex;
use crate::{IndexerError, Result};
use chrono::{DateTime, Local};
use flate2::{write::GzEncoder, Compression};
use signal_protocol::DumpReport;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const STAGING_NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const ARCHIVE_EXTENSION: &str = "tar.gz";

impl SignalIndex {
    /// Moves every annotated record and the submission table into a
    /// timestamped archive under the dump directory, then persists the ledger.
    ///
    /// Not transactional: a failure after files started moving leaves them in
    /// the staging directory. Records whose files were moved are still pruned.
    pub async fn dump(&mut self) -> Result<DumpReport> {
        let annotated: Vec<(String, String)> = self
            .records
            .values()
            .filter(|r| r.is_annotated())
            .map(|r| (r.content_hash.clone(), r.file_name.clone()))
            .collect();
        if annotated.is_empty() {
            log::info!("No annotated signals to dump");
            return Ok(DumpReport::default());
        }

        let mut names: Vec<&str> = annotated.iter().map(|(_, name)| name.as_str()).collect();
        names.sort_unstable();
        log::info!("Dumping the following signals: {}", names.join(", "));

        fs::create_dir_all(&self.paths.dump_dir)?;
        let staging = unique_staging_dir(&self.paths.dump_dir, Local::now());
        fs::create_dir(&staging)?;

        self.stage_submission_table(&staging)?;

        let mut moved = 0usize;
        for (hash, name) in &annotated {
            self.dumped.insert(name.clone());
            let outcome = move_file(&self.paths.watch_dir.join(name), &staging.join(name));
            if let Err(err) = outcome {
                log::error!(
                    "Dump interrupted after {moved} files, staging left at {}",
                    staging.display()
                );
                self.dumped.remove(name);
                self.log_records();
                self.publish_record_list();
                return Err(err.into());
            }
            self.records.shift_remove(hash);
            moved += 1;
        }

        let archive = archive_path_for(&staging);
        let (src, dst) = (staging.clone(), archive.clone());
        tokio::task::spawn_blocking(move || compress_dir(&src, &dst))
            .await
            .map_err(|err| IndexerError::Other(format!("join archive task: {err}")))??;
        remove_dir_force(&staging);

        self.ledger.persist(&self.paths.annotation_count_path)?;

        log::info!("Dump finished into {}", archive.display());
        self.log_records();
        self.publish_record_list();
        Ok(DumpReport {
            moved,
            archive: Some(archive.display().to_string()),
        })
    }

    fn stage_submission_table(&self, staging: &Path) -> Result<()> {
        let source = &self.paths.submitted_annotation_path;
        let Some(table_name) = source.file_name() else {
            return Err(IndexerError::config(format!(
                "submitted annotation path {} has no file name",
                source.display()
            )));
        };
        let target = staging.join(table_name);
        match move_file(source, &target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::warn!(
                    "{} is missing, archiving a freshly encoded table",
                    source.display()
                );
                self.submission_table().write(&target)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn unique_staging_dir(dump_dir: &Path, now: DateTime<Local>) -> PathBuf {
    let base = now.format(STAGING_NAME_FORMAT).to_string();
    let mut candidate = dump_dir.join(&base);
    let mut suffix = 1u32;
    while candidate.exists() || archive_path_for(&candidate).exists() {
        candidate = dump_dir.join(format!("{base}-{suffix}"));
        suffix += 1;
    }
    candidate
}

fn archive_path_for(staging: &Path) -> PathBuf {
    let mut name = staging.as_os_str().to_owned();
    name.push(".");
    name.push(ARCHIVE_EXTENSION);
    PathBuf::from(name)
}

/// `rename`, falling back to copy + remove across filesystems.
fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(err),
        Err(rename_err) => {
            fs::copy(src, dst).map_err(|_| rename_err)?;
            fs::remove_file(src)
        }
    }
}

/// Gzip-compressed tar of the staging directory's files, flat, sorted by name.
fn compress_dir(root: &Path, archive: &Path) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    let file = fs::File::create(archive)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for path in &entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        builder.append_path_with_name(path, name)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Best-effort recursive delete. Read-only entries are made writable and the
/// delete is retried once.
fn remove_dir_force(path: &Path) {
    let Err(err) = fs::remove_dir_all(path) else {
        return;
    };
    if err.kind() != ErrorKind::PermissionDenied {
        log::warn!("Failed to remove staging dir {}: {err}", path.display());
        return;
    }
    for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let mut perms = meta.permissions();
        if perms.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            let _ = fs::set_permissions(entry.path(), perms);
        }
    }
    if let Err(err) = fs::remove_dir_all(path) {
        log::warn!("Failed to remove staging dir {}: {err}", path.display());
    }
}
