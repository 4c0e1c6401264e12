use crate::scanner::{file_name, FilePattern};
use crate::service::Shared;
use crate::store::SignalIndex;
use crate::{IndexerError, Result};
use log::{debug, warn};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

const RECENT_PAIRS_CAP: usize = 64;

/// A filesystem mutation relevant to the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Appeared(PathBuf),
    Vanished(PathBuf),
    /// Both names match the tracked pattern.
    Renamed { from: PathBuf, to: PathBuf },
}

/// Splits a rename into what the store sees: a move across the pattern
/// boundary is an appearance or a disappearance.
#[must_use]
pub fn classify_rename(pattern: &FilePattern, from: &Path, to: &Path) -> Option<FsChange> {
    match (pattern.matches(from), pattern.matches(to)) {
        (true, true) => Some(FsChange::Renamed {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }),
        (false, true) => Some(FsChange::Appeared(to.to_path_buf())),
        (true, false) => Some(FsChange::Vanished(from.to_path_buf())),
        (false, false) => None,
    }
}

pub(crate) enum WatcherCommand {
    Shutdown,
}

#[derive(Debug)]
struct PendingMove {
    tracker: Option<usize>,
    path: PathBuf,
    deadline: Instant,
}

/// Turns raw notify events into [`FsChange`]s.
///
/// Backends report a rename as a `From` half, a `To` half and, when they can
/// pair them, a `Both` event. A `From` is held for `settle`; if no `To` claims
/// it in time the file moved out of the directory and is reported vanished.
pub(crate) struct EventTranslator {
    pattern: FilePattern,
    settle: Duration,
    pending: VecDeque<PendingMove>,
    recent_pairs: VecDeque<usize>,
}

impl EventTranslator {
    pub(crate) fn new(pattern: FilePattern, settle: Duration) -> Self {
        Self {
            pattern,
            settle,
            pending: VecDeque::new(),
            recent_pairs: VecDeque::new(),
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    /// Pending `From` halves whose deadline passed.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<FsChange> {
        let mut out = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            if pending.deadline <= now {
                if self.pattern.matches(&pending.path) {
                    out.push(FsChange::Vanished(pending.path));
                }
            } else {
                kept.push_back(pending);
            }
        }
        self.pending = kept;
        out
    }

    pub(crate) fn translate(&mut self, event: Event, now: Instant) -> Vec<FsChange> {
        let tracker = event.attrs.tracker();
        let mut out = Vec::new();
        match event.kind {
            EventKind::Create(kind) => {
                for path in event.paths {
                    out.extend(self.flush_path(&path));
                    if matches!(kind, CreateKind::Folder) || path.is_dir() {
                        continue;
                    }
                    if self.pattern.matches(&path) {
                        out.push(FsChange::Appeared(path));
                    }
                }
            }
            EventKind::Remove(kind) => {
                for path in event.paths {
                    out.extend(self.flush_path(&path));
                    if matches!(kind, RemoveKind::Folder) {
                        continue;
                    }
                    if self.pattern.matches(&path) {
                        out.push(FsChange::Vanished(path));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => {
                self.translate_rename(mode, tracker, event.paths, now, &mut out);
            }
            _ => {}
        }
        out
    }

    fn translate_rename(
        &mut self,
        mode: RenameMode,
        tracker: Option<usize>,
        paths: Vec<PathBuf>,
        now: Instant,
        out: &mut Vec<FsChange>,
    ) {
        match mode {
            RenameMode::From => {
                for path in paths {
                    out.extend(self.flush_path(&path));
                    self.pending.push_back(PendingMove {
                        tracker,
                        path,
                        deadline: now + self.settle,
                    });
                }
            }
            RenameMode::To => {
                for path in paths {
                    if let Some(from) = self.take_pending(tracker) {
                        if let Some(id) = tracker {
                            self.remember_pair(id);
                        }
                        out.extend(classify_rename(&self.pattern, &from, &path));
                    } else {
                        out.extend(self.flush_path(&path));
                        if self.pattern.matches(&path) && !path.is_dir() {
                            out.push(FsChange::Appeared(path));
                        }
                    }
                }
            }
            RenameMode::Both => {
                if paths.len() < 2 {
                    return;
                }
                if tracker.is_some_and(|id| self.forget_pair(id)) {
                    return;
                }
                self.pending.retain(|p| p.path != paths[0]);
                out.extend(classify_rename(&self.pattern, &paths[0], &paths[1]));
            }
            RenameMode::Any | RenameMode::Other => {
                for path in paths {
                    out.extend(self.flush_path(&path));
                    if !self.pattern.matches(&path) {
                        continue;
                    }
                    if path.is_file() {
                        out.push(FsChange::Appeared(path));
                    } else if !path.exists() {
                        out.push(FsChange::Vanished(path));
                    }
                }
            }
        }
    }

    /// A new event for `path` settles any earlier pending move-out of it first.
    fn flush_path(&mut self, path: &Path) -> Vec<FsChange> {
        let mut out = Vec::new();
        let pattern = &self.pattern;
        self.pending.retain(|pending| {
            if pending.path != path {
                return true;
            }
            if pattern.matches(&pending.path) {
                out.push(FsChange::Vanished(pending.path.clone()));
            }
            false
        });
        out
    }

    fn take_pending(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
        let pos = match tracker {
            Some(id) => self.pending.iter().position(|p| p.tracker == Some(id))?,
            None => {
                let last = self.pending.len().checked_sub(1)?;
                if self.pending[last].tracker.is_some() {
                    return None;
                }
                last
            }
        };
        self.pending.remove(pos).map(|p| p.path)
    }

    fn remember_pair(&mut self, id: usize) {
        if self.recent_pairs.len() == RECENT_PAIRS_CAP {
            self.recent_pairs.pop_front();
        }
        self.recent_pairs.push_back(id);
    }

    fn forget_pair(&mut self, id: usize) -> bool {
        match self.recent_pairs.iter().position(|seen| *seen == id) {
            Some(pos) => {
                self.recent_pairs.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Applies one change under the caller's lock.
pub(crate) async fn apply_change(index: &mut SignalIndex, change: &FsChange) -> Result<()> {
    match change {
        FsChange::Appeared(path) => {
            index.file_appeared(path).await?;
        }
        FsChange::Vanished(path) => {
            let name = name_of(path)?;
            index.file_vanished(&name)?;
        }
        FsChange::Renamed { from, to } => {
            let (from_name, to_name) = (name_of(from)?, name_of(to)?);
            if !index.file_renamed(&from_name, &to_name)? {
                debug!("{from_name} was not indexed, treating {to_name} as new");
                index.file_appeared(to).await?;
            }
        }
    }
    Ok(())
}

fn name_of(path: &Path) -> Result<String> {
    file_name(path).ok_or_else(|| IndexerError::Other(format!("no file name in {}", path.display())))
}

pub(crate) fn create_fs_watcher(
    root: &Path,
    sender: mpsc::Sender<notify::Result<Event>>,
    poll_interval: Duration,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )
    .map_err(|e| IndexerError::Other(format!("watcher init failed: {e}")))?;
    watcher.watch(root, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

pub(crate) fn spawn_watch_loop(
    shared: Arc<Shared>,
    mut translator: EventTranslator,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
    mut command_rx: mpsc::Receiver<WatcherCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next_deadline = translator.next_deadline();

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    match event {
                        Ok(evt) => {
                            let changes = translator.translate(evt, Instant::now());
                            for change in changes {
                                let _ = shared.apply_change(&change).await;
                            }
                        }
                        Err(err) => warn!("Watcher error: {err}"),
                    }
                }
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        WatcherCommand::Shutdown => break,
                    }
                }
                () = async {
                    if let Some(deadline) = next_deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if next_deadline.is_some() => {
                    for change in translator.expire(Instant::now()) {
                        let _ = shared.apply_change(&change).await;
                    }
                }
                else => break,
            }
        }
        debug!("Directory watch loop stopped");
    })
}
