use chrono::Utc;
use lumen_core::model::{FileChangeEvent, FileEventKind};
use lumen_core::paths::{is_test_file, relative_key, IgnoreRules};
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WATCH_ROOTS: &[&str] = &["src", "tests", "crates"];

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create file watcher: {0}")]
    Init(#[source] notify::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecheckSignal {
    pub changes: usize,
    pub test_files_changed: bool,
}

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: usize,
    test_files_changed: bool,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: 0,
            test_files_changed: false,
            deadline: None,
        }
    }

    pub fn observe(&mut self, is_test_file: bool, now: Instant) {
        self.pending += 1;
        self.test_files_changed |= is_test_file;
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn poll(&mut self, now: Instant) -> Option<RecheckSignal> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                let signal = RecheckSignal {
                    changes: self.pending,
                    test_files_changed: self.test_files_changed,
                };
                self.pending = 0;
                self.test_files_changed = false;
                self.deadline = None;
                Some(signal)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub project_root: PathBuf,
    pub roots: Vec<PathBuf>,
    pub ignore: IgnoreRules,
    pub debounce: Duration,
}

fn event_kind(kind: &EventKind) -> Option<FileEventKind> {
    match kind {
        EventKind::Create(_) => Some(FileEventKind::Created),
        EventKind::Remove(_) => Some(FileEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileEventKind::Moved),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FileEventKind::Modified),
        _ => None,
    }
}

pub fn classify(
    event: &notify::Event,
    project_root: &Path,
    ignore: &IgnoreRules,
) -> Vec<FileChangeEvent> {
    let Some(kind) = event_kind(&event.kind) else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .filter(|path| {
            let relative = path.strip_prefix(project_root).unwrap_or(path);
            !ignore.should_ignore(relative)
        })
        .filter(|path| !path.is_dir())
        .map(|path| {
            let key = relative_key(project_root, path);
            FileChangeEvent {
                event_type: kind,
                is_test_file: is_test_file(Path::new(&key)),
                file_path: key,
                timestamp: Utc::now(),
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct WatchStatus {
    pub project_root: PathBuf,
    pub watched: Vec<PathBuf>,
    pub ignored_patterns: usize,
}

pub struct WatchHandle {
    task: tokio::task::JoinHandle<()>,
    status: WatchStatus,
}

impl WatchHandle {
    pub fn status(&self) -> &WatchStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts watching. The returned watcher must be kept alive for events to
/// keep flowing.
pub fn spawn(
    config: WatchConfig,
    signals: mpsc::Sender<RecheckSignal>,
    changes: mpsc::Sender<FileChangeEvent>,
) -> Result<(RecommendedWatcher, WatchHandle), WatchError> {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = event_tx.send(res);
    })
    .map_err(WatchError::Init)?;

    let mut watched = Vec::new();
    for root in &config.roots {
        let path = if root.is_absolute() {
            root.clone()
        } else {
            config.project_root.join(root)
        };
        if !path.is_dir() {
            warn!(event = "watch_root_missing", path = %path.display());
            continue;
        }
        watcher
            .watch(&path, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: path.clone(),
                source,
            })?;
        info!(event = "watch_root", path = %path.display());
        watched.push(path);
    }
    if watched.is_empty() {
        warn!(event = "watch_idle", root = %config.project_root.display(), "no watch roots exist");
    }

    let status = WatchStatus {
        project_root: config.project_root.clone(),
        watched,
        ignored_patterns: config.ignore.pattern_count(),
    };
    let task = tokio::spawn(debounce_loop(config, event_rx, signals, changes));
    Ok((watcher, WatchHandle { task, status }))
}

async fn debounce_loop(
    config: WatchConfig,
    mut events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    signals: mpsc::Sender<RecheckSignal>,
    changes: mpsc::Sender<FileChangeEvent>,
) {
    let mut debouncer = Debouncer::new(config.debounce);
    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            received = events.recv() => {
                let Some(result) = received else {
                    break;
                };
                let event = match result {
                    Ok(event) => event,
                    Err(err) => {
                        error!(event = "watch_error", error = %err);
                        continue;
                    }
                };
                for change in classify(&event, &config.project_root, &config.ignore) {
                    debug!(
                        event = "file_change",
                        kind = change.event_type.as_str(),
                        path = %change.file_path,
                        test = change.is_test_file
                    );
                    debouncer.observe(change.is_test_file, Instant::now());
                    if changes.send(change).await.is_err() {
                        return;
                    }
                }
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                if let Some(signal) = debouncer.poll(Instant::now()) {
                    info!(
                        event = "recheck_signal",
                        changes = signal.changes,
                        test_files = signal.test_files_changed
                    );
                    if signals.send(signal).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn burst_of_changes_yields_one_signal_after_quiet_window() {
        let start = Instant::now();
        let window = Duration::from_millis(1000);
        let mut debouncer = Debouncer::new(window);
        assert_eq!(debouncer.deadline(), None);

        for offset in [0u64, 200, 400, 600] {
            debouncer.observe(offset == 400, start + Duration::from_millis(offset));
            assert_eq!(debouncer.poll(start + Duration::from_millis(offset)), None);
        }
        assert_eq!(debouncer.poll(start + Duration::from_millis(1500)), None);

        let signal = debouncer.poll(start + Duration::from_millis(1600));
        assert_eq!(
            signal,
            Some(RecheckSignal {
                changes: 4,
                test_files_changed: true,
            })
        );
        assert_eq!(debouncer.deadline(), None);
        assert_eq!(debouncer.poll(start + Duration::from_millis(5000)), None);
    }

    #[test]
    fn separated_changes_yield_separate_signals() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        debouncer.observe(false, start);
        let first = debouncer.poll(start + Duration::from_millis(100));
        debouncer.observe(false, start + Duration::from_millis(500));
        let second = debouncer.poll(start + Duration::from_millis(600));
        assert_eq!(first.map(|s| s.changes), Some(1));
        assert_eq!(second.map(|s| s.test_files_changed), Some(false));
    }

    #[test]
    fn classify_filters_ignored_paths_and_metadata_events() {
        let root = PathBuf::from("/repo");
        let ignore = IgnoreRules::default();

        let created = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(root.join("tests/test_api.py"))
            .add_path(root.join("src/__pycache__/api.cpython-311.pyc"));
        let changes = classify(&created, &root, &ignore);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file_path, "tests/test_api.py");
        assert_eq!(changes[0].event_type, FileEventKind::Created);
        assert!(changes[0].is_test_file);

        let modified = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(root.join("src/lib.rs"));
        let changes = classify(&modified, &root, &ignore);
        assert_eq!(changes[0].event_type, FileEventKind::Modified);
        assert!(!changes[0].is_test_file);

        let renamed = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.join("src/a.rs"));
        assert_eq!(classify(&renamed, &root, &ignore)[0].event_type, FileEventKind::Moved);

        let removed = notify::Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(root.join("src/old.rs"));
        assert_eq!(classify(&removed, &root, &ignore)[0].event_type, FileEventKind::Deleted);

        let chmod = notify::Event::new(EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions,
        )))
        .add_path(root.join("src/lib.rs"));
        assert!(classify(&chmod, &root, &ignore).is_empty());

        let access = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(root.join("src/lib.rs"));
        assert!(classify(&access, &root, &ignore).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_roots_are_skipped_and_edits_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonical root");
        std::fs::create_dir_all(root.join("src")).expect("mkdir");

        let (signal_tx, mut signal_rx) = mpsc::channel(4);
        let (change_tx, mut change_rx) = mpsc::channel(64);
        let config = WatchConfig {
            project_root: root.clone(),
            roots: vec![PathBuf::from("src"), PathBuf::from("does-not-exist")],
            ignore: IgnoreRules::default(),
            debounce: Duration::from_millis(150),
        };
        let (_watcher, handle) = spawn(config, signal_tx, change_tx).expect("spawn watcher");
        assert_eq!(handle.status().watched, vec![root.join("src")]);
        assert_eq!(
            handle.status().ignored_patterns,
            IgnoreRules::default().pattern_count()
        );
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(root.join("src").join("lib.rs"), "fn main() {}").expect("write");

        let change = tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
            .await
            .expect("change in time")
            .expect("change");
        assert_eq!(change.file_path, "src/lib.rs");

        let signal = tokio::time::timeout(Duration::from_secs(5), signal_rx.recv())
            .await
            .expect("signal in time")
            .expect("signal");
        assert!(signal.changes >= 1);
        assert!(!signal.test_files_changed);
    }
}
