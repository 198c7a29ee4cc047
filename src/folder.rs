use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use walkdir::WalkDir;

const SUPPORTED_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif", "webp"];

/// One row of a folder snapshot. `resolution` and `thumb` start `None` and
/// are filled in later by `RowsUpdated` events once the batch thumbnail
/// probe (see `crate::batch_loader`) completes.
#[derive(Debug, Clone)]
pub struct FolderRow {
    pub path: PathBuf,
    pub name: String,
    pub size: i64,
    pub mtime: i64,
    pub resolution: Option<(u32, u32)>,
    pub thumb: Option<std::sync::Arc<Vec<u8>>>,
}

/// The result of a reactive rescan: the fresh snapshot, plus any paths that
/// were present in the previous snapshot but dropped out of this one (the
/// caller must route these through the scheduler's `ignore` and the pixmap
/// cache's `remove`).
#[derive(Debug, Clone)]
pub struct FolderChange {
    pub rows: Vec<FolderRow>,
    pub departed: Vec<PathBuf>,
}

/// A raw filesystem change, already translated from `notify`'s event kinds
/// into the small domain vocabulary this model cares about.
#[derive(Debug, Clone)]
enum WatchEvent {
    Changed,
    WatcherError,
}

/// RAII guard that suppresses the model's own writes (if any land under the
/// watched root) from being mistaken for an external change. Held for the
/// duration of an operation the model itself performs against the watched
/// directory.
pub struct SuppressionGuard {
    suppressor: Arc<AtomicBool>,
}

impl SuppressionGuard {
    fn new(suppressor: Arc<AtomicBool>) -> Self {
        suppressor.store(true, Ordering::SeqCst);
        SuppressionGuard { suppressor }
    }
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.suppressor.store(false, Ordering::SeqCst);
    }
}

/// Enumerates and watches a single directory, exposing a stably-ordered,
/// row-oriented view of its image files.
pub struct FolderModel {
    root: Option<PathBuf>,
    rows: Vec<FolderRow>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    suppressor: Arc<AtomicBool>,
    event_rx: Mutex<Option<mpsc::Receiver<WatchEvent>>>,
}

impl FolderModel {
    pub fn new() -> Self {
        FolderModel {
            root: None,
            rows: Vec::new(),
            watcher: Mutex::new(None),
            suppressor: Arc::new(AtomicBool::new(false)),
            event_rx: Mutex::new(None),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn rows(&self) -> &[FolderRow] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_at(&self, index: usize) -> Option<&FolderRow> {
        self.rows.get(index)
    }

    pub fn resolve_index(&self, path: &Path) -> Option<usize> {
        self.rows.iter().position(|row| row.path == path)
    }

    /// Scans `root`, publishes a fresh, stably-sorted snapshot, and (re)starts
    /// the filesystem watcher on the new directory. Returns the previous
    /// root's rows so the caller can retire any outstanding work for them.
    pub fn set_root(&mut self, root: PathBuf) -> Result<Vec<FolderRow>, std::io::Error> {
        let previous_rows = std::mem::take(&mut self.rows);
        self.stop_watching();

        self.rows = scan_directory(&root)?;
        self.root = Some(root.clone());
        self.start_watching(&root);
        Ok(previous_rows)
    }

    /// Drains pending filesystem events; if any arrived, rescans and returns
    /// the fresh snapshot along with any paths that left the folder since the
    /// previous snapshot. Coalesces a burst of events into a single rescan.
    pub fn poll_filesystem_changes(&mut self) -> Option<FolderChange> {
        let mut saw_change = false;
        {
            let guard = self.event_rx.lock().expect("event_rx lock poisoned");
            if let Some(rx) = guard.as_ref() {
                while let Ok(event) = rx.try_recv() {
                    match event {
                        WatchEvent::Changed => saw_change = true,
                        WatchEvent::WatcherError => {
                            log::warn!("folder watcher reported an error; will rescan to recover")
                        }
                    }
                }
            }
        }
        if !saw_change {
            return None;
        }
        let root = self.root.clone()?;
        match scan_directory(&root) {
            Ok(rows) => {
                let new_paths: std::collections::HashSet<&Path> =
                    rows.iter().map(|row| row.path.as_path()).collect();
                let departed: Vec<PathBuf> = self
                    .rows
                    .iter()
                    .filter(|row| !new_paths.contains(row.path.as_path()))
                    .map(|row| row.path.clone())
                    .collect();
                self.rows = rows.clone();
                Some(FolderChange { rows, departed })
            }
            Err(error) => {
                log::warn!("rescan of {} failed: {error}", root.display());
                None
            }
        }
    }

    /// Suppresses the watcher for the duration of the returned guard, for
    /// callers that are about to perform a write under the watched root
    /// themselves and don't want it to trigger a redundant rescan.
    pub fn suppress(&self) -> SuppressionGuard {
        SuppressionGuard::new(self.suppressor.clone())
    }

    fn start_watching(&self, root: &Path) {
        let (event_tx, event_rx) = mpsc::channel();
        let suppressor = self.suppressor.clone();

        let mut watcher = match RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) if is_relevant(&event) => {
                    if suppressor.load(Ordering::SeqCst) {
                        return;
                    }
                    let _ = event_tx.send(WatchEvent::Changed);
                }
                Ok(_) => {}
                Err(error) => {
                    log::warn!("folder watcher error: {error}");
                    let _ = event_tx.send(WatchEvent::WatcherError);
                }
            },
            Config::default(),
        ) {
            Ok(watcher) => watcher,
            Err(error) => {
                log::warn!("failed to create folder watcher for {}: {error}", root.display());
                return;
            }
        };

        if let Err(error) = watcher.watch(root, RecursiveMode::NonRecursive) {
            log::warn!("failed to watch {}: {error}", root.display());
            return;
        }

        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);
        *self.event_rx.lock().expect("event_rx lock poisoned") = Some(event_rx);
    }

    fn stop_watching(&self) {
        *self.watcher.lock().expect("watcher lock poisoned") = None;
        *self.event_rx.lock().expect("event_rx lock poisoned") = None;
    }
}

impl Default for FolderModel {
    fn default() -> Self {
        Self::new()
    }
}

fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
    )
}

fn scan_directory(root: &Path) -> Result<Vec<FolderRow>, std::io::Error> {
    let mut rows = Vec::new();
    for entry in WalkDir::new(root)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|value| value.to_str()) else {
            continue;
        };
        if !SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            continue;
        }
        let metadata = entry.metadata()?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        rows.push(FolderRow {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            size: metadata.len() as i64,
            mtime,
            resolution: None,
            thumb: None,
        });
    }
    rows.sort_by(|a, b| natural_compare(&a.name, &b.name));
    Ok(rows)
}

/// Case-insensitive natural-order filename comparator: runs of digits compare
/// by numeric value rather than lexicographically, so `img2.png` sorts before
/// `img10.png`.
fn natural_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        let (Some(&ac), Some(&bc)) = (a.peek(), b.peek()) else {
            return a.peek().is_some().cmp(&b.peek().is_some());
        };
        if ac.is_ascii_digit() && bc.is_ascii_digit() {
            let a_num = take_digits(&mut a);
            let b_num = take_digits(&mut b);
            let order = a_num
                .len()
                .cmp(&b_num.len())
                .then_with(|| a_num.cmp(&b_num));
            if order != std::cmp::Ordering::Equal {
                return order;
            }
            continue;
        }
        let order = ac.to_ascii_lowercase().cmp(&bc.to_ascii_lowercase());
        if order != std::cmp::Ordering::Equal {
            return order;
        }
        a.next();
        b.next();
    }
}

/// Consumes and returns a leading run of ASCII digits, stripped of leading
/// zeros so runs of differing width still compare by numeric value.
fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut digits = String::new();
    while let Some(&c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() && !digits.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    fn write_file(dir: &Path, name: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(b"fake-bytes").unwrap();
    }

    #[test]
    fn scan_is_case_insensitive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "Banana.jpg");
        write_file(dir.path(), "apple.png");
        write_file(dir.path(), "cherry.gif");
        write_file(dir.path(), "notes.txt");

        let rows = scan_directory(dir.path()).unwrap();
        let names: Vec<_> = rows.iter().map(|row| row.name.clone()).collect();
        assert_eq!(names, vec!["apple.png", "Banana.jpg", "cherry.gif"]);
    }

    #[test]
    fn sort_is_natural_order_not_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "img10.png");
        write_file(dir.path(), "img2.png");
        write_file(dir.path(), "img1.png");

        let rows = scan_directory(dir.path()).unwrap();
        let names: Vec<_> = rows.iter().map(|row| row.name.clone()).collect();
        assert_eq!(names, vec!["img1.png", "img2.png", "img10.png"]);
    }

    #[test]
    fn empty_folder_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let rows = scan_directory(dir.path()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn set_root_starts_watching_and_detects_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = FolderModel::new();
        model.set_root(dir.path().to_path_buf()).unwrap();
        assert_eq!(model.row_count(), 0);

        write_file(dir.path(), "fresh.png");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut observed = None;
        while std::time::Instant::now() < deadline {
            if let Some(change) = model.poll_filesystem_changes() {
                observed = Some(change);
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let change = observed.expect("watcher should observe the new file");
        assert_eq!(change.rows.len(), 1);
        assert_eq!(change.rows[0].name, "fresh.png");
        assert!(change.departed.is_empty());
    }

    #[test]
    fn deleted_file_is_reported_as_departed() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "going-away.png");
        let mut model = FolderModel::new();
        model.set_root(dir.path().to_path_buf()).unwrap();
        assert_eq!(model.row_count(), 1);
        let departed_path = model.row_at(0).unwrap().path.clone();

        std::fs::remove_file(&departed_path).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut observed = None;
        while std::time::Instant::now() < deadline {
            if let Some(change) = model.poll_filesystem_changes() {
                observed = Some(change);
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let change = observed.expect("watcher should observe the deletion");
        assert!(change.rows.is_empty());
        assert_eq!(change.departed, vec![departed_path]);
    }

    #[test]
    fn suppression_guard_is_reentrant_safe_around_writes() {
        let model = FolderModel::new();
        {
            let _guard = model.suppress();
            assert!(model.suppressor.load(Ordering::SeqCst));
        }
        assert!(!model.suppressor.load(Ordering::SeqCst));
    }
}
