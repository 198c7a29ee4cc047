pub mod batch_loader;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod folder;
pub mod scheduler;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codec::DecodeMode;
use config::EngineConfig;
use error::EngineError;
use events::{EngineEvent, RowField, RowUpdate};
use scheduler::{Priority, Scheduler};
use store::{FileStat, ThumbnailStore};

pub use cache::PixmapCache;
pub use codec::PixelBuffer;
pub use folder::FolderRow;

const NO_PARENT_MARKER: usize = usize::MAX;

/// Which decode strategy the Engine should use for `request_decode`/the
/// prefetch window: a cheap thumbnail-shaped decode for rapid browsing, or
/// the native-resolution decode a zoomed/high-quality view needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FastView,
    Full,
}

impl Strategy {
    fn mode(self) -> DecodeMode {
        match self {
            Strategy::FastView => DecodeMode::Thumbnail,
            Strategy::Full => DecodeMode::Full,
        }
    }

    fn supports_hq_downscale(self) -> bool {
        matches!(self, Strategy::Full)
    }
}

/// The single public front door for this crate: owns the Folder Model, the
/// Decode Scheduler, the Pixmap Cache and the Thumbnail Store, and exposes
/// a synchronous call surface plus a polled event queue (this crate takes
/// no async runtime dependency; see Design Notes on why decoding is
/// thread-pool based, not cooperative-async based).
pub struct Engine {
    config: EngineConfig,
    scheduler: Arc<Scheduler>,
    store: Arc<ThumbnailStore>,
    cache: Mutex<PixmapCache>,
    folder: Mutex<folder::FolderModel>,
    batch_loader: batch_loader::BatchThumbnailLoader,
    strategy: Mutex<Strategy>,
    current_index: AtomicUsize,
    // Paths the prefetch window has already requested a background decode
    // for and is still waiting on, so `maintain_prefetch_window` (which runs
    // on every `poll_events`) does not re-request — and thereby supersede
    // and discard — its own still-running decode on the next tick.
    pending_prefetch: Mutex<HashSet<PathBuf>>,
    // Folder row path -> the original (pre-downscale) dimensions the batch
    // loader's header probe found for it, so a scheduler result for a path
    // whose only known purpose was a background thumbnail refresh can be
    // routed to `write_back` instead of the regular `image_ready` path,
    // carrying the true resolution rather than the thumbnail's own size.
    thumbnail_refresh_paths: Mutex<HashMap<PathBuf, Option<(u32, u32)>>>,
    // Staged by `open_folder` and drained by the next `poll_events`, so the
    // documented `folder_changed` event fires even when the new root never
    // produces a subsequent filesystem-watcher event.
    pending_folder_changed: Mutex<Option<(PathBuf, Vec<FolderRow>)>>,
}

impl Engine {
    /// Builds a new engine. `thumbnail_db_path` is the single-file database
    /// this engine's Thumbnail Store owns exclusively; see the store's own
    /// precondition about concurrent multi-process writers.
    pub fn new(config: EngineConfig, thumbnail_db_path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = thumbnail_db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| EngineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let store = Arc::new(ThumbnailStore::open(
            thumbnail_db_path,
            config.db_retry_max,
            config.db_retry_base_ms,
        )?);
        let scheduler = Arc::new(Scheduler::new(config.worker_pool_size()));
        let batch_loader = batch_loader::BatchThumbnailLoader::new(
            store.clone(),
            scheduler.clone(),
            config.io_pool_size(),
        );
        let cache = Mutex::new(PixmapCache::new(config.cache_cap_entries, config.cache_cap_bytes));

        Ok(Engine {
            config,
            scheduler,
            store,
            cache,
            folder: Mutex::new(folder::FolderModel::new()),
            batch_loader,
            strategy: Mutex::new(Strategy::FastView),
            current_index: AtomicUsize::new(NO_PARENT_MARKER),
            pending_prefetch: Mutex::new(HashSet::new()),
            thumbnail_refresh_paths: Mutex::new(HashMap::new()),
            pending_folder_changed: Mutex::new(None),
        })
    }

    /// Sets the active folder, cancelling outstanding work for the
    /// previous one, and schedules a thumbnail probe for the new snapshot.
    /// Stages a `FolderChanged` event for the next `poll_events` call, so it
    /// is observed even if the new root produces no subsequent watcher event.
    pub fn open_folder(&self, path: PathBuf) -> Result<bool, EngineError> {
        let mut folder = self.folder.lock().expect("folder lock poisoned");
        let previous_rows = folder
            .set_root(path.clone())
            .map_err(|source| EngineError::Io {
                path: folder.root().map(Path::to_path_buf).unwrap_or_default(),
                source,
            })?;

        // Cancel discards any in-flight decode's result via the scheduler's
        // id check; `ignore` is not used here because it has no matching
        // `unignore` on this path and `open_folder` is documented as
        // "creates/updates" the root, so re-opening the same folder (or
        // navigating back to one already visited) must not find its images
        // permanently poisoned in the ignore set.
        {
            let mut pending = self
                .pending_prefetch
                .lock()
                .expect("pending_prefetch lock poisoned");
            for row in &previous_rows {
                self.scheduler.cancel(&row.path);
                // A cancelled result never reaches `handle_decoded` (the
                // worker drops it silently once it's no longer current), so
                // its `pending_prefetch` entry would otherwise never clear.
                pending.remove(&row.path);
            }
        }
        self.current_index.store(NO_PARENT_MARKER, Ordering::SeqCst);

        // Any job already queued or running on the loader's worker thread
        // belonged to the retired folder; stop it from submitting further
        // decodes or emitting further chunks before handing it the new one.
        self.batch_loader.cancel();

        let rows = folder.rows().to_vec();
        drop(folder);

        *self
            .pending_folder_changed
            .lock()
            .expect("pending_folder_changed lock poisoned") = Some((path, rows.clone()));

        self.batch_loader.submit(rows, self.config.thumb_box());
        Ok(true)
    }

    /// Requests a decode for `path` under the active strategy, at
    /// foreground priority.
    pub fn request_decode(&self, path: PathBuf, target: Option<(u32, u32)>) -> u64 {
        if let Some(index) = self
            .folder
            .lock()
            .expect("folder lock poisoned")
            .resolve_index(&path)
        {
            self.current_index.store(index, Ordering::SeqCst);
        }
        let strategy = *self.strategy.lock().expect("strategy lock poisoned");
        let target = if strategy.supports_hq_downscale() {
            None
        } else {
            target.or(Some(self.config.thumb_box()))
        };
        self.scheduler
            .request(path, target, strategy.mode(), Priority::Foreground)
    }

    /// Requests background decodes for `paths`, for prefetching around the
    /// current view.
    pub fn prefetch(&self, paths: &[PathBuf], target: Option<(u32, u32)>) {
        let strategy = *self.strategy.lock().expect("strategy lock poisoned");
        for path in paths {
            self.scheduler.request(
                path.clone(),
                target.or(Some(self.config.thumb_box())),
                strategy.mode(),
                Priority::Background,
            );
        }
    }

    pub fn get_cached(&self, path: &Path) -> Option<Arc<PixelBuffer>> {
        self.cache.lock().expect("cache lock poisoned").get(path)
    }

    pub fn remove_from_cache(&self, path: &Path) {
        self.cache.lock().expect("cache lock poisoned").remove(path);
    }

    /// Switches strategy and bumps the cache generation so previously
    /// cached buffers under the old strategy become invisible.
    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.lock().expect("strategy lock poisoned") = strategy;
        self.cache.lock().expect("cache lock poisoned").bump_generation();
    }

    pub fn ignore_path(&self, path: PathBuf) {
        self.scheduler.ignore(path);
    }

    pub fn unignore_path(&self, path: &Path) {
        self.scheduler.unignore(path);
    }

    pub fn cancel(&self, path: &Path) {
        self.scheduler.cancel(path);
    }

    /// Drains every pending source of activity (decode completions, folder
    /// watcher events, batch thumbnail chunks) and returns the resulting
    /// events in emission order. The embedding application calls this from
    /// its own UI-thread idle tick; the core imposes no event-loop model of
    /// its own.
    pub fn poll_events(&self) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        if let Some((root, rows)) = self
            .pending_folder_changed
            .lock()
            .expect("pending_folder_changed lock poisoned")
            .take()
        {
            events.push(EngineEvent::FolderChanged {
                root,
                rows: Arc::new(rows),
            });
        }

        if let Some(change) = self
            .folder
            .lock()
            .expect("folder lock poisoned")
            .poll_filesystem_changes()
        {
            for path in &change.departed {
                self.scheduler.ignore(path.clone());
                self.cache.lock().expect("cache lock poisoned").remove(path);
            }
            self.batch_loader
                .submit(change.rows.clone(), self.config.thumb_box());
            let root = self
                .folder
                .lock()
                .expect("folder lock poisoned")
                .root()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            events.push(EngineEvent::FolderChanged {
                root,
                rows: Arc::new(change.rows),
            });
        }

        for decoded in self.scheduler.poll_results() {
            events.extend(self.handle_decoded(decoded));
        }

        for chunk in self.batch_loader.poll_chunks() {
            events.push(self.translate_chunk(chunk));
        }

        for metric in self.store.poll_metrics() {
            events.push(EngineEvent::Metrics(metric));
        }

        self.maintain_prefetch_window();
        events
    }

    fn handle_decoded(&self, decoded: scheduler::DecodedEvent) -> Vec<EngineEvent> {
        self.pending_prefetch
            .lock()
            .expect("pending_prefetch lock poisoned")
            .remove(&decoded.path);
        match decoded.result {
            Ok(buffer) => {
                self.cache
                    .lock()
                    .expect("cache lock poisoned")
                    .put(decoded.path.clone(), buffer.clone());

                let mut out = vec![EngineEvent::ImageReady {
                    path: decoded.path.clone(),
                    buffer: Some(buffer.clone()),
                    error: None,
                }];

                if self.is_pending_thumbnail_refresh(&decoded.path) {
                    self.complete_thumbnail_refresh(&decoded.path, &buffer, &mut out);
                }
                out
            }
            Err(error) => vec![EngineEvent::ImageReady {
                path: decoded.path,
                buffer: None,
                error: Some(Arc::new(error)),
            }],
        }
    }

    fn is_pending_thumbnail_refresh(&self, path: &Path) -> bool {
        self.thumbnail_refresh_paths
            .lock()
            .expect("thumbnail_refresh_paths lock poisoned")
            .contains_key(path)
    }

    fn complete_thumbnail_refresh(
        &self,
        path: &Path,
        buffer: &PixelBuffer,
        out: &mut Vec<EngineEvent>,
    ) {
        // The batch loader already header-probed this path's true resolution
        // when it reported the miss (batch_loader.rs's `ThumbRow::Miss`);
        // `buffer` here is the downscaled thumbnail decode, not the source
        // image, so its own dimensions must never be written into the
        // `orig_w`/`orig_h` columns. Fall back to the buffer's size only if
        // the probe itself failed to produce anything better.
        let probed_orig_dims = self
            .thumbnail_refresh_paths
            .lock()
            .expect("thumbnail_refresh_paths lock poisoned")
            .remove(path)
            .flatten();
        let orig_dims = probed_orig_dims.unwrap_or_else(|| (buffer.width(), buffer.height()));

        let Ok(metadata) = std::fs::metadata(path) else {
            return;
        };
        let stat = FileStat {
            mtime: mtime_secs(&metadata),
            size: metadata.len() as i64,
        };
        // The thumbnail database typically lives inside the watched folder
        // itself (see store.rs's one-file-per-folder precondition); suppress
        // the watcher around this write so it isn't mistaken for an external
        // change and doesn't trigger a redundant rescan.
        let _suppress = self.folder.lock().expect("folder lock poisoned").suppress();
        match batch_loader::write_back(&self.store, path, stat, orig_dims, buffer) {
            Ok(png_bytes) => {
                if let Some(index) = self
                    .folder
                    .lock()
                    .expect("folder lock poisoned")
                    .resolve_index(path)
                {
                    out.push(EngineEvent::RowsUpdated {
                        updates: vec![RowUpdate {
                            index,
                            field: RowField::Thumbnail {
                                png_bytes: Arc::new(png_bytes),
                            },
                        }],
                    });
                }
            }
            Err(error) => {
                log::warn!("failed to write back thumbnail for {}: {error}", path.display());
            }
        }
    }

    fn translate_chunk(&self, chunk: batch_loader::Chunk) -> EngineEvent {
        let folder = self.folder.lock().expect("folder lock poisoned");
        let mut updates = Vec::with_capacity(chunk.len());
        for row in chunk {
            match row {
                batch_loader::ThumbRow::Hit { path, png_bytes, orig_dims } => {
                    if let Some(index) = folder.resolve_index(&path) {
                        updates.push(RowUpdate {
                            index,
                            field: RowField::Resolution {
                                width: orig_dims.0,
                                height: orig_dims.1,
                            },
                        });
                        updates.push(RowUpdate {
                            index,
                            field: RowField::Thumbnail { png_bytes },
                        });
                    }
                }
                batch_loader::ThumbRow::Miss { path, orig_dims } => {
                    self.thumbnail_refresh_paths
                        .lock()
                        .expect("thumbnail_refresh_paths lock poisoned")
                        .insert(path.clone(), orig_dims);
                    if let Some(index) = folder.resolve_index(&path) {
                        if let Some((width, height)) = orig_dims {
                            updates.push(RowUpdate {
                                index,
                                field: RowField::Resolution { width, height },
                            });
                        }
                        updates.push(RowUpdate {
                            index,
                            field: RowField::ThumbnailMissing,
                        });
                    }
                }
            }
        }
        EngineEvent::RowsUpdated { updates }
    }

    /// Computes the sliding prefetch window around the current row and
    /// requests background decodes for any neighbor that is neither already
    /// cached nor already in flight from an earlier call. Without the
    /// in-flight check, a poll cadence faster than a neighbor's decode time
    /// would re-request it every tick; each re-request assigns a newer
    /// scheduler id and therefore supersedes and discards the still-running
    /// decode's result (per the scheduler's newest-id-wins rule), so slow
    /// neighbors would never actually finish prefetching.
    fn maintain_prefetch_window(&self) {
        let current = self.current_index.load(Ordering::SeqCst);
        if current == NO_PARENT_MARKER {
            return;
        }
        let folder = self.folder.lock().expect("folder lock poisoned");
        let back = self.config.prefetch_back;
        let ahead = self.config.prefetch_ahead;
        let start = current.saturating_sub(back);
        let end = (current + ahead).min(folder.row_count().saturating_sub(1));

        let mut pending = self
            .pending_prefetch
            .lock()
            .expect("pending_prefetch lock poisoned");
        let mut to_prefetch = Vec::new();
        for index in start..=end {
            if index == current {
                continue;
            }
            if let Some(row) = folder.row_at(index) {
                if pending.contains(&row.path) {
                    continue;
                }
                if self.get_cached(&row.path).is_none() {
                    pending.insert(row.path.clone());
                    to_prefetch.push(row.path.clone());
                }
            }
        }
        drop(pending);
        drop(folder);
        if !to_prefetch.is_empty() {
            self.prefetch(&to_prefetch, None);
        }
    }

    /// Runs the thumbnail store's housekeeping pass: deletes records older
    /// than `config.db_vacuum_days` and reclaims the freed space. Not run
    /// automatically; the embedding application calls this on whatever
    /// cadence it considers appropriate (e.g. once per startup).
    pub fn run_maintenance(&self) -> Result<(), EngineError> {
        let removed = self.store.cleanup_older_than(self.config.db_vacuum_days)?;
        if removed > 0 {
            log::info!("maintenance pass removed {removed} stale thumbnail rows");
        }
        self.store.vacuum()?;
        Ok(())
    }

    /// Initiates an orderly stop: waits up to `deadline` for in-flight
    /// decode workers to finish.
    pub fn shutdown(&self, deadline: Duration) {
        self.scheduler.shutdown(deadline);
    }
}

fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
