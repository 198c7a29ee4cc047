use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::codec::{self, DecodeMode, PixelBuffer};
use crate::error::{DecodeError, SchedulerError};

/// Relative urgency of a decode request. Foreground work is drained ahead of
/// background (prefetch) work; a worker never interrupts a job already
/// running to service a higher-priority one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Foreground,
    Background,
}

struct Job {
    id: u64,
    path: PathBuf,
    target: Option<(u32, u32)>,
    mode: DecodeMode,
}

/// The outcome of a decode request, keyed by the request id that produced it.
pub struct DecodedEvent {
    pub id: u64,
    pub path: PathBuf,
    pub result: Result<Arc<PixelBuffer>, DecodeError>,
}

/// A sentinel `latest_id` value no real request id can ever equal (ids start
/// at 1), used by `cancel` to mark a path's in-flight work as discardable
/// without touching the running worker.
const CANCELLED_SENTINEL: u64 = 0;

struct Shared {
    next_id: AtomicU64,
    latest_id: Mutex<std::collections::HashMap<PathBuf, u64>>,
    ignored: Mutex<HashSet<PathBuf>>,
}

impl Shared {
    fn is_current(&self, path: &Path, id: u64) -> bool {
        self.latest_id
            .lock()
            .expect("scheduler state lock poisoned")
            .get(path)
            .copied()
            == Some(id)
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignored
            .lock()
            .expect("scheduler state lock poisoned")
            .contains(path)
    }
}

/// Dispatches decode requests to a fixed pool of worker threads, discarding
/// any result that is no longer current by the time it completes.
///
/// Two independent priority lanes feed the same worker pool; each worker
/// prefers the foreground lane and only pulls from background when it is
/// empty, so prefetch work never delays the currently viewed image but also
/// never starves outright.
pub struct Scheduler {
    shared: Arc<Shared>,
    fg_tx: Sender<Job>,
    bg_tx: Sender<Job>,
    result_rx: Receiver<DecodedEvent>,
    // Interior mutability so `shutdown` can run through `&self`: the
    // Folder Model and Batch Thumbnail Loader hold this scheduler behind a
    // shared `Arc` (a lookup handle, never ownership; the Engine Facade
    // alone decides when to shut it down), so shutdown cannot consume it.
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl Scheduler {
    pub fn new(worker_count: usize) -> Self {
        let (fg_tx, fg_rx) = unbounded::<Job>();
        let (bg_tx, bg_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = unbounded::<DecodedEvent>();
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            latest_id: Mutex::new(std::collections::HashMap::new()),
            ignored: Mutex::new(HashSet::new()),
        });

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for idx in 0..worker_count.max(1) {
            let fg_rx = fg_rx.clone();
            let bg_rx = bg_rx.clone();
            let result_tx = result_tx.clone();
            let shared = shared.clone();
            let stop_rx = stop_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("decode-worker-{idx}"))
                .spawn(move || worker_loop(fg_rx, bg_rx, result_tx, shared, stop_rx))
                .expect("failed to spawn decode worker thread");
            workers.push(handle);
        }

        Scheduler {
            shared,
            fg_tx,
            bg_tx,
            result_rx,
            workers: Mutex::new(workers),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        }
    }

    /// Enqueues a decode request and returns its request id. The newest id
    /// for a given path is authoritative; any in-flight completion for an
    /// older id on the same path is silently discarded.
    pub fn request(
        &self,
        path: PathBuf,
        target: Option<(u32, u32)>,
        mode: DecodeMode,
        priority: Priority,
    ) -> u64 {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .latest_id
            .lock()
            .expect("scheduler state lock poisoned")
            .insert(path.clone(), id);

        let job = Job {
            id,
            path,
            target,
            mode,
        };
        let sender = match priority {
            Priority::Foreground => &self.fg_tx,
            Priority::Background => &self.bg_tx,
        };
        // Workers never disconnect while `self` is alive, so this cannot fail.
        let _ = sender.send(job);
        id
    }

    /// Marks any in-flight work for `path` as stale. This never interrupts a
    /// worker already decoding `path`; it only ensures that worker's result
    /// is dropped instead of delivered (see Design Notes: cancel is
    /// discard-only by deliberate choice, mirroring the upstream behavior
    /// this was generalized from).
    pub fn cancel(&self, path: &Path) {
        if let Some(entry) = self
            .shared
            .latest_id
            .lock()
            .expect("scheduler state lock poisoned")
            .get_mut(path)
        {
            *entry = CANCELLED_SENTINEL;
        }
    }

    pub fn ignore(&self, path: PathBuf) {
        self.shared
            .ignored
            .lock()
            .expect("scheduler state lock poisoned")
            .insert(path);
    }

    pub fn unignore(&self, path: &Path) {
        self.shared
            .ignored
            .lock()
            .expect("scheduler state lock poisoned")
            .remove(path);
    }

    /// Drains all currently available decode results without blocking.
    pub fn poll_results(&self) -> Vec<DecodedEvent> {
        let mut results = Vec::new();
        while let Ok(event) = self.result_rx.try_recv() {
            results.push(event);
        }
        results
    }

    /// Blocks the calling thread until a result is available or `timeout`
    /// elapses.
    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<DecodedEvent> {
        self.result_rx.recv_timeout(timeout).ok()
    }

    /// Waits up to `deadline` for all workers to finish their current job
    /// and exit. Workers that do not join in time are left detached; any
    /// result they eventually produce is still suppressed by the normal
    /// staleness check once the caller stops polling `poll_results`.
    ///
    /// Idempotent: a second call is a no-op once the stop signal has been
    /// sent once.
    pub fn shutdown(&self, deadline: Duration) {
        if let Some(stop_tx) = self.stop_tx.lock().expect("stop_tx lock poisoned").take() {
            drop(stop_tx);
        }

        let workers = std::mem::take(&mut *self.workers.lock().expect("workers lock poisoned"));
        let (done_tx, done_rx) = bounded::<()>(1);
        std::thread::spawn(move || {
            for worker in workers {
                let _ = worker.join();
            }
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv_timeout(deadline);
    }
}

fn worker_loop(
    fg_rx: Receiver<Job>,
    bg_rx: Receiver<Job>,
    result_tx: Sender<DecodedEvent>,
    shared: Arc<Shared>,
    stop_rx: Receiver<()>,
) {
    loop {
        let job = match recv_prefer_foreground(&fg_rx, &bg_rx, &stop_rx) {
            Some(job) => job,
            None => return, // stop signal received, or both lanes disconnected
        };

        if !shared.is_current(&job.path, job.id) {
            continue;
        }

        let path = job.path.clone();
        let result: Result<PixelBuffer, DecodeError> =
            match panic::catch_unwind(AssertUnwindSafe(|| {
                codec::decode(&job.path, job.target, job.mode)
            })) {
                Ok(decoded) => decoded.map_err(DecodeError::from),
                Err(_) => {
                    // A panicking decode is this pool's analogue of a crashed
                    // worker process (see Design Notes: catch_unwind stands in
                    // for process isolation); the id/ignore checks below still
                    // ensure no stale or ignored result escapes.
                    log::error!("decode worker panicked while decoding {}", path.display());
                    Err(DecodeError::from(SchedulerError::WorkerDied { path: path.clone() }))
                }
            };

        if !shared.is_current(&path, job.id) {
            log::debug!("dropping stale decode result for {}", path.display());
            continue;
        }
        if shared.is_ignored(&path) {
            log::debug!("dropping ignored decode result for {}", path.display());
            continue;
        }

        let event = DecodedEvent {
            id: job.id,
            path,
            result: result.map(Arc::new),
        };
        if result_tx.send(event).is_err() {
            return;
        }
    }
}

fn recv_prefer_foreground(
    fg_rx: &Receiver<Job>,
    bg_rx: &Receiver<Job>,
    stop_rx: &Receiver<()>,
) -> Option<Job> {
    if let Ok(job) = fg_rx.try_recv() {
        return Some(job);
    }
    select! {
        recv(fg_rx) -> job => job.ok(),
        recv(bg_rx) -> job => job.ok(),
        recv(stop_rx) -> _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([5, 5, 5]));
        image::DynamicImage::ImageRgb8(image)
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();
        path
    }

    #[test]
    fn newest_request_for_a_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 50, 50);
        let scheduler = Scheduler::new(2);

        let _first = scheduler.request(path.clone(), None, DecodeMode::Full, Priority::Foreground);
        let second = scheduler.request(path.clone(), None, DecodeMode::Full, Priority::Foreground);

        let mut seen = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline && seen.len() < 2 {
            if let Some(event) = scheduler.recv_result_timeout(Duration::from_millis(100)) {
                seen.push(event);
            }
        }

        assert!(seen.iter().any(|event| event.id == second));
        assert!(!seen.iter().any(|event| event.id == _first));
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn ignored_path_never_emits_a_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "b.png", 20, 20);
        let scheduler = Scheduler::new(1);
        scheduler.ignore(path.clone());
        scheduler.request(path.clone(), None, DecodeMode::Full, Priority::Foreground);

        let event = scheduler.recv_result_timeout(Duration::from_millis(300));
        assert!(event.is_none());
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn unknown_path_completes_with_not_found_error() {
        let scheduler = Scheduler::new(1);
        let path = PathBuf::from("/definitely/not/a/real/path.png");
        scheduler.request(path.clone(), None, DecodeMode::Full, Priority::Foreground);

        let event = scheduler
            .recv_result_timeout(Duration::from_secs(1))
            .expect("should receive a terminal result");
        assert!(event.result.is_err());
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn cancel_does_not_stop_a_queued_job_from_running_but_discards_its_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "c.png", 10, 10);
        let scheduler = Scheduler::new(1);
        scheduler.request(path.clone(), None, DecodeMode::Full, Priority::Foreground);
        scheduler.cancel(&path);

        let event = scheduler.recv_result_timeout(Duration::from_millis(300));
        assert!(event.is_none());
        scheduler.shutdown(Duration::from_secs(1));
    }
}
