use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use rayon::prelude::*;

use crate::codec::DecodeMode;
use crate::folder::FolderRow;
use crate::scheduler::{Priority, Scheduler};
use crate::store::{BatchLookup, FileStat, ThumbnailStore};

/// One row's resolution in a batch reply: either a cache hit with bytes, or
/// an explicit miss the caller should treat as "decode scheduled".
#[derive(Debug, Clone)]
pub enum ThumbRow {
    Hit {
        path: PathBuf,
        png_bytes: Arc<Vec<u8>>,
        orig_dims: (u32, u32),
    },
    Miss {
        path: PathBuf,
        /// A best-effort header-only dimension probe, so the resolution
        /// column doesn't have to wait on the background thumbnail decode
        /// that misses schedule below. `None` if the probe itself failed
        /// (treated the same as a miss: the decode completion is still the
        /// authoritative source for the row's thumbnail).
        orig_dims: Option<(u32, u32)>,
    },
}

/// A batch of resolved rows, emitted roughly every `CHUNK_SIZE` rows so a
/// large folder doesn't block the consumer behind one giant reply.
pub type Chunk = Vec<ThumbRow>;

const CHUNK_SIZE: usize = 64;
/// Per-path chunk updates arriving within this window are coalesced to the
/// latest one, so a burst of decode completions doesn't flood the consumer.
const COALESCE_WINDOW: Duration = Duration::from_millis(16);

struct Job {
    rows: Vec<FolderRow>,
    thumb_box: (u32, u32),
    generation: u64,
}

/// Off-main-thread worker that probes the thumbnail store for a folder
/// snapshot, emits chunked hit/miss rows, and schedules misses through the
/// decode scheduler, writing back any newly-decoded thumbnail.
pub struct BatchThumbnailLoader {
    job_tx: mpsc::Sender<Job>,
    chunk_rx: mpsc::Receiver<Chunk>,
    running: Arc<AtomicBool>,
    // Bumped by `cancel()`. A job only keeps submitting decodes and emitting
    // chunks for as long as this still matches the generation it was
    // submitted under; retiring a snapshot bumps it so any job already
    // queued or in flight for that snapshot quietly stops doing either.
    generation: Arc<AtomicU64>,
}

impl BatchThumbnailLoader {
    /// `io_pool_size` sizes the dedicated `rayon` pool used for the
    /// per-miss dimension-probe fan-out, kept separate from the scheduler's
    /// CPU decode pool so a large folder's header probes don't compete with
    /// in-flight full decodes for threads.
    pub fn new(store: Arc<ThumbnailStore>, scheduler: Arc<Scheduler>, io_pool_size: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>();
        let running = Arc::new(AtomicBool::new(false));
        let worker_running = running.clone();
        let generation = Arc::new(AtomicU64::new(0));
        let worker_generation = generation.clone();

        let probe_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(io_pool_size.max(1))
            .thread_name(|idx| format!("thumb-probe-{idx}"))
            .build()
            .expect("failed to build thumbnail probe thread pool");

        std::thread::Builder::new()
            .name("batch-thumbnail-loader".to_string())
            .spawn(move || {
                for job in job_rx {
                    worker_running.store(true, Ordering::SeqCst);
                    run_job(job, &store, &scheduler, &chunk_tx, &probe_pool, &worker_generation);
                    worker_running.store(false, Ordering::SeqCst);
                }
            })
            .expect("failed to spawn batch thumbnail loader thread");

        BatchThumbnailLoader {
            job_tx,
            chunk_rx,
            running,
            generation,
        }
    }

    /// Submits a folder snapshot for thumbnail probing. Never blocks the
    /// calling (UI) thread: the stat/query/decode-submission work all
    /// happens on the loader's dedicated thread.
    pub fn submit(&self, rows: Vec<FolderRow>, thumb_box: (u32, u32)) {
        let generation = self.generation.load(Ordering::SeqCst);
        let _ = self.job_tx.send(Job {
            rows,
            thumb_box,
            generation,
        });
    }

    /// Retires the current snapshot: any job already queued or running for
    /// it stops submitting new decodes and discards its pending chunk
    /// emissions, per the batch thumbnail loader's cancellation contract.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drains all chunks produced so far without blocking.
    pub fn poll_chunks(&self) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.chunk_rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn run_job(
    job: Job,
    store: &ThumbnailStore,
    scheduler: &Scheduler,
    chunk_tx: &mpsc::Sender<Chunk>,
    probe_pool: &rayon::ThreadPool,
    generation: &AtomicU64,
) {
    let is_current = || generation.load(Ordering::SeqCst) == job.generation;
    if !is_current() {
        return;
    }

    let lookups: Vec<BatchLookup> = job
        .rows
        .iter()
        .map(|row| BatchLookup {
            path: row.path.clone(),
            stat: FileStat {
                mtime: row.mtime,
                size: row.size,
            },
            requested_box: job.thumb_box,
        })
        .collect();

    let records = match store.get_batch(&lookups) {
        Ok(records) => records,
        Err(error) => {
            log::warn!("batch thumbnail probe failed: {error}");
            vec![None; lookups.len()]
        }
    };
    if !is_current() {
        return;
    }

    // Rayon fan-out over the misses' header-only dimension probes: one miss
    // opening its file slowly (a network share, a spinning disk) must not
    // hold up the rest of this chunk's resolution fields.
    let miss_paths: Vec<PathBuf> = job
        .rows
        .iter()
        .zip(records.iter())
        .filter(|(_, record)| record.is_none())
        .map(|(row, _)| row.path.clone())
        .collect();
    let miss_probes: HashMap<PathBuf, (u32, u32)> = probe_pool.install(|| {
        miss_paths
            .par_iter()
            .filter_map(|path| {
                crate::codec::probe_dimensions(path)
                    .ok()
                    .map(|dims| (path.clone(), dims))
            })
            .collect()
    });

    let mut chunk = Chunk::with_capacity(CHUNK_SIZE);
    for (row, record) in job.rows.iter().zip(records.into_iter()) {
        if !is_current() {
            return;
        }
        let thumb_row = match record {
            Some(record) => ThumbRow::Hit {
                path: row.path.clone(),
                png_bytes: Arc::new(record.png_bytes),
                orig_dims: (record.orig_width, record.orig_height),
            },
            None => {
                scheduler.request(
                    row.path.clone(),
                    Some(job.thumb_box),
                    DecodeMode::Thumbnail,
                    Priority::Background,
                );
                ThumbRow::Miss {
                    path: row.path.clone(),
                    orig_dims: miss_probes.get(&row.path).copied(),
                }
            }
        };
        chunk.push(thumb_row);
        if chunk.len() >= CHUNK_SIZE {
            let _ = chunk_tx.send(std::mem::take(&mut chunk));
        }
    }
    if !chunk.is_empty() {
        let _ = chunk_tx.send(chunk);
    }
}

/// Encodes a decoded thumbnail buffer to PNG bytes and writes it back to the
/// store, to be called by the Engine Facade once a background thumbnail
/// decode submitted above completes.
pub fn write_back(
    store: &ThumbnailStore,
    path: &std::path::Path,
    stat: FileStat,
    orig_dims: (u32, u32),
    buffer: &crate::codec::PixelBuffer,
) -> Result<Vec<u8>, crate::error::StoreError> {
    let png_bytes = encode_png(buffer);
    store.upsert(
        path,
        stat,
        orig_dims,
        (buffer.width(), buffer.height()),
        &png_bytes,
    )?;
    Ok(png_bytes)
}

fn encode_png(buffer: &crate::codec::PixelBuffer) -> Vec<u8> {
    let mut out = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut out);
    // Encoding a buffer we just produced from valid decoded pixels cannot
    // fail for any reason short of an allocator error, which this codebase
    // treats as unrecoverable elsewhere too.
    image::ImageEncoder::write_image(
        encoder,
        buffer.bytes(),
        buffer.width(),
        buffer.height(),
        image::ExtendedColorType::Rgb8,
    )
    .expect("encoding an in-memory RGB8 buffer to PNG should never fail");
    out
}

// `COALESCE_WINDOW` documents the intended coalescing behavior at the
// consumer side (the Folder Model drains `poll_chunks` on a timer no
// tighter than this window); the loader itself does not need to sleep on
// it since `mpsc` already batches whatever accumulated between two drains.
#[allow(dead_code)]
fn coalesce_window() -> Duration {
    COALESCE_WINDOW
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::path::Path;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([9, 9, 9]));
        image::DynamicImage::ImageRgb8(image)
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();
        path
    }

    fn row_for(path: PathBuf, mtime: i64, size: i64) -> FolderRow {
        FolderRow {
            path,
            name: "row".to_string(),
            size,
            mtime,
            resolution: None,
            thumb: None,
        }
    }

    #[test]
    fn hits_are_returned_without_scheduling_a_decode() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("thumbs.db");
        let store = Arc::new(ThumbnailStore::open(&db_path, 1, 1).unwrap());
        let path = write_png(dir.path(), "x.png", 40, 40);
        let metadata = std::fs::metadata(&path).unwrap();
        let stat = FileStat {
            mtime: 111,
            size: metadata.len() as i64,
        };
        store
            .upsert(&path, stat, (40, 40), (40, 40), b"cached-bytes")
            .unwrap();

        let scheduler = Arc::new(Scheduler::new(1));
        let loader = BatchThumbnailLoader::new(store, scheduler.clone(), 2);
        loader.submit(vec![row_for(path.clone(), 111, stat.size)], (40, 40));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut chunks = Vec::new();
        while std::time::Instant::now() < deadline && chunks.is_empty() {
            chunks = loader.poll_chunks();
            if chunks.is_empty() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
        assert!(matches!(chunks[0][0], ThumbRow::Hit { .. }));
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn misses_schedule_a_background_decode() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("thumbs.db");
        let store = Arc::new(ThumbnailStore::open(&db_path, 1, 1).unwrap());
        let path = write_png(dir.path(), "y.png", 30, 30);
        let metadata = std::fs::metadata(&path).unwrap();

        let scheduler = Arc::new(Scheduler::new(1));
        let loader = BatchThumbnailLoader::new(store, scheduler.clone(), 2);
        loader.submit(
            vec![row_for(path.clone(), 222, metadata.len() as i64)],
            (40, 40),
        );

        let chunk_deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut chunks = Vec::new();
        while std::time::Instant::now() < chunk_deadline && chunks.is_empty() {
            chunks = loader.poll_chunks();
            if chunks.is_empty() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        assert!(matches!(chunks[0][0], ThumbRow::Miss { .. }));

        let event = scheduler
            .recv_result_timeout(Duration::from_secs(2))
            .expect("the miss should have scheduled a decode");
        assert!(event.result.is_ok());
        scheduler.shutdown(Duration::from_secs(1));
    }
}
