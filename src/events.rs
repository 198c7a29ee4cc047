use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::PixelBuffer;
use crate::error::DecodeError;
use crate::folder::FolderRow;

/// Fields a `RowsUpdated` event may carry for a given row range. Kept as a
/// tagged variant rather than an ad-hoc dictionary so the facade's consumer
/// can exhaustively match on what changed.
#[derive(Debug, Clone)]
pub enum RowField {
    Resolution { width: u32, height: u32 },
    Thumbnail { png_bytes: Arc<Vec<u8>> },
    ThumbnailMissing,
}

#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub index: usize,
    pub field: RowField,
}

/// A diagnostic counter or timing, surfaced for observability only; no
/// component behavior depends on these being read.
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    StoreOperation {
        operation: &'static str,
        duration_ms: u64,
        retries: u32,
    },
    Migration {
        from_version: i64,
        to_version: i64,
        duration_ms: u64,
        outcome: &'static str,
    },
}

/// The single tagged-variant event type the Engine Facade emits. Replaces
/// the source's ad-hoc per-command event names with one exhaustively
/// matchable enum.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ImageReady {
        path: PathBuf,
        buffer: Option<Arc<PixelBuffer>>,
        error: Option<Arc<DecodeError>>,
    },
    FolderChanged {
        root: PathBuf,
        rows: Arc<Vec<FolderRow>>,
    },
    RowsUpdated {
        updates: Vec<RowUpdate>,
    },
    Metrics(MetricsEvent),
}
