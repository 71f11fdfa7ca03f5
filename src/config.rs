//! Configuration for the mirror and its sync runs.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::progress::ProgressFn;
use crate::ranges::LAST_RANGE;
use crate::{DEFAULT_DATA_DIR, DEFAULT_ENDPOINT, DEFAULT_MIN_WORKERS};

/// Configuration for a [`Hibp`](crate::Hibp) mirror instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for bucket files and the sync marker.
    pub data_dir: PathBuf,
    /// Store bucket files raw instead of zstd-compressed. An existing
    /// dataset can only be read with the setting it was written with; raw
    /// storage seriously increases the space required.
    pub no_compression: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { data_dir: PathBuf::from(DEFAULT_DATA_DIR), no_compression: false }
    }
}

/// Configuration for a single sync run.
#[derive(Clone)]
pub struct SyncConfig {
    /// Upstream range endpoint; the range key is appended verbatim.
    pub endpoint: String,
    /// Number of concurrent sync workers.
    pub min_workers: usize,
    /// Path of the resumable-progress state file. `None` disables state
    /// tracking; the file is created if absent.
    pub state_file: Option<PathBuf>,
    /// Throttled progress callback.
    pub progress: Option<ProgressFn>,
    /// Highest range index to sync. Aside from tests, this is rarely useful.
    pub last_range: u32,
    /// Cooperative cancellation: once triggered, no further ranges are
    /// dispatched and the in-flight ones drain.
    pub cancel: CancellationToken,
    /// Record the completion time of a clean run in the data directory.
    pub update_sync_marker: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            min_workers: DEFAULT_MIN_WORKERS,
            state_file: None,
            progress: None,
            last_range: LAST_RANGE,
            cancel: CancellationToken::new(),
            update_sync_marker: true,
        }
    }
}
