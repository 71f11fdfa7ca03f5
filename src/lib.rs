//! Local mirror of the Have I Been Pwned password-hash range dataset.
//!
//! The upstream API partitions the SHA-1 hash space into 2^20 ranges keyed
//! by five-hex-digit prefixes. [`Hibp::sync`] refreshes every range through
//! conditional requests on a bounded worker pool, stores each bucket
//! atomically under per-range locking, and maintains a resumable progress
//! watermark so an interrupted run continues where it left off.
//! [`Hibp::query`] serves a single stored range in the upstream response
//! format and [`Hibp::export`] streams the whole dataset as one flat
//! concatenation.
//!
//! ```no_run
//! use hibp_mirror::{Config, Hibp, SyncConfig};
//!
//! # async fn example() -> Result<(), hibp_mirror::Error> {
//! let mirror = Hibp::new(Config::default())?;
//! mirror.sync(SyncConfig::default()).await?;
//!
//! let reader = mirror.query("5BAA6").await?;
//! // Read CRLF-separated "suffix:count" lines, then drop the reader to
//! // release the range's read lock.
//! # drop(reader);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod export;
mod progress;
mod ranges;
mod store;
mod sync;

pub use config::{Config, SyncConfig};
pub use error::Error;
pub use progress::{Progress, ProgressFn};
pub use ranges::{range_to_hex, to_range_string, LAST_RANGE, TOTAL_RANGES};
pub use store::RangeReader;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWrite;

use crate::client::RangeClient;
use crate::progress::{Reporter, StateFile};
use crate::store::RangeStore;

/// Default root directory for bucket files and the sync marker
pub const DEFAULT_DATA_DIR: &str = "./.hibp-data";

/// File name conventionally used for the resumable state file
pub const DEFAULT_STATE_FILE_NAME: &str = "state";

/// Default upstream range endpoint
pub const DEFAULT_ENDPOINT: &str = "https://api.pwnedpasswords.com/range/";

/// Default number of concurrent sync workers
pub const DEFAULT_MIN_WORKERS: usize = 50;

/// Marker file recording the wall-clock completion of the last clean sync
const SYNC_MARKER_FILE: &str = ".most_recent_successful_sync";

/// Handle to a local mirror of the range dataset.
///
/// Concurrent syncs, queries and exports on the same instance coordinate
/// through a shared set of per-range file locks, which is why operations on
/// one dataset should go through one `Hibp` value.
pub struct Hibp {
    store: Arc<RangeStore>,
    data_dir: PathBuf,
    most_recent_successful_sync: Mutex<Option<SystemTime>>,
}

impl Hibp {
    /// Opens a mirror rooted at `config.data_dir`.
    ///
    /// Reads the sync marker if one exists; the directory itself is created
    /// lazily by the first write.
    pub fn new(config: Config) -> Result<Self, Error> {
        let marker_path = config.data_dir.join(SYNC_MARKER_FILE);

        let most_recent = match std::fs::read_to_string(&marker_path) {
            Ok(content) => {
                let seconds: u64 = content
                    .trim()
                    .parse()
                    .map_err(|source| Error::MarkerParse { path: marker_path, source })?;
                Some(UNIX_EPOCH + Duration::from_secs(seconds))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(Error::File { op: "reading sync marker", path: marker_path, source })
            }
        };

        Ok(Self {
            store: Arc::new(RangeStore::new(config.data_dir.clone(), !config.no_compression)),
            data_dir: config.data_dir,
            most_recent_successful_sync: Mutex::new(most_recent),
        })
    }

    /// Refreshes the local dataset from the upstream API.
    ///
    /// Ranges are dispatched in ascending order from the state-file
    /// watermark (zero without one) through `config.last_range`. Every range
    /// is attempted even when some fail; the returned error aggregates all
    /// failures of the run. A clean run updates the most-recent-sync
    /// timestamp.
    pub async fn sync(&self, config: SyncConfig) -> Result<(), Error> {
        let mut from = 0;

        let state = match &config.state_file {
            Some(path) => {
                let state = StateFile::open(path)?;
                from = state.watermark();
                Some(state)
            }
            None => None,
        };

        let client = Arc::new(RangeClient::new(&config.endpoint)?);
        let reporter = Reporter::new(config.progress.clone(), state);

        sync::run(
            from,
            config.last_range + 1,
            client,
            Arc::clone(&self.store),
            config.min_workers,
            config.cancel.clone(),
            reporter,
        )
        .await?;

        let now = SystemTime::now();
        *self.most_recent_successful_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);

        if config.update_sync_marker {
            let seconds = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            let marker_path = self.data_dir.join(SYNC_MARKER_FILE);
            tokio::fs::write(&marker_path, seconds.to_string())
                .await
                .map_err(|source| Error::File { op: "writing sync marker", path: marker_path, source })?;
        }

        Ok(())
    }

    /// Streams the entire dataset to `writer`.
    ///
    /// Bucket bodies are concatenated verbatim in ascending range order with
    /// a single newline between buckets. The output carries no range column
    /// and no bucket boundary markers, so it is not shaped like an upstream
    /// response.
    pub async fn export<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), Error> {
        export::export(0, LAST_RANGE + 1, &self.store, writer).await
    }

    /// Reads the stored bucket for `range`.
    ///
    /// The reader yields the bucket body exactly as the upstream API serves
    /// it: CRLF-separated `suffix:count` lines without the range column. The
    /// range's read lock is held until the reader is dropped, so drop it as
    /// soon as possible.
    pub async fn query(&self, range: &str) -> Result<RangeReader, Error> {
        self.store.load_data(range).await
    }

    /// Completion time of the most recent clean sync, if any.
    pub fn most_recent_successful_sync(&self) -> Option<SystemTime> {
        *self.most_recent_successful_sync.lock().unwrap_or_else(|e| e.into_inner())
    }
}
