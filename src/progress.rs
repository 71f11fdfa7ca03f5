//! Sync progress tracking: watermark bookkeeping, throttled reporting and
//! the resumable state file.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Error;

/// Invoke the progress callback every this many completions
const REPORT_EVERY: u64 = 10;

/// Minimum watermark advance between state-file writes
const PERSIST_EVERY: u32 = 1000;

/// Snapshot handed to the progress callback after a range completes.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Lowest range index still in flight. Every index below it has
    /// completed, making this the safe resumption point after a crash.
    pub lowest: u32,
    /// The range index that just completed.
    pub current: u32,
    /// Exclusive upper bound of the sync run.
    pub to: u32,
    /// Ranges completed so far, counted from index zero (resumed runs start
    /// above zero).
    pub processed: u64,
    /// Ranges still to complete.
    pub remaining: u64,
}

/// Callback invoked with sync progress.
///
/// Invocations are serialized and throttled; there is no guarantee the
/// callback sees every range. An error return is recorded in the run's
/// aggregated error but does not stop the run.
pub type ProgressFn =
    Arc<dyn Fn(Progress) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Completion bookkeeping shared by the sync workers.
pub(crate) struct Tracker {
    processed: AtomicU64,
    in_flight: Mutex<BTreeSet<u32>>,
}

impl Tracker {
    pub(crate) fn new(from: u32) -> Self {
        Self { processed: AtomicU64::new(u64::from(from)), in_flight: Mutex::new(BTreeSet::new()) }
    }

    pub(crate) async fn dispatched(&self, index: u32) {
        self.in_flight.lock().await.insert(index);
    }

    /// Marks a range as successfully completed and returns the updated
    /// `(processed, lowest)` pair. With nothing left in flight the watermark
    /// reports `to - 1` so the final tick reads as completion.
    pub(crate) async fn completed(&self, index: u32, to: u32) -> (u64, u32) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;

        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(&index);
        let lowest = in_flight.iter().next().copied().unwrap_or(to - 1);

        (processed, lowest)
    }
}

/// Serializes progress callbacks and state-file writes so each observer
/// sees a consistent snapshot. The engine locks the reporter only on
/// throttled ticks.
pub(crate) struct Reporter {
    progress_fn: Option<ProgressFn>,
    state: Option<StateFile>,
}

impl Reporter {
    pub(crate) fn new(progress_fn: Option<ProgressFn>, state: Option<StateFile>) -> Self {
        Self { progress_fn, state }
    }

    /// Whether a completion at `processed`/`remaining` should be reported.
    pub(crate) fn due(processed: u64, remaining: u64) -> bool {
        processed % REPORT_EVERY == 0 || remaining == 0
    }

    pub(crate) fn report(&mut self, progress: Progress) -> Result<(), Error> {
        if let Some(state) = &mut self.state {
            let due = progress.lowest >= state.last_persisted.saturating_add(PERSIST_EVERY)
                || progress.remaining == 0;

            if due {
                // A failed write must not fail the sync; the next successful
                // write or a fresh run repairs the file.
                if let Err(err) = state.persist(progress.lowest) {
                    warn!(path = %state.path.display(), error = %err, "updating state file failed");
                }
            }
        }

        if let Some(progress_fn) = &self.progress_fn {
            progress_fn(progress).map_err(|source| Error::Progress { source })?;
        }

        Ok(())
    }
}

/// Resumable sync watermark persisted as decimal ASCII.
pub(crate) struct StateFile {
    file: File,
    path: PathBuf,
    last_persisted: u32,
}

impl StateFile {
    /// Opens (creating if absent) the state file and reads the persisted
    /// watermark. Empty or whitespace-only content means zero.
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| Error::File { op: "opening state file", path: path.to_path_buf(), source })?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|source| Error::File { op: "reading state file", path: path.to_path_buf(), source })?;
        file.seek(SeekFrom::Start(0))
            .map_err(|source| Error::File { op: "rewinding state file", path: path.to_path_buf(), source })?;

        // Values are monotonic, so overwrites never shorten the content, but
        // tolerate surrounding whitespace anyway.
        let content = content.trim();
        let watermark = if content.is_empty() {
            0
        } else {
            content
                .parse()
                .map_err(|source| Error::StateParse { path: path.to_path_buf(), source })?
        };

        Ok(Self { file, path: path.to_path_buf(), last_persisted: watermark })
    }

    pub(crate) fn watermark(&self) -> u32 {
        self.last_persisted
    }

    fn persist(&mut self, watermark: u32) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(watermark.to_string().as_bytes())?;
        self.file.flush()?;
        self.last_persisted = watermark;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lowest_tracks_the_minimum_in_flight_index() {
        let tracker = Tracker::new(0);

        tracker.dispatched(3).await;
        tracker.dispatched(5).await;
        tracker.dispatched(4).await;

        let (processed, lowest) = tracker.completed(4, 12).await;
        assert_eq!(processed, 1);
        assert_eq!(lowest, 3);

        let (_, lowest) = tracker.completed(3, 12).await;
        assert_eq!(lowest, 5);
    }

    #[tokio::test]
    async fn test_lowest_falls_back_to_the_upper_bound() {
        let tracker = Tracker::new(10);

        tracker.dispatched(11).await;
        let (processed, lowest) = tracker.completed(11, 12).await;

        assert_eq!(processed, 11);
        assert_eq!(lowest, 11);
    }

    #[test]
    fn test_reporting_is_throttled() {
        assert!(Reporter::due(10, 2));
        assert!(Reporter::due(20, 2));
        assert!(Reporter::due(7, 0));
        assert!(!Reporter::due(7, 5));
        assert!(!Reporter::due(11, 1));
    }

    #[test]
    fn test_state_file_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        let state = StateFile::open(&path).unwrap();
        assert_eq!(state.watermark(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_state_file_parses_with_whitespace_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        std::fs::write(&path, " 1234\n").unwrap();
        assert_eq!(StateFile::open(&path).unwrap().watermark(), 1234);

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(StateFile::open(&path).unwrap().watermark(), 0);

        std::fs::write(&path, "not a number").unwrap();
        assert!(matches!(StateFile::open(&path), Err(Error::StateParse { .. })));
    }

    #[test]
    fn test_persist_policy_requires_advance_or_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, "500").unwrap();

        let state = StateFile::open(&path).unwrap();
        let mut reporter = Reporter::new(None, Some(state));

        let progress = |lowest, remaining| Progress { lowest, current: lowest, to: 0x100000, processed: 1000, remaining };

        // Not enough advance, not done: no write.
        reporter.report(progress(900, 7)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "500");

        // Advanced by the persistence step: written.
        reporter.report(progress(1500, 7)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1500");

        // Small advance again: skipped.
        reporter.report(progress(1600, 7)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1500");

        // Completion always persists.
        reporter.report(progress(1700, 0)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1700");
    }

    #[test]
    fn test_progress_callback_errors_surface() {
        let progress_fn: ProgressFn = Arc::new(|_| Err("observer failed".into()));
        let mut reporter = Reporter::new(Some(progress_fn), None);

        let err = reporter
            .report(Progress { lowest: 0, current: 0, to: 12, processed: 10, remaining: 2 })
            .unwrap_err();
        assert!(err.to_string().contains("observer failed"));
    }
}
