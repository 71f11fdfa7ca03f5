//! The sync engine: bounded fan-out refresh of the range space.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::RangeClient;
use crate::error::Error;
use crate::progress::{Progress, Reporter, Tracker};
use crate::ranges::to_range_string;
use crate::store::RangeStore;

/// Refreshes ranges `[from, to)` against the upstream API.
///
/// Ranges are dispatched in ascending order onto at most `min_workers`
/// concurrent jobs and complete in unspecified order; the tracker's
/// watermark hides that non-determinism. One range's failure never stops
/// its peers: the run drains completely and returns every failure in one
/// aggregated error.
pub(crate) async fn run(
    from: u32,
    to: u32,
    client: Arc<RangeClient>,
    store: Arc<RangeStore>,
    min_workers: usize,
    cancel: CancellationToken,
    reporter: Reporter,
) -> Result<(), Error> {
    let tracker = Arc::new(Tracker::new(from));
    let reporter = Arc::new(Mutex::new(reporter));
    let errors = Arc::new(Mutex::new(Vec::new()));

    // Submission is non-buffering: a permit is taken before each spawn, so
    // the loop blocks while all workers are busy and cancellation takes
    // effect without a backlog of queued jobs.
    let semaphore = Arc::new(Semaphore::new(min_workers.max(1)));

    let mut jobs = JoinSet::new();
    let mut cancelled = false;

    for index in from..to {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.expect("worker semaphore closed")
            }
        };

        // Reap finished jobs as we go so the join set stays bounded by the
        // worker count instead of growing with the range space.
        while let Some(joined) = jobs.try_join_next() {
            record_panic(joined, &errors).await;
        }

        let client = Arc::clone(&client);
        let store = Arc::clone(&store);
        let tracker = Arc::clone(&tracker);
        let reporter = Arc::clone(&reporter);
        let errors = Arc::clone(&errors);

        jobs.spawn(async move {
            let _permit = permit;
            let range = to_range_string(index);

            tracker.dispatched(index).await;

            let result = process_range(index, to, &range, &client, &store, &tracker, &reporter).await;

            if let Err(source) = result {
                errors.lock().await.push(Error::Range { range, source: Box::new(source) });
            }
        });
    }

    while let Some(joined) = jobs.join_next().await {
        record_panic(joined, &errors).await;
    }

    let mut errors = std::mem::take(&mut *errors.lock().await);
    if cancelled {
        errors.push(Error::Cancelled);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Sync { errors })
    }
}

/// Refreshes one range: conditional fetch, save on change, completion
/// bookkeeping and the throttled progress report.
///
/// A failed range returns early and therefore never leaves the in-flight
/// set: it pins the watermark below itself until a later run succeeds, and
/// it is not counted as processed.
async fn process_range(
    index: u32,
    to: u32,
    range: &str,
    client: &RangeClient,
    store: &RangeStore,
    tracker: &Tracker,
    reporter: &Mutex<Reporter>,
) -> Result<(), Error> {
    // A missing or unreadable etag only costs a full download.
    let etag = store.load_etag(range).await.unwrap_or_default();

    let response = client.request_range(range, &etag).await?;

    if !response.not_modified {
        store.save(range, &response.etag, &response.body).await?;
    }

    let (processed, lowest) = tracker.completed(index, to).await;
    let remaining = u64::from(to) - processed;

    if Reporter::due(processed, remaining) {
        let progress = Progress { lowest, current: index, to, processed, remaining };
        reporter.lock().await.report(progress)?;
    }

    Ok(())
}

async fn record_panic(result: Result<(), tokio::task::JoinError>, errors: &Mutex<Vec<Error>>) {
    if let Err(err) = result {
        errors.lock().await.push(Error::WorkerPanic(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use httpmock::prelude::*;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::progress::{ProgressFn, StateFile};

    fn endpoint(server: &MockServer) -> String {
        format!("{}/range/", server.base_url())
    }

    fn quick_client(server: &MockServer) -> Arc<RangeClient> {
        Arc::new(RangeClient::with_retries(&endpoint(server), 0, 0).unwrap())
    }

    fn mock_fresh(server: &MockServer, index: u32) -> httpmock::Mock<'_> {
        let range = to_range_string(index);
        server.mock(move |when, then| {
            when.method(GET).path(format!("/range/{range}"));
            then.status(200)
                .header("ETag", format!("etag-{range}"))
                .body(format!("suffix{index}:{index}"));
        })
    }

    async fn read_body(store: &RangeStore, range: &str) -> Vec<u8> {
        let mut reader = store.load_data(range).await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_fresh_sync_stores_every_range_and_throttles_progress() {
        let server = MockServer::start();
        let mocks: Vec<_> = (0..12).map(|i| mock_fresh(&server, i)).collect();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RangeStore::new(dir.path(), true));

        let calls = Arc::new(StdMutex::new(Vec::new()));
        let calls_in_fn = Arc::clone(&calls);
        let progress_fn: ProgressFn = Arc::new(move |progress: Progress| {
            calls_in_fn.lock().unwrap().push(progress.processed);
            Ok(())
        });

        run(
            0,
            12,
            quick_client(&server),
            Arc::clone(&store),
            3,
            CancellationToken::new(),
            Reporter::new(Some(progress_fn), None),
        )
        .await
        .unwrap();

        for (index, mock) in mocks.iter().enumerate() {
            mock.assert();
            let range = to_range_string(index as u32);
            assert_eq!(store.load_etag(&range).await.unwrap(), format!("etag-{range}"));
            assert_eq!(read_body(&store, &range).await, format!("suffix{index}:{index}").into_bytes());
        }

        let mut calls = calls.lock().unwrap().clone();
        calls.sort_unstable();
        assert_eq!(calls, vec![10, 12]);
    }

    #[tokio::test]
    async fn test_unchanged_range_is_left_untouched_on_304() {
        let server = MockServer::start();
        let not_modified = server.mock(|when, then| {
            when.method(GET).path("/range/00001").header("If-None-Match", "prev");
            then.status(304);
        });
        let fresh: Vec<_> = (0..12).filter(|&i| i != 1).map(|i| mock_fresh(&server, i)).collect();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RangeStore::new(dir.path(), true));
        store.save("00001", "prev", b"cached:1").await.unwrap();

        run(
            0,
            12,
            quick_client(&server),
            Arc::clone(&store),
            3,
            CancellationToken::new(),
            Reporter::new(None, None),
        )
        .await
        .unwrap();

        not_modified.assert();
        assert_eq!(store.load_etag("00001").await.unwrap(), "prev");
        assert_eq!(read_body(&store, "00001").await, b"cached:1");

        for mock in &fresh {
            mock.assert();
        }
    }

    #[tokio::test]
    async fn test_resumption_starts_at_the_state_watermark() {
        let server = MockServer::start();
        // Only the ranges at or above the watermark are mocked; a request
        // below it would fail the run.
        let mocks: Vec<_> = (5..12).map(|i| mock_fresh(&server, i)).collect();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RangeStore::new(dir.path(), true));

        let state_path = dir.path().join("state");
        std::fs::write(&state_path, "5").unwrap();

        let state = StateFile::open(&state_path).unwrap();
        let from = state.watermark();
        assert_eq!(from, 5);

        // A single worker keeps the completion order deterministic.
        run(
            from,
            12,
            quick_client(&server),
            Arc::clone(&store),
            1,
            CancellationToken::new(),
            Reporter::new(None, Some(state)),
        )
        .await
        .unwrap();

        for mock in &mocks {
            mock.assert();
        }
        for index in 5..12 {
            assert!(store.load_etag(&to_range_string(index)).await.is_ok());
        }
        assert!(store.load_etag("00000").await.is_err());

        assert_eq!(std::fs::read_to_string(&state_path).unwrap().trim(), "11");
    }

    #[tokio::test]
    async fn test_failed_range_is_reported_and_peers_complete() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method(GET).path("/range/00003");
            then.status(500);
        });
        let fresh: Vec<_> = (0..12).filter(|&i| i != 3).map(|i| mock_fresh(&server, i)).collect();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RangeStore::new(dir.path(), true));

        // Transient retries are disabled so every application-level attempt
        // observes the server error directly.
        let client = Arc::new(RangeClient::with_retries(&endpoint(&server), 2, 0).unwrap());

        let err = run(
            0,
            12,
            client,
            Arc::clone(&store),
            3,
            CancellationToken::new(),
            Reporter::new(None, None),
        )
        .await
        .unwrap_err();

        failing.assert_hits(3);
        assert!(err.to_string().contains("00003"));
        match err {
            Error::Sync { errors } => assert_eq!(errors.len(), 1),
            other => panic!("expected aggregated sync error, got {other:?}"),
        }

        for mock in &fresh {
            mock.assert();
        }
        for index in (0..12).filter(|&i| i != 3) {
            assert!(store.load_etag(&to_range_string(index)).await.is_ok());
        }
        assert!(store.load_etag("00003").await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RangeStore::new(dir.path(), true));

        // No mock server: any dispatched range would error loudly.
        let client = Arc::new(RangeClient::with_retries("http://127.0.0.1:9/range/", 0, 0).unwrap());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run(0, 12, client, store, 3, cancel, Reporter::new(None, None)).await.unwrap_err();

        match err {
            Error::Sync { errors } => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], Error::Cancelled));
            }
            other => panic!("expected aggregated sync error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_callback_errors_do_not_stop_the_run() {
        let server = MockServer::start();
        let mocks: Vec<_> = (0..12).map(|i| mock_fresh(&server, i)).collect();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RangeStore::new(dir.path(), true));

        let progress_fn: ProgressFn = Arc::new(|_| Err("observer failed".into()));

        let err = run(
            0,
            12,
            quick_client(&server),
            Arc::clone(&store),
            3,
            CancellationToken::new(),
            Reporter::new(Some(progress_fn), None),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("observer failed"));

        // Every range was still fetched and stored.
        for (index, mock) in mocks.iter().enumerate() {
            mock.assert();
            assert!(store.load_etag(&to_range_string(index as u32)).await.is_ok());
        }
    }
}
