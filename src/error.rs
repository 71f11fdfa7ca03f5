use std::path::PathBuf;

/// Errors produced by the mirror.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed for range {range}: {source}")]
    HttpRequest {
        range: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected HTTP status {status} for range {range}")]
    HttpStatus { range: String, status: u16 },

    #[error("empty response body for range {range}")]
    EmptyBody { range: String },

    /// Every attempt for a range failed; carries the error of each attempt.
    #[error("requesting range {range} failed after {} attempt(s): [{}]", .errors.len(), join_errors(.errors))]
    UpstreamExhausted { range: String, errors: Vec<Error> },

    #[error("building HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("{op} {}: {source}", .path.display())]
    File {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bucket file {} is truncated: no etag line", .path.display())]
    TruncatedBucket { path: PathBuf },

    #[error("parsing state file {}: {source}", .path.display())]
    StateParse {
        path: PathBuf,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("parsing sync marker {}: {source}", .path.display())]
    MarkerParse {
        path: PathBuf,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("reporting progress: {source}")]
    Progress {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("processing range {range}: {source}")]
    Range {
        range: String,
        #[source]
        source: Box<Error>,
    },

    #[error("writing export: {0}")]
    ExportWrite(#[source] std::io::Error),

    #[error("sync worker panicked: {0}")]
    WorkerPanic(String),

    #[error("sync cancelled")]
    Cancelled,

    /// Aggregated failures of a sync run. The engine finishes every
    /// dispatched range and reports all failures together.
    #[error("sync finished with {} error(s): [{}]", .errors.len(), join_errors(.errors))]
    Sync { errors: Vec<Error> },
}

fn join_errors(errors: &[Error]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}
