//! Durable keyed blob store for range buckets.
//!
//! One file per range at `<data_dir>/<KK>/<SSS>` (the key split after two
//! characters, bounding the fan-out to 256 shard directories). The file
//! content is the etag line followed by the bucket body, wrapped in a single
//! zstd frame unless compression is disabled. Writers land on a temporary
//! file that is fsynced and renamed over the final path, so a bucket is
//! either absent or complete.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};

use crate::error::Error;

const TMP_SUFFIX: &str = ".tmp";

pub(crate) struct RangeStore {
    data_dir: PathBuf,
    compression: bool,
    /// Serializes shard-directory creation across writers. Per-shard locking
    /// would buy little: there are only 256 shards and each is created once.
    create_dirs: Mutex<()>,
    /// key -> per-bucket file lock. Entries are created on first access and
    /// never removed; proving a lock idle would require stalling all other
    /// keys, and the upper bound is one entry per range (~1M).
    file_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl RangeStore {
    pub(crate) fn new(data_dir: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            data_dir: data_dir.into(),
            compression,
            create_dirs: Mutex::new(()),
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn file_lock(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.file_locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Stores `{etag, body}` for `key`, replacing any previous bucket.
    ///
    /// The write happens under the key's exclusive lock; a failure leaves a
    /// previously stored bucket untouched.
    pub(crate) async fn save(&self, key: &str, etag: &str, body: &[u8]) -> Result<(), Error> {
        let key = key.to_ascii_uppercase();

        let lock = self.file_lock(&key).await;
        let _guard = lock.write_owned().await;

        self.create_shard_dir(&key).await?;

        let path = self.file_path(&key);
        let tmp = tmp_path(&path);

        // Leftover temporary files from an interrupted run are truncated and
        // replaced here, never observable behind the final path.
        let file = fs::File::create(&tmp)
            .await
            .map_err(|source| Error::File { op: "creating", path: tmp.clone(), source })?;

        let file = if self.compression {
            // Default zstd level; the frame must be finalized before the
            // fsync below or the tail of the stream is lost.
            let mut encoder = ZstdEncoder::new(file);
            write_bucket(&mut encoder, etag, body)
                .await
                .map_err(|source| Error::File { op: "writing", path: tmp.clone(), source })?;
            encoder
                .shutdown()
                .await
                .map_err(|source| Error::File { op: "finalizing", path: tmp.clone(), source })?;
            encoder.into_inner()
        } else {
            let mut file = file;
            write_bucket(&mut file, etag, body)
                .await
                .map_err(|source| Error::File { op: "writing", path: tmp.clone(), source })?;
            file
        };

        file.sync_all()
            .await
            .map_err(|source| Error::File { op: "syncing", path: tmp.clone(), source })?;
        drop(file);

        // Atomic on POSIX file systems.
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| Error::File { op: "renaming", path: tmp, source })?;

        Ok(())
    }

    /// Returns the etag stored for `key`.
    pub(crate) async fn load_etag(&self, key: &str) -> Result<String, Error> {
        let key = key.to_ascii_uppercase();

        let lock = self.file_lock(&key).await;
        let _guard = lock.read_owned().await;

        let path = self.file_path(&key);
        let file = fs::File::open(&path)
            .await
            .map_err(|source| Error::File { op: "opening", path: path.clone(), source })?;

        let mut reader = self.bucket_reader(file);

        let mut etag = String::new();
        reader
            .read_line(&mut etag)
            .await
            .map_err(|source| Error::File { op: "reading etag from", path: path.clone(), source })?;

        if !etag.ends_with('\n') {
            return Err(Error::TruncatedBucket { path });
        }
        etag.pop();

        Ok(etag)
    }

    /// Opens a streaming reader over the bucket body for `key`.
    ///
    /// The reader owns the key's read lock; see [`RangeReader`].
    pub(crate) async fn load_data(&self, key: &str) -> Result<RangeReader, Error> {
        let key = key.to_ascii_uppercase();

        let lock = self.file_lock(&key).await;
        let guard = lock.read_owned().await;

        let path = self.file_path(&key);
        let file = fs::File::open(&path)
            .await
            .map_err(|source| Error::File { op: "opening", path: path.clone(), source })?;

        let mut reader = self.bucket_reader(file);

        // Skip the etag line; a bucket with an empty body leaves the reader
        // at EOF.
        let mut etag = String::new();
        reader
            .read_line(&mut etag)
            .await
            .map_err(|source| Error::File { op: "skipping etag line in", path, source })?;

        Ok(RangeReader { inner: reader, _guard: guard })
    }

    fn bucket_reader(&self, file: fs::File) -> Box<dyn AsyncBufRead + Send + Unpin> {
        if self.compression {
            Box::new(BufReader::new(ZstdDecoder::new(BufReader::new(file))))
        } else {
            Box::new(BufReader::new(file))
        }
    }

    async fn create_shard_dir(&self, key: &str) -> Result<(), Error> {
        let dir = self.shard_dir(key);

        let _guard = self.create_dirs.lock().await;
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| Error::File { op: "creating data directory", path: dir, source })
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        self.data_dir.join(&key[..2])
    }

    pub(crate) fn file_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(&key[2..])
    }
}

fn tmp_path(path: &std::path::Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(TMP_SUFFIX);
    PathBuf::from(tmp)
}

async fn write_bucket<W>(writer: &mut W, etag: &str, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(etag.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(body).await
}

/// Streaming reader over one bucket's body.
///
/// Owns the underlying file, the decompressor and the bucket's read lock;
/// all three are released when the reader is dropped. A reader kept alive
/// blocks writers for that bucket indefinitely.
pub struct RangeReader {
    inner: Box<dyn AsyncBufRead + Send + Unpin>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl AsyncRead for RangeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
