//! Bulk export of the local dataset.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::ranges::to_range_string;
use crate::store::RangeStore;

/// Streams buckets `[from, to)` to `writer` in ascending range order.
///
/// Bucket bodies are emitted verbatim with a single newline between
/// consecutive buckets and none after the last, producing a flat
/// concatenation without bucket boundary markers. A missing bucket aborts
/// the export.
pub(crate) async fn export<W>(from: u32, to: u32, store: &RangeStore, writer: &mut W) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for index in from..to {
        let range = to_range_string(index);

        let mut data = store
            .load_data(&range)
            .await
            .map_err(|source| Error::Range { range: range.clone(), source: Box::new(source) })?;

        tokio::io::copy(&mut data, writer).await.map_err(Error::ExportWrite)?;

        if index + 1 < to {
            writer.write_all(b"\n").await.map_err(Error::ExportWrite)?;
        }
    }

    writer.flush().await.map_err(Error::ExportWrite)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_export_concatenates_buckets_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let store = RangeStore::new(dir.path(), true);

        store.save("00000", "e0", b"suffix:1\r\nsuffix2:2").await.unwrap();
        store.save("00001", "e1", b"s:3").await.unwrap();
        store.save("00002", "e2", b"s:4").await.unwrap();

        let mut out = Vec::new();
        export(0, 3, &store, &mut out).await.unwrap();

        assert_eq!(out, b"suffix:1\r\nsuffix2:2\ns:3\ns:4");
    }

    #[tokio::test]
    async fn test_export_of_a_single_bucket_has_no_separator() {
        let dir = tempfile::tempdir().unwrap();
        let store = RangeStore::new(dir.path(), false);

        store.save("00000", "e0", b"only:1").await.unwrap();

        let mut out = Vec::new();
        export(0, 1, &store, &mut out).await.unwrap();

        assert_eq!(out, b"only:1");
    }

    #[tokio::test]
    async fn test_export_fails_on_a_missing_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = RangeStore::new(dir.path(), true);

        store.save("00000", "e0", b"only:1").await.unwrap();

        let mut out = Vec::new();
        let err = export(0, 2, &store, &mut out).await.unwrap_err();

        assert!(err.to_string().contains("00001"));
    }
}
