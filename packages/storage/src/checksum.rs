//! SHA-256 digests of local files and stored objects.

use std::path::Path;

use dcor_storage_models::CHECKSUM_CHUNK_SIZE;
use sha2::{Digest, Sha256};

use crate::StorageError;
use crate::backend::ObjectStore;

/// Buffer size for hashing local files.
const LOCAL_CHUNK_SIZE: usize = 256 * 1024;

/// Computes the SHA-256 of an object by streaming it in
/// [`CHECKSUM_CHUNK_SIZE`] ranged reads.
///
/// With `max_size`, at most that many bytes are hashed (used to compare an
/// object against a local file of known size). Range reads are not retried.
///
/// # Errors
///
/// Returns [`StorageError::NotFound`] if the object does not exist and
/// [`StorageError::Store`] if a read fails or returns fewer bytes than the
/// object had at `HEAD` time.
pub async fn compute_checksum(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    max_size: Option<u64>,
) -> Result<String, StorageError> {
    let meta = store
        .head_object(bucket, key)
        .await?
        .ok_or_else(|| StorageError::not_found(bucket, key))?;
    let size = max_size.map_or(meta.size, |max| max.min(meta.size));

    let mut hasher = Sha256::new();
    let mut offset = 0;
    while offset < size {
        let end = (offset + CHECKSUM_CHUNK_SIZE).min(size);
        let chunk = store.get_range(bucket, key, offset..end).await?;
        let read = chunk.len() as u64;
        if read != end - offset {
            // Object was replaced by a shorter one after HEAD.
            return Err(StorageError::store(
                "GetObject",
                bucket,
                key,
                format!(
                    "short read at offset {offset}: expected {} bytes, got {read}",
                    end - offset
                ),
            ));
        }
        offset += read;
        hasher.update(&chunk);
    }

    let digest = hex::encode(hasher.finalize());
    log::debug!("sha256 of s3://{bucket}/{key} ({offset} bytes): {digest}");
    Ok(digest)
}

/// Computes the SHA-256 of a local file on a blocking thread.
///
/// # Errors
///
/// Returns [`StorageError::Io`] if the file cannot be read.
pub async fn sha256_file(path: &Path) -> Result<String, StorageError> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || sha256_file_sync(&path))
        .await
        .map_err(std::io::Error::other)??;
    Ok(digest)
}

fn sha256_file_sync(path: &Path) -> Result<String, std::io::Error> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; LOCAL_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::memory::MemoryStore;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn hashes_bytes() {
        assert_eq!(sha256_bytes(b""), EMPTY);
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn hashes_local_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            sha256_file(file.path()).await.unwrap(),
            sha256_bytes(b"abc")
        );
    }

    #[tokio::test]
    async fn missing_local_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = sha256_file(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[tokio::test]
    async fn streams_remote_objects_in_chunks() {
        let store = MemoryStore::new();
        let chunk = usize::try_from(CHECKSUM_CHUNK_SIZE).unwrap();
        let data: Vec<u8> = (0..chunk * 2 + 17).map(|i| (i % 251) as u8).collect();
        store.insert_object("b", "k", data.clone());

        let digest = compute_checksum(&store, "b", "k", None).await.unwrap();
        assert_eq!(digest, sha256_bytes(&data));
        assert_eq!(store.counts().get_range, 3);
    }

    #[tokio::test]
    async fn max_size_bounds_the_hashed_prefix() {
        let store = MemoryStore::new();
        store.insert_object("b", "k", b"hello world".to_vec());

        let digest = compute_checksum(&store, "b", "k", Some(5)).await.unwrap();
        assert_eq!(digest, sha256_bytes(b"hello"));
        let digest = compute_checksum(&store, "b", "k", Some(500)).await.unwrap();
        assert_eq!(digest, sha256_bytes(b"hello world"));
    }

    #[tokio::test]
    async fn empty_objects_hash_without_reads() {
        let store = MemoryStore::new();
        store.insert_object("b", "k", Vec::new());
        assert_eq!(compute_checksum(&store, "b", "k", None).await.unwrap(), EMPTY);
        assert_eq!(store.counts().get_range, 0);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryStore::new();
        store.insert_bucket("b");
        let err = compute_checksum(&store, "b", "k", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn object_shrinking_mid_read_is_an_error() {
        let store = MemoryStore::new();
        let chunk = usize::try_from(CHECKSUM_CHUNK_SIZE).unwrap();
        store.insert_object("b", "k", vec![7u8; chunk * 2]);
        store.overwrite_before_next_read(vec![7u8; chunk / 2]);

        let err = compute_checksum(&store, "b", "k", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Store { operation: "GetObject", .. }));
        assert!(err.to_string().contains("short read"));
    }

    #[tokio::test]
    async fn failed_reads_surface_as_store_errors() {
        let store = MemoryStore::new();
        store.insert_object("b", "k", b"data".to_vec());
        store.fail_reads(true);
        let err = compute_checksum(&store, "b", "k", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Store { .. }));
    }
}
