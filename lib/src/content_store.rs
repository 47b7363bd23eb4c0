// Copyright 2023 The Kirin Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Content-addressed blob storage.
//!
//! Blobs live at `data/{hh}/{rest}` where `hh` is the first two hex
//! characters of the SHA-256 of the content and `rest` the remaining 62.
//! Writing is idempotent: the same bytes always land at the same key, and a
//! blob that already exists is not written again.

use std::fs::File;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use futures::TryStreamExt as _;
use sha2::Digest as _;
use sha2::Sha256;
use tokio::io::AsyncRead;
use tokio::io::ReadBuf;

use crate::file_util::BlockingAsyncReader;
use crate::file_util::IoResultExt as _;
use crate::object_id::BlobId;
use crate::object_id::ObjectId as _;
use crate::object_store::BackendError;
use crate::object_store::BackendResult;
use crate::object_store::ObjectStore;

const BLOB_KEY_PREFIX: &str = "data/";

/// Returns the storage key for a blob. The stored path carries no extension;
/// original filenames live in commit records.
pub fn blob_key(id: &BlobId) -> String {
    let hex = id.hex();
    format!("{BLOB_KEY_PREFIX}{}/{}", &hex[..2], &hex[2..])
}

fn blob_id_from_key(key: &str) -> Option<BlobId> {
    let rest = key.strip_prefix(BLOB_KEY_PREFIX)?;
    let (shard, tail) = rest.split_once('/')?;
    if shard.len() != 2 || tail.contains('/') {
        return None;
    }
    BlobId::try_from_hex(format!("{shard}{tail}"))
}

/// `AsyncRead` wrapper that feeds every byte it passes through into a
/// SHA-256 hasher.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn into_blob_id(self) -> BlobId {
        BlobId::new(self.hasher.finalize().to_vec())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.hasher.update(&buf.filled()[filled_before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

fn staging_key() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("staging/{}-{seq}", process::id())
}

/// Deduplicating blob store over an [`ObjectStore`].
#[derive(Clone, Debug)]
pub struct ContentStore {
    store: Arc<dyn ObjectStore>,
}

impl ContentStore {
    /// Wraps the given object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Stores `data` and returns its id. Idempotent; a blob that is already
    /// present is left untouched.
    pub async fn put_bytes(&self, data: &[u8]) -> BackendResult<BlobId> {
        let id = BlobId::new(Sha256::digest(data).to_vec());
        let key = blob_key(&id);
        // A racing writer storing the same content writes the same bytes,
        // so losing this check is harmless.
        if !self.store.exists(&key).await? {
            self.store.write(&key, data).await?;
        }
        Ok(id)
    }

    /// Streaming variant of [`put_bytes`](Self::put_bytes).
    ///
    /// The content is hashed while it is copied to a staging key, then moved
    /// to its content-addressed location once the digest is known. The full
    /// object is never buffered in memory.
    pub async fn put_stream(
        &self,
        contents: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BackendResult<BlobId> {
        let mut reader = HashingReader::new(contents);
        let staging = staging_key();
        self.store.write_from(&staging, &mut reader).await?;
        let id = reader.into_blob_id();
        let key = blob_key(&id);
        if self.store.exists(&key).await? {
            self.store.delete(&staging).await?;
        } else {
            self.store.rename(&staging, &key).await?;
        }
        Ok(id)
    }

    /// Reads the file at `path` into the store.
    pub async fn put_path(&self, path: &Path) -> BackendResult<BlobId> {
        let file = File::open(path)
            .context(path)
            .map_err(|err| BackendError::Other(err.into()))?;
        let mut reader = BlockingAsyncReader::new(file);
        self.put_stream(&mut reader).await
    }

    /// Returns the blob's bytes.
    pub async fn get_bytes(&self, id: &BlobId) -> BackendResult<Vec<u8>> {
        self.store.read(&blob_key(id)).await
    }

    /// Returns a reader over the blob's bytes.
    pub async fn open(&self, id: &BlobId) -> BackendResult<Pin<Box<dyn AsyncRead + Send>>> {
        self.store.open_read(&blob_key(id)).await
    }

    /// Whether the blob is present.
    pub async fn has(&self, id: &BlobId) -> BackendResult<bool> {
        self.store.exists(&blob_key(id)).await
    }

    /// Removes the blob. The caller is responsible for making sure no live
    /// commit still references it.
    pub async fn delete(&self, id: &BlobId) -> BackendResult<()> {
        self.store.delete(&blob_key(id)).await
    }

    /// Ids of every blob in the store.
    pub async fn list(&self) -> BackendResult<Vec<BlobId>> {
        let keys: Vec<String> = self.store.list(BLOB_KEY_PREFIX).try_collect().await?;
        Ok(keys.iter().filter_map(|key| blob_id_from_key(key)).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pollster::FutureExt as _;

    use super::*;
    use crate::memory_store::MemoryStore;

    // SHA-256 of b"hello".
    const HELLO_HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn new_content_store() -> ContentStore {
        ContentStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_put_bytes_round_trip() {
        let store = new_content_store();
        let id = store.put_bytes(b"hello").block_on().unwrap();
        assert_eq!(id.hex(), HELLO_HASH);
        assert_eq!(store.get_bytes(&id).block_on().unwrap(), b"hello");
        assert!(store.has(&id).block_on().unwrap());
    }

    #[test]
    fn test_put_stream_matches_put_bytes() {
        let store = new_content_store();
        let data = b"streamed contents that are hashed chunk by chunk".to_vec();
        let mut reader = Cursor::new(data.clone());
        let id = store.put_stream(&mut reader).block_on().unwrap();
        assert_eq!(id, store.put_bytes(&data).block_on().unwrap());
        assert_eq!(store.get_bytes(&id).block_on().unwrap(), data);
        // No staging leftovers.
        assert_eq!(store.list().block_on().unwrap().len(), 1);
    }

    #[test]
    fn test_put_is_deduplicating() {
        let store = new_content_store();
        let id1 = store.put_bytes(b"same").block_on().unwrap();
        let id2 = store.put_bytes(b"same").block_on().unwrap();
        let mut reader = Cursor::new(b"same".to_vec());
        let id3 = store.put_stream(&mut reader).block_on().unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1, id3);
        assert_eq!(store.list().block_on().unwrap(), vec![id1]);
    }

    #[test]
    fn test_blob_key_layout() {
        let id = BlobId::from_hex(HELLO_HASH);
        assert_eq!(
            blob_key(&id),
            format!("data/2c/{}", &HELLO_HASH[2..])
        );
        assert_eq!(blob_id_from_key(&blob_key(&id)), Some(id));
        assert_eq!(blob_id_from_key("data/2c"), None);
        assert_eq!(blob_id_from_key("staging/123-0"), None);
    }

    #[test]
    fn test_delete() {
        let store = new_content_store();
        let id = store.put_bytes(b"gone soon").block_on().unwrap();
        store.delete(&id).block_on().unwrap();
        assert!(!store.has(&id).block_on().unwrap());
        assert!(store.list().block_on().unwrap().is_empty());
    }
}
