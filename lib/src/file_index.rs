// Copyright 2024 The Kirin Authors
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

//! The cross-dataset reverse file index.
//!
//! Maps a blob hash to every (dataset, commit, filenames) that references
//! it, sharded as `index/files/{hh}/{rest}.json`. The index is advisory: it
//! is updated incrementally as a best-effort side effect of committing, and
//! [`FileIndex::rebuild`] reconstructs it from the commit logs, which remain
//! the source of truth.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use futures::TryStreamExt as _;
use serde::Deserialize;
use serde::Serialize;

use crate::commit::Commit;
use crate::commit::timestamp_format;
use crate::object_id::BlobId;
use crate::object_id::CommitId;
use crate::object_id::ObjectId as _;
use crate::object_store::BackendError;
use crate::object_store::BackendResult;
use crate::object_store::ObjectStore;

const INDEX_KEY_PREFIX: &str = "index/files/";

/// Returns the storage key of a blob's index shard.
pub fn shard_key(id: &BlobId) -> String {
    let hex = id.hex();
    format!("{INDEX_KEY_PREFIX}{}/{}.json", &hex[..2], &hex[2..])
}

/// One commit referencing the shard's blob within some dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub commit_hash: CommitId,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    /// Names the blob is bound to in that commit. Usually one, more when a
    /// commit holds the same content under several filenames.
    pub filenames: Vec<String>,
}

/// The on-disk shape of one index shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexShard {
    pub file_hash: BlobId,
    pub datasets: BTreeMap<String, Vec<IndexEntry>>,
}

impl IndexShard {
    fn new(file_hash: BlobId) -> Self {
        Self {
            file_hash,
            datasets: BTreeMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.datasets.values().all(Vec::is_empty)
    }

    fn record(
        &mut self,
        dataset: &str,
        commit_hash: &CommitId,
        timestamp: DateTime<Utc>,
        filename: &str,
    ) {
        let entries = self.datasets.entry(dataset.to_string()).or_default();
        if let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.commit_hash == *commit_hash)
        {
            if !entry.filenames.iter().any(|name| name == filename) {
                entry.filenames.push(filename.to_string());
            }
        } else {
            entries.push(IndexEntry {
                commit_hash: commit_hash.clone(),
                timestamp,
                filenames: vec![filename.to_string()],
            });
        }
    }
}

/// Reads and updates the sharded reverse index.
#[derive(Clone, Debug)]
pub struct FileIndex {
    store: Arc<dyn ObjectStore>,
}

impl FileIndex {
    /// Wraps the given object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn load_shard(&self, id: &BlobId) -> BackendResult<Option<IndexShard>> {
        match self.store.read(&shard_key(id)).await {
            Ok(raw) => {
                let shard = serde_json::from_slice(&raw)
                    .map_err(|err| BackendError::Other(Box::new(err)))?;
                Ok(Some(shard))
            }
            Err(BackendError::ObjectNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write_shard(&self, shard: &IndexShard) -> BackendResult<()> {
        let raw =
            serde_json::to_vec_pretty(shard).map_err(|err| BackendError::Other(Box::new(err)))?;
        self.store.write(&shard_key(&shard.file_hash), &raw).await
    }

    /// Records that `filename` with content `id` appears in the given commit
    /// of `dataset`.
    pub async fn record(
        &self,
        id: &BlobId,
        dataset: &str,
        commit_hash: &CommitId,
        timestamp: DateTime<Utc>,
        filename: &str,
    ) -> BackendResult<()> {
        let mut shard = self
            .load_shard(id)
            .await?
            .unwrap_or_else(|| IndexShard::new(id.clone()));
        shard.record(dataset, commit_hash, timestamp, filename);
        self.write_shard(&shard).await
    }

    /// Everything known to reference the blob, keyed by dataset name. Empty
    /// when the blob is unknown.
    pub async fn lookup(&self, id: &BlobId) -> BackendResult<BTreeMap<String, Vec<IndexEntry>>> {
        Ok(self
            .load_shard(id)
            .await?
            .map(|shard| shard.datasets)
            .unwrap_or_default())
    }

    /// Prunes index entries for the blob: all of them, one dataset's, or one
    /// commit's. The shard is deleted once nothing references the blob.
    pub async fn forget(
        &self,
        id: &BlobId,
        dataset: Option<&str>,
        commit_hash: Option<&CommitId>,
    ) -> BackendResult<()> {
        let Some(mut shard) = self.load_shard(id).await? else {
            return Ok(());
        };
        match (dataset, commit_hash) {
            (None, None) => {
                shard.datasets.clear();
            }
            (Some(dataset), None) => {
                shard.datasets.remove(dataset);
            }
            (Some(dataset), Some(commit_hash)) => {
                if let Some(entries) = shard.datasets.get_mut(dataset) {
                    entries.retain(|entry| entry.commit_hash != *commit_hash);
                    if entries.is_empty() {
                        shard.datasets.remove(dataset);
                    }
                }
            }
            (None, Some(commit_hash)) => {
                for entries in shard.datasets.values_mut() {
                    entries.retain(|entry| entry.commit_hash != *commit_hash);
                }
                shard.datasets.retain(|_, entries| !entries.is_empty());
            }
        }
        if shard.is_empty() {
            self.store.delete(&shard_key(id)).await
        } else {
            self.write_shard(&shard).await
        }
    }

    /// Rebuilds the whole index from commit logs.
    ///
    /// Existing shards are dropped first, so stale entries (from failed
    /// best-effort writes or deleted blobs) do not survive.
    pub async fn rebuild<'a>(
        &self,
        datasets: impl IntoIterator<Item = (&'a str, &'a [Commit])>,
    ) -> BackendResult<()> {
        let stale_keys: Vec<String> = self.store.list(INDEX_KEY_PREFIX).try_collect().await?;
        for key in &stale_keys {
            self.store.delete(key).await?;
        }

        let mut shards: BTreeMap<BlobId, IndexShard> = BTreeMap::new();
        for (dataset_name, commits) in datasets {
            for commit in commits {
                for entry in commit.files.values() {
                    shards
                        .entry(entry.hash.clone())
                        .or_insert_with(|| IndexShard::new(entry.hash.clone()))
                        .record(dataset_name, &commit.hash, commit.timestamp, &entry.name);
                }
            }
        }
        for shard in shards.values() {
            self.write_shard(shard).await?;
        }
        Ok(())
    }
}
