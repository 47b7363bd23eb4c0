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

//! The catalog: every dataset under one storage root.
//!
//! Datasets are a directory convention, `datasets/<name>/` under the root;
//! a dataset appears in listings once its commit log exists. The catalog
//! also routes cross-dataset queries through the file index.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use futures::TryStreamExt as _;
use pollster::FutureExt as _;

use crate::artifact::SerializerRegistry;
use crate::commit::Commit;
use crate::commit_store::CommitStore;
use crate::dataset::Dataset;
use crate::dataset::DatasetResult;
use crate::file_index::FileIndex;
use crate::file_index::IndexEntry;
use crate::object_id::BlobId;
use crate::object_store::BackendInitError;
use crate::object_store::BackendResult;
use crate::object_store::ObjectStore;
use crate::object_store::StoreCredentials;
use crate::object_store::open_object_store;

const DATASETS_KEY_PREFIX: &str = "datasets/";

/// Names of all datasets with a commit log under the root.
pub(crate) async fn list_dataset_names(store: &dyn ObjectStore) -> BackendResult<Vec<String>> {
    let keys: Vec<String> = store.list(DATASETS_KEY_PREFIX).try_collect().await?;
    let names: BTreeSet<String> = keys
        .iter()
        .filter_map(|key| {
            let rest = key.strip_prefix(DATASETS_KEY_PREFIX)?;
            let (name, file) = rest.split_once('/')?;
            (file == "commits.json").then(|| name.to_string())
        })
        .collect();
    Ok(names.into_iter().collect())
}

/// The set of datasets discoverable under one storage root.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn ObjectStore>,
    file_index: FileIndex,
    serializers: SerializerRegistry,
}

impl Catalog {
    /// Opens the catalog at the storage location named by `uri`.
    pub fn open(uri: &str, credentials: &StoreCredentials) -> Result<Self, BackendInitError> {
        Ok(Self::with_store(open_object_store(uri, credentials)?))
    }

    /// Wraps an already-constructed object store.
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            file_index: FileIndex::new(store.clone()),
            store,
            serializers: SerializerRegistry::new(),
        }
    }

    /// The underlying object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Artifact serializers handed to every dataset this catalog opens.
    pub fn serializers_mut(&mut self) -> &mut SerializerRegistry {
        &mut self.serializers
    }

    /// Dataset names under the root, sorted. A dataset created by
    /// [`get_dataset`](Self::get_dataset) shows up here after its first
    /// commit.
    pub fn list_datasets(&self) -> DatasetResult<Vec<String>> {
        self.list_datasets_async().block_on()
    }

    pub async fn list_datasets_async(&self) -> DatasetResult<Vec<String>> {
        Ok(list_dataset_names(self.store.as_ref()).await?)
    }

    /// Opens the named dataset. Creation is lazy: nothing is written until
    /// its first commit.
    pub fn get_dataset(&self, name: &str) -> DatasetResult<Dataset> {
        self.get_dataset_async(name).block_on()
    }

    pub async fn get_dataset_async(&self, name: &str) -> DatasetResult<Dataset> {
        let mut dataset = Dataset::open_async(self.store.clone(), name).await?;
        dataset.set_serializers(self.serializers.clone());
        Ok(dataset)
    }

    /// All datasets referencing the blob, via the file index.
    pub fn find_datasets_with_file(
        &self,
        hash: &BlobId,
    ) -> DatasetResult<BTreeMap<String, Vec<IndexEntry>>> {
        self.find_datasets_with_file_async(hash).block_on()
    }

    pub async fn find_datasets_with_file_async(
        &self,
        hash: &BlobId,
    ) -> DatasetResult<BTreeMap<String, Vec<IndexEntry>>> {
        Ok(self.file_index.lookup(hash).await?)
    }

    /// Rebuilds the file index from every dataset's commit log, dropping
    /// whatever the incremental best-effort updates left behind.
    pub fn rebuild_file_index(&self) -> DatasetResult<()> {
        self.rebuild_file_index_async().block_on()
    }

    pub async fn rebuild_file_index_async(&self) -> DatasetResult<()> {
        let mut histories: Vec<(String, Vec<Commit>)> = Vec::new();
        for name in self.list_datasets_async().await? {
            let commits = CommitStore::new(self.store.clone(), name.clone())
                .load()
                .await?;
            histories.push((name, commits));
        }
        self.file_index
            .rebuild(
                histories
                    .iter()
                    .map(|(name, commits)| (name.as_str(), commits.as_slice())),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
