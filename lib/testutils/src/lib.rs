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

//! Test fixtures for the kirin-lib integration tests.

#![allow(missing_docs)]

use std::any::Any;
use std::sync::Arc;

use kirin_lib::artifact::ArtifactError;
use kirin_lib::artifact::ArtifactSerializer;
use kirin_lib::artifact::SerializedArtifact;
use kirin_lib::catalog::Catalog;
use kirin_lib::commit::Metadata;
use kirin_lib::dataset::CommitOptions;
use kirin_lib::dataset::Dataset;
use kirin_lib::dataset::FileSource;
use kirin_lib::local_store::LocalStore;
use kirin_lib::memory_store::MemoryStore;
use kirin_lib::object_id::CommitId;
use kirin_lib::object_store::ObjectStore;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("kirin-test-")
        .tempdir()
        .unwrap()
}

/// Backend flavors the shared test suites run against.
#[derive(Clone, Copy, Debug)]
pub enum TestBackend {
    Local,
    Memory,
}

/// A catalog over a fresh backend, plus the temp dir keeping a local backend
/// alive for the duration of the test.
pub struct TestCatalog {
    pub catalog: Catalog,
    _temp_dir: Option<TempDir>,
}

impl TestCatalog {
    pub fn init_with_backend(backend: TestBackend) -> Self {
        match backend {
            TestBackend::Local => Self::init_local(),
            TestBackend::Memory => Self::init_memory(),
        }
    }

    /// Catalog over a local store in a fresh temporary directory.
    pub fn init_local() -> Self {
        let temp_dir = new_temp_dir();
        let store = LocalStore::init(temp_dir.path()).unwrap();
        Self {
            catalog: Catalog::with_store(Arc::new(store)),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Catalog over an in-memory store.
    pub fn init_memory() -> Self {
        Self {
            catalog: Catalog::with_store(Arc::new(MemoryStore::new())),
            _temp_dir: None,
        }
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.catalog.store().clone()
    }
}

/// Commits the given in-memory files in one commit and returns its hash.
pub fn commit_files(dataset: &mut Dataset, message: &str, files: &[(&str, &[u8])]) -> CommitId {
    let options = CommitOptions {
        add_files: files
            .iter()
            .map(|(name, data)| FileSource::bytes(*name, *data))
            .collect(),
        ..Default::default()
    };
    dataset.commit(message, options).unwrap()
}

/// A stand-in for an in-process ML model: something the engine cannot store
/// without a registered serializer.
#[derive(Clone, Debug)]
pub struct ToyModel {
    pub learning_rate: f64,
    pub layers: u64,
}

/// Serializes [`ToyModel`]s and extracts their hyperparameters.
pub struct ToyModelSerializer;

impl ArtifactSerializer for ToyModelSerializer {
    fn can_serialize(&self, artifact: &dyn Any) -> bool {
        artifact.is::<ToyModel>()
    }

    fn serialize(
        &self,
        artifact: &dyn Any,
        name: Option<&str>,
    ) -> Result<SerializedArtifact, ArtifactError> {
        let model = artifact.downcast_ref::<ToyModel>().unwrap();
        let extracted: Metadata = serde_json::from_value(serde_json::json!({
            "learning_rate": model.learning_rate,
            "layers": model.layers,
        }))
        .unwrap();
        Ok(SerializedArtifact {
            filename: format!("{}.pkl", name.unwrap_or("model")),
            bytes: format!("{model:?}").into_bytes(),
            extracted_metadata: Some(extracted),
        })
    }
}
