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

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use futures::stream::BoxStream;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;

use crate::object_store::BackendError;
use crate::object_store::BackendResult;
use crate::object_store::ObjectStore;

type MemoryStoreData = BTreeMap<String, Vec<u8>>;

/// Object store keeping everything in process memory.
///
/// Clones share the underlying map, so a catalog and the datasets it hands
/// out observe each other's writes. Mainly useful for tests and ephemeral
/// pipelines. Unlike the filesystem backend this one has real
/// compare-and-set: conditional writes are checked under the map lock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<MemoryStoreData>>,
}

impl MemoryStore {
    pub fn name() -> &'static str {
        "memory"
    }

    pub fn new() -> Self {
        Self::default()
    }
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        Self::name()
    }

    async fn read(&self, key: &str) -> BackendResult<Vec<u8>> {
        let locked_data = self.data.lock().unwrap();
        locked_data
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::ObjectNotFound {
                key: key.to_string(),
                source: "no such key".into(),
            })
    }

    async fn open_read(&self, key: &str) -> BackendResult<Pin<Box<dyn AsyncRead + Send>>> {
        let data = self.read(key).await?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn write(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        let mut locked_data = self.data.lock().unwrap();
        locked_data.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn write_from(
        &self,
        key: &str,
        contents: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BackendResult<()> {
        let mut data = Vec::new();
        contents
            .read_to_end(&mut data)
            .await
            .map_err(|err| BackendError::WriteObject {
                key: key.to_string(),
                source: Box::new(err),
            })?;
        self.write(key, &data).await
    }

    async fn write_conditional(
        &self,
        key: &str,
        data: &[u8],
        expected: Option<&[u8]>,
    ) -> BackendResult<()> {
        let mut locked_data = self.data.lock().unwrap();
        if locked_data.get(key).map(Vec::as_slice) != expected {
            return Err(BackendError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        locked_data.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        let mut locked_data = self.data.lock().unwrap();
        let data = locked_data
            .remove(from)
            .ok_or_else(|| BackendError::ObjectNotFound {
                key: from.to_string(),
                source: "no such key".into(),
            })?;
        locked_data.insert(to.to_string(), data);
        Ok(())
    }

    fn list(&self, prefix: &str) -> BoxStream<'_, BackendResult<String>> {
        let locked_data = self.data.lock().unwrap();
        let keys: Vec<_> = locked_data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| Ok(key.clone()))
            .collect();
        Box::pin(stream::iter(keys))
    }
}
