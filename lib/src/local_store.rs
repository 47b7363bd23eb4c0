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

#![expect(missing_docs)]

use std::fs;
use std::fs::File;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream;
use futures::stream::BoxStream;
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;

use crate::file_util::BlockingAsyncReader;
use crate::file_util::persist_content_addressed_temp_file;
use crate::object_store::BackendError;
use crate::object_store::BackendResult;
use crate::object_store::ObjectStore;

fn map_not_found_err(err: io::Error, key: &str) -> BackendError {
    if err.kind() == io::ErrorKind::NotFound {
        BackendError::ObjectNotFound {
            key: key.to_string(),
            source: Box::new(err),
        }
    } else {
        BackendError::ReadObject {
            key: key.to_string(),
            source: Box::new(err),
        }
    }
}

fn write_err(err: impl Into<Box<dyn std::error::Error + Send + Sync>>, key: &str) -> BackendError {
    BackendError::WriteObject {
        key: key.to_string(),
        source: err.into(),
    }
}

/// Object store backed by a directory on the local filesystem.
///
/// Writes go to a temporary file in the destination directory and are
/// renamed into place, so a crashed writer never leaves a partial object
/// visible under its final key.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn name() -> &'static str {
        "local"
    }

    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn init(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn disk_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(key.split('/'));
        path
    }

    fn prepare_parent(&self, key: &str) -> BackendResult<PathBuf> {
        let path = self.disk_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| write_err("key has no parent directory", key))?;
        fs::create_dir_all(parent).map_err(|err| write_err(err, key))?;
        Ok(path)
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in dir.read_dir()? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, prefix, keys)?;
            } else {
                let rel = path.strip_prefix(&self.root).expect("entry under root");
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &str {
        Self::name()
    }

    async fn read(&self, key: &str) -> BackendResult<Vec<u8>> {
        fs::read(self.disk_path(key)).map_err(|err| map_not_found_err(err, key))
    }

    async fn open_read(&self, key: &str) -> BackendResult<Pin<Box<dyn AsyncRead + Send>>> {
        let file = File::open(self.disk_path(key)).map_err(|err| map_not_found_err(err, key))?;
        Ok(Box::pin(BlockingAsyncReader::new(file)))
    }

    async fn write(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        let path = self.prepare_parent(key)?;
        let dir = path.parent().expect("prepared parent");
        let mut temp_file = NamedTempFile::new_in(dir).map_err(|err| write_err(err, key))?;
        temp_file.write_all(data).map_err(|err| write_err(err, key))?;
        persist_content_addressed_temp_file(temp_file, &path)
            .map_err(|err| write_err(err, key))?;
        Ok(())
    }

    async fn write_from(
        &self,
        key: &str,
        contents: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BackendResult<()> {
        let path = self.prepare_parent(key)?;
        let dir = path.parent().expect("prepared parent");
        let temp_file = NamedTempFile::new_in(dir).map_err(|err| write_err(err, key))?;
        let mut file = temp_file.as_file();
        let mut buf: Vec<u8> = vec![0; 1 << 14];
        loop {
            let bytes_read = contents
                .read(&mut buf)
                .await
                .map_err(|err| write_err(err, key))?;
            if bytes_read == 0 {
                break;
            }
            file.write_all(&buf[..bytes_read])
                .map_err(|err| write_err(err, key))?;
        }
        file.flush().map_err(|err| write_err(err, key))?;
        persist_content_addressed_temp_file(temp_file, &path)
            .map_err(|err| write_err(err, key))?;
        Ok(())
    }

    async fn write_conditional(
        &self,
        key: &str,
        data: &[u8],
        expected: Option<&[u8]>,
    ) -> BackendResult<()> {
        // The filesystem offers no compare-and-set; the read and the rename
        // below are distinct operations and a concurrent writer can slip in
        // between. Single-writer-per-dataset is the documented requirement,
        // this check only narrows the window.
        let current = match fs::read(self.disk_path(key)) {
            Ok(data) => Some(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(map_not_found_err(err, key)),
        };
        if current.as_deref() != expected {
            return Err(BackendError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        self.write(key, data).await
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.disk_path(key).is_file())
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let path = self.disk_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                // Drop the containing directory when this was its last
                // object; harmless to fail while the directory is shared.
                if let Some(parent) = path.parent() {
                    let _ = fs::remove_dir(parent);
                }
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackendError::DeleteObject {
                key: key.to_string(),
                source: Box::new(err),
            }),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        let to_path = self.prepare_parent(to)?;
        fs::rename(self.disk_path(from), to_path).map_err(|err| write_err(err, to))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> BoxStream<'_, BackendResult<String>> {
        // The walk starts at the deepest directory implied by the prefix so
        // listing "data/ab" doesn't scan the whole store.
        let dir_part = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let start_dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.disk_path(dir_part)
        };
        let mut keys = Vec::new();
        let result = if start_dir.is_dir() {
            self.collect_keys(&start_dir, prefix, &mut keys)
        } else {
            Ok(())
        };
        match result {
            Ok(()) => Box::pin(stream::iter(keys.into_iter().map(Ok))),
            Err(err) => Box::pin(stream::iter([Err(BackendError::ListObjects {
                prefix: prefix.to_string(),
                source: Box::new(err),
            })])),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::TryStreamExt as _;
    use pollster::FutureExt as _;

    use super::*;

    fn new_store() -> (tempfile::TempDir, LocalStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::init(temp_dir.path()).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_temp_dir, store) = new_store();
        store.write("data/ab/cdef", b"payload").block_on().unwrap();
        assert_eq!(store.read("data/ab/cdef").block_on().unwrap(), b"payload");
        assert!(store.exists("data/ab/cdef").block_on().unwrap());
        assert!(!store.exists("data/ab/0000").block_on().unwrap());
    }

    #[test]
    fn test_read_missing_key() {
        let (_temp_dir, store) = new_store();
        assert_matches!(
            store.read("nope").block_on(),
            Err(BackendError::ObjectNotFound { .. })
        );
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_temp_dir, store) = new_store();
        store.write("a/b", b"x").block_on().unwrap();
        store.delete("a/b").block_on().unwrap();
        store.delete("a/b").block_on().unwrap();
        assert!(!store.exists("a/b").block_on().unwrap());
    }

    #[test]
    fn test_list_prefix() {
        let (_temp_dir, store) = new_store();
        store.write("data/ab/1", b"1").block_on().unwrap();
        store.write("data/ab/2", b"2").block_on().unwrap();
        store.write("data/cd/3", b"3").block_on().unwrap();
        store.write("datasets/d/commits.json", b"{}").block_on().unwrap();

        let mut keys: Vec<String> = store.list("data/").try_collect().block_on().unwrap();
        keys.sort();
        assert_eq!(keys, ["data/ab/1", "data/ab/2", "data/cd/3"]);

        let keys: Vec<String> = store.list("data/ab/").try_collect().block_on().unwrap();
        assert_eq!(keys.len(), 2);

        let keys: Vec<String> = store.list("missing/").try_collect().block_on().unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_write_conditional() {
        let (_temp_dir, store) = new_store();
        store.write_conditional("k", b"v1", None).block_on().unwrap();
        assert_matches!(
            store.write_conditional("k", b"v2", None).block_on(),
            Err(BackendError::PreconditionFailed { .. })
        );
        store
            .write_conditional("k", b"v2", Some(b"v1"))
            .block_on()
            .unwrap();
        assert_eq!(store.read("k").block_on().unwrap(), b"v2");
    }

    #[test]
    fn test_rename() {
        let (_temp_dir, store) = new_store();
        store.write("staging/x", b"blob").block_on().unwrap();
        store.rename("staging/x", "data/ab/x").block_on().unwrap();
        assert!(!store.exists("staging/x").block_on().unwrap());
        assert_eq!(store.read("data/ab/x").block_on().unwrap(), b"blob");
    }
}
