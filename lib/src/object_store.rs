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

use std::any::Any;
use std::fmt::Debug;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::local_store::LocalStore;
use crate::memory_store::MemoryStore;

/// Error that may occur while constructing a store from a URI.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct BackendInitError(pub Box<dyn std::error::Error + Send + Sync>);

/// Object-store error that may occur after the store is constructed.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Object {key} not found")]
    ObjectNotFound {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when reading object {key}")]
    ReadObject {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Could not write object {key}")]
    WriteObject {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Could not delete object {key}")]
    DeleteObject {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when listing objects under {prefix}")]
    ListObjects {
        prefix: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A conditional write observed different content than the caller
    /// expected. Another writer got there first.
    #[error("Conditional write of {key} lost a race with another writer")]
    PreconditionFailed { key: String },
    /// A valid operation attempted, but failed because it isn't supported by
    /// the particular backend.
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Defines the interface for key→bytes object stores.
///
/// Keys are "/"-separated logical paths relative to the store root. The
/// engine only emits ASCII hex digests and filenames under its own control;
/// encoding of anything else is the backend's concern.
#[async_trait]
pub trait ObjectStore: Any + Send + Sync + Debug {
    /// A unique name that identifies this kind of store.
    fn name(&self) -> &str;

    async fn read(&self, key: &str) -> BackendResult<Vec<u8>>;

    async fn open_read(&self, key: &str) -> BackendResult<Pin<Box<dyn AsyncRead + Send>>>;

    /// Writes `data` at `key`, replacing any previous object.
    ///
    /// Writes are atomic-or-retry: a failure must not leave a partial object
    /// visible at `key`. Local stores achieve this by writing to a temporary
    /// file and renaming within the target directory; object stores by
    /// single-request or multipart-then-finalize uploads.
    async fn write(&self, key: &str, data: &[u8]) -> BackendResult<()>;

    /// Streaming variant of [`write`](Self::write); consumes `contents` to
    /// EOF. The same atomicity rule applies.
    async fn write_from(
        &self,
        key: &str,
        contents: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BackendResult<()>;

    /// Writes `data` at `key` only if the current content equals `expected`
    /// (`None` means the key must not exist yet).
    ///
    /// Fails with [`BackendError::PreconditionFailed`] when another writer
    /// changed the object in between, and with [`BackendError::Unsupported`]
    /// on backends without compare-and-set semantics.
    async fn write_conditional(
        &self,
        key: &str,
        data: &[u8],
        expected: Option<&[u8]>,
    ) -> BackendResult<()>;

    async fn exists(&self, key: &str) -> BackendResult<bool>;

    /// Deletes the object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// Moves the object at `from` to `to`, replacing any previous object at
    /// `to`. Backends without native rename may copy-then-delete; the copy
    /// must still appear atomically at `to`.
    async fn rename(&self, from: &str, to: &str) -> BackendResult<()>;

    /// All keys starting with `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> BoxStream<'_, BackendResult<String>>;
}

impl dyn ObjectStore {
    /// Returns reference of the implementation type.
    pub fn downcast_ref<T: ObjectStore>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}

/// Opaque credentials handed to cloud backends. Acquisition and refresh of
/// these values is the caller's concern.
#[derive(Clone, Default)]
pub struct StoreCredentials {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    /// Azure storage account name.
    pub account: Option<String>,
}

impl Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
#[error("Invalid storage URI {uri}: {reason}")]
pub struct UriParseError {
    pub uri: String,
    pub reason: String,
}

/// A parsed storage location. The scheme selects the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreUri {
    /// `file://<path>` or a bare filesystem path.
    Local(PathBuf),
    /// `memory://<name>`; state is private to the opened store instance.
    Memory(String),
    /// `s3://bucket/prefix`
    S3 { bucket: String, prefix: String },
    /// `gs://bucket/prefix`
    Gcs { bucket: String, prefix: String },
    /// `az://container/prefix`
    Azure { container: String, prefix: String },
}

impl StoreUri {
    pub fn parse(uri: &str) -> Result<Self, UriParseError> {
        fn split_bucket(uri: &str, rest: &str) -> Result<(String, String), UriParseError> {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(UriParseError {
                    uri: uri.to_string(),
                    reason: "missing bucket name".to_string(),
                });
            }
            Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
        }

        if let Some(rest) = uri.strip_prefix("file://") {
            if rest.is_empty() {
                return Err(UriParseError {
                    uri: uri.to_string(),
                    reason: "missing path".to_string(),
                });
            }
            Ok(Self::Local(PathBuf::from(rest)))
        } else if let Some(rest) = uri.strip_prefix("memory://") {
            Ok(Self::Memory(rest.to_string()))
        } else if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = split_bucket(uri, rest)?;
            Ok(Self::S3 { bucket, prefix })
        } else if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, prefix) = split_bucket(uri, rest)?;
            Ok(Self::Gcs { bucket, prefix })
        } else if let Some(rest) = uri.strip_prefix("az://") {
            let (container, prefix) = split_bucket(uri, rest)?;
            Ok(Self::Azure {
                container,
                prefix,
            })
        } else if uri.contains("://") {
            Err(UriParseError {
                uri: uri.to_string(),
                reason: "unknown scheme".to_string(),
            })
        } else {
            // Bare paths mean local storage.
            Ok(Self::Local(PathBuf::from(uri)))
        }
    }
}

/// Constructs the object store selected by `uri`.
///
/// Credentials are ignored by the local and in-memory backends.
pub fn open_object_store(
    uri: &str,
    credentials: &StoreCredentials,
) -> Result<Arc<dyn ObjectStore>, BackendInitError> {
    let parsed = StoreUri::parse(uri).map_err(|err| BackendInitError(err.into()))?;
    match parsed {
        StoreUri::Local(path) => {
            let store = LocalStore::init(&path).map_err(|err| BackendInitError(err.into()))?;
            Ok(Arc::new(store))
        }
        StoreUri::Memory(_) => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "cloud")]
        StoreUri::S3 { .. } | StoreUri::Gcs { .. } | StoreUri::Azure { .. } => {
            let store = crate::cloud_store::CloudStore::from_uri(&parsed, credentials)
                .map_err(|err| BackendInitError(err.into()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "cloud"))]
        StoreUri::S3 { .. } | StoreUri::Gcs { .. } | StoreUri::Azure { .. } => {
            let _ = credentials;
            Err(BackendInitError(
                format!("{uri}: cloud backends require the \"cloud\" feature").into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local() {
        assert_eq!(
            StoreUri::parse("file:///var/data").unwrap(),
            StoreUri::Local(PathBuf::from("/var/data"))
        );
        assert_eq!(
            StoreUri::parse("relative/root").unwrap(),
            StoreUri::Local(PathBuf::from("relative/root"))
        );
    }

    #[test]
    fn test_parse_cloud() {
        assert_eq!(
            StoreUri::parse("s3://bucket/some/prefix").unwrap(),
            StoreUri::S3 {
                bucket: "bucket".to_string(),
                prefix: "some/prefix".to_string(),
            }
        );
        assert_eq!(
            StoreUri::parse("gs://bucket").unwrap(),
            StoreUri::Gcs {
                bucket: "bucket".to_string(),
                prefix: String::new(),
            }
        );
        assert_eq!(
            StoreUri::parse("az://container/p/").unwrap(),
            StoreUri::Azure {
                container: "container".to_string(),
                prefix: "p".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(StoreUri::parse("s3://").is_err());
        assert!(StoreUri::parse("ftp://host/x").is_err());
        assert!(StoreUri::parse("file://").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(
            StoreUri::parse("memory://scratch").unwrap(),
            StoreUri::Memory("scratch".to_string())
        );
    }
}
