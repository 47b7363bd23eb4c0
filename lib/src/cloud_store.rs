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

use std::fmt::Debug;
use std::fmt::Formatter;
use std::io;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use async_trait::async_trait;
use futures::stream;
use futures::stream::BoxStream;
use futures::stream::StreamExt as _;
use opendal::Operator;
use opendal::services;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;
use tokio::io::ReadBuf;

use crate::object_store::BackendError;
use crate::object_store::BackendResult;
use crate::object_store::ObjectStore;
use crate::object_store::StoreCredentials;
use crate::object_store::StoreUri;

fn map_opendal_err(err: opendal::Error, key: &str) -> BackendError {
    if err.kind() == opendal::ErrorKind::NotFound {
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

fn map_write_err(err: opendal::Error, key: &str) -> BackendError {
    BackendError::WriteObject {
        key: key.to_string(),
        source: Box::new(err),
    }
}

/// Object store over a cloud bucket (S3, GCS, or Azure Blob Storage).
///
/// One implementation covers all three services; the parsed URI picks the
/// service and `StoreCredentials` is mapped onto its builder options.
/// Uploads are single-request or multipart-then-finalize, so a failed write
/// never leaves a partial object visible.
pub struct CloudStore {
    scheme: &'static str,
    op: Operator,
}

impl CloudStore {
    pub fn from_uri(uri: &StoreUri, credentials: &StoreCredentials) -> Result<Self, opendal::Error> {
        match uri {
            StoreUri::S3 { bucket, prefix } => {
                let mut builder = services::S3::default()
                    .bucket(bucket)
                    .root(&format!("/{prefix}"));
                if let Some(region) = &credentials.region {
                    builder = builder.region(region);
                }
                if let Some(endpoint) = &credentials.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(access_key) = &credentials.access_key {
                    builder = builder.access_key_id(access_key);
                }
                if let Some(secret_key) = &credentials.secret_key {
                    builder = builder.secret_access_key(secret_key);
                }
                if let Some(token) = &credentials.session_token {
                    builder = builder.session_token(token);
                }
                Ok(Self {
                    scheme: "s3",
                    op: Operator::new(builder)?.finish(),
                })
            }
            StoreUri::Gcs { bucket, prefix } => {
                let mut builder = services::Gcs::default()
                    .bucket(bucket)
                    .root(&format!("/{prefix}"));
                if let Some(endpoint) = &credentials.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                // For GCS the secret slot carries the service-account
                // credential blob.
                if let Some(credential) = &credentials.secret_key {
                    builder = builder.credential(credential);
                }
                Ok(Self {
                    scheme: "gs",
                    op: Operator::new(builder)?.finish(),
                })
            }
            StoreUri::Azure { container, prefix } => {
                let mut builder = services::Azblob::default()
                    .container(container)
                    .root(&format!("/{prefix}"));
                if let Some(endpoint) = &credentials.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(account) = &credentials.account {
                    builder = builder.account_name(account);
                }
                if let Some(secret_key) = &credentials.secret_key {
                    builder = builder.account_key(secret_key);
                }
                Ok(Self {
                    scheme: "az",
                    op: Operator::new(builder)?.finish(),
                })
            }
            StoreUri::Local(_) | StoreUri::Memory(_) => Err(opendal::Error::new(
                opendal::ErrorKind::Unsupported,
                "not a cloud storage URI",
            )),
        }
    }
}

impl Debug for CloudStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("CloudStore")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

/// Adapts opendal's `futures`-flavored reader to `tokio::io::AsyncRead`.
struct CloudReader {
    inner: opendal::FuturesAsyncReader,
}

impl AsyncRead for CloudReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let inner = Pin::new(&mut self.get_mut().inner);
        match futures::AsyncRead::poll_read(inner, cx, buf.initialize_unfilled()) {
            Poll::Ready(Ok(num_bytes_read)) => {
                buf.advance(num_bytes_read);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[async_trait]
impl ObjectStore for CloudStore {
    fn name(&self) -> &str {
        self.scheme
    }

    async fn read(&self, key: &str) -> BackendResult<Vec<u8>> {
        let buffer = self
            .op
            .read(key)
            .await
            .map_err(|err| map_opendal_err(err, key))?;
        Ok(buffer.to_vec())
    }

    async fn open_read(&self, key: &str) -> BackendResult<Pin<Box<dyn AsyncRead + Send>>> {
        let meta = self
            .op
            .stat(key)
            .await
            .map_err(|err| map_opendal_err(err, key))?;
        let reader = self
            .op
            .reader(key)
            .await
            .map_err(|err| map_opendal_err(err, key))?;
        let inner = reader
            .into_futures_async_read(0..meta.content_length())
            .await
            .map_err(|err| map_opendal_err(err, key))?;
        Ok(Box::pin(CloudReader { inner }))
    }

    async fn write(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        self.op
            .write(key, data.to_vec())
            .await
            .map_err(|err| map_write_err(err, key))?;
        Ok(())
    }

    async fn write_from(
        &self,
        key: &str,
        contents: &mut (dyn AsyncRead + Send + Unpin),
    ) -> BackendResult<()> {
        let mut writer = self
            .op
            .writer(key)
            .await
            .map_err(|err| map_write_err(err, key))?;
        let mut buf: Vec<u8> = vec![0; 1 << 14];
        loop {
            let bytes_read = contents
                .read(&mut buf)
                .await
                .map_err(|err| BackendError::WriteObject {
                    key: key.to_string(),
                    source: Box::new(err),
                })?;
            if bytes_read == 0 {
                break;
            }
            writer
                .write(buf[..bytes_read].to_vec())
                .await
                .map_err(|err| map_write_err(err, key))?;
        }
        writer.close().await.map_err(|err| map_write_err(err, key))?;
        Ok(())
    }

    async fn write_conditional(
        &self,
        key: &str,
        _data: &[u8],
        _expected: Option<&[u8]>,
    ) -> BackendResult<()> {
        let _ = key;
        Err(BackendError::Unsupported(format!(
            "The {} backend doesn't support conditional writes",
            self.scheme
        )))
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.op
            .exists(key)
            .await
            .map_err(|err| map_opendal_err(err, key))
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.op
            .delete(key)
            .await
            .map_err(|err| BackendError::DeleteObject {
                key: key.to_string(),
                source: Box::new(err),
            })
    }

    async fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        // Buckets have no rename; server-side copy keeps the object from
        // round-tripping through this process.
        self.op
            .copy(from, to)
            .await
            .map_err(|err| map_write_err(err, to))?;
        self.op
            .delete(from)
            .await
            .map_err(|err| BackendError::DeleteObject {
                key: from.to_string(),
                source: Box::new(err),
            })?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> BoxStream<'_, BackendResult<String>> {
        let op = self.op.clone();
        let prefix = prefix.to_string();
        Box::pin(
            stream::once(async move {
                let listed = op.list_with(&prefix).recursive(true).await;
                match listed {
                    Ok(entries) => stream::iter(
                        entries
                            .into_iter()
                            .filter(|entry| entry.metadata().mode().is_file())
                            .map(|entry| Ok(entry.path().to_string()))
                            .collect::<Vec<BackendResult<String>>>(),
                    ),
                    Err(err) => stream::iter(vec![Err(BackendError::ListObjects {
                        prefix: prefix.clone(),
                        source: Box::new(err),
                    })]),
                }
            })
            .flatten(),
        )
    }
}
