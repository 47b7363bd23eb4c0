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

//! The per-dataset commit log.
//!
//! All commits of a dataset live in a single JSON document at
//! `datasets/{name}/commits.json`, ordered oldest to newest. The document is
//! append-only: `append()` is a read-modify-write of the whole document, and
//! nothing ever amends or deletes an existing entry.

#![expect(missing_docs)]

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::commit::Commit;
use crate::commit::Metadata;
use crate::object_id::CommitId;
use crate::object_store::BackendError;
use crate::object_store::ObjectStore;

/// Storage key of a dataset's commit log.
pub fn commit_log_key(dataset_name: &str) -> String {
    format!("datasets/{dataset_name}/commits.json")
}

/// The on-disk shape of `commits.json`. Unknown top-level keys survive a
/// rewrite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitLog {
    pub dataset_name: String,
    pub commits: Vec<Commit>,
    #[serde(flatten, default, skip_serializing_if = "Metadata::is_empty")]
    pub extra: Metadata,
}

#[derive(Debug, Error)]
pub enum CommitStoreError {
    /// The log document exists but cannot be parsed.
    #[error("Commit log of dataset {name} is corrupt")]
    Corrupt {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The new log document could not be written. Prior state is intact and
    /// the caller may retry the commit.
    #[error("Could not persist commit log of dataset {name}")]
    Persist {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// An optimistic write lost a race with another writer on the same
    /// dataset.
    #[error("Concurrent write to the commit log of dataset {name}")]
    ConcurrentWrite { name: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type CommitStoreResult<T> = Result<T, CommitStoreError>;

/// Reads and appends to one dataset's commit log.
#[derive(Clone, Debug)]
pub struct CommitStore {
    store: Arc<dyn ObjectStore>,
    dataset_name: String,
}

impl CommitStore {
    /// Creates a store view for the named dataset. Nothing is written until
    /// the first [`append`](Self::append).
    pub fn new(store: Arc<dyn ObjectStore>, dataset_name: impl Into<String>) -> Self {
        Self {
            store,
            dataset_name: dataset_name.into(),
        }
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    fn key(&self) -> String {
        commit_log_key(&self.dataset_name)
    }

    fn parse(&self, raw: &[u8]) -> CommitStoreResult<CommitLog> {
        serde_json::from_slice(raw).map_err(|err| CommitStoreError::Corrupt {
            name: self.dataset_name.clone(),
            source: Box::new(err),
        })
    }

    /// The log document plus its raw bytes, or `None` if the dataset has no
    /// commits yet. The raw bytes serve as the conditional-write token.
    async fn load_raw(&self) -> CommitStoreResult<Option<(CommitLog, Vec<u8>)>> {
        match self.store.read(&self.key()).await {
            Ok(raw) => {
                let log = self.parse(&raw)?;
                Ok(Some((log, raw)))
            }
            Err(BackendError::ObjectNotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// All commits, oldest first; empty if the document is absent.
    pub async fn load(&self) -> CommitStoreResult<Vec<Commit>> {
        Ok(self
            .load_raw()
            .await?
            .map(|(log, _)| log.commits)
            .unwrap_or_default())
    }

    /// Whether the commit log document exists.
    pub async fn exists(&self) -> CommitStoreResult<bool> {
        Ok(self.store.exists(&self.key()).await?)
    }

    /// Appends `commit` to the log.
    ///
    /// The commit's `parent_hash` must equal the hash of the current tail
    /// (or be `None` on an empty log); anything else means another writer
    /// extended the log since the caller loaded it. Uses a conditional write
    /// where the backend supports one; either way a failure leaves the prior
    /// document intact.
    pub async fn append(&self, commit: &Commit) -> CommitStoreResult<()> {
        let loaded = self.load_raw().await?;
        let (mut log, expected) = match loaded {
            Some((log, raw)) => (log, Some(raw)),
            None => (
                CommitLog {
                    dataset_name: self.dataset_name.clone(),
                    commits: vec![],
                    extra: Metadata::new(),
                },
                None,
            ),
        };

        let tail = log.commits.last().map(|tip| &tip.hash);
        if commit.parent_hash.as_ref() != tail {
            return Err(CommitStoreError::ConcurrentWrite {
                name: self.dataset_name.clone(),
            });
        }

        log.commits.push(commit.clone());
        let serialized =
            serde_json::to_vec_pretty(&log).map_err(|err| CommitStoreError::Persist {
                name: self.dataset_name.clone(),
                source: Box::new(err),
            })?;

        let key = self.key();
        match self
            .store
            .write_conditional(&key, &serialized, expected.as_deref())
            .await
        {
            Ok(()) => Ok(()),
            Err(BackendError::PreconditionFailed { .. }) => {
                Err(CommitStoreError::ConcurrentWrite {
                    name: self.dataset_name.clone(),
                })
            }
            Err(BackendError::Unsupported(_)) => {
                debug!(
                    dataset = %self.dataset_name,
                    "backend has no conditional writes, falling back to plain write"
                );
                self.store
                    .write(&key, &serialized)
                    .await
                    .map_err(|err| CommitStoreError::Persist {
                        name: self.dataset_name.clone(),
                        source: Box::new(err),
                    })
            }
            Err(err) => Err(CommitStoreError::Persist {
                name: self.dataset_name.clone(),
                source: Box::new(err),
            }),
        }
    }

    /// The commit with the given hash, if present.
    pub async fn get(&self, hash: &CommitId) -> CommitStoreResult<Option<Commit>> {
        let commits = self.load().await?;
        Ok(commits.into_iter().find(|commit| commit.hash == *hash))
    }

    /// The newest commit, if any.
    pub async fn head(&self) -> CommitStoreResult<Option<Commit>> {
        let commits = self.load().await?;
        Ok(commits.into_iter().next_back())
    }
}
