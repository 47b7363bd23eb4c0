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

//! The public dataset API: a named, linear history of commits.
//!
//! A `Dataset` caches its commit list and a HEAD cursor. Committing always
//! extends the tail of the log; `checkout()` only moves the read view, so a
//! commit made while HEAD points at an older commit still chains onto the
//! newest one. One logical writer per dataset at a time is assumed; see
//! [`CommitStoreError::ConcurrentWrite`] for what happens when that is
//! violated on a backend with conditional writes.

#![expect(missing_docs)]

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use pollster::FutureExt as _;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::warn;

use crate::artifact::ArtifactError;
use crate::artifact::SerializerRegistry;
use crate::artifact::disambiguate_filename;
use crate::commit::Commit;
use crate::commit::FileEntry;
use crate::commit::Metadata;
use crate::commit::dedup_tags;
use crate::commit_store::CommitStore;
use crate::commit_store::CommitStoreError;
use crate::content_store::ContentStore;
use crate::diff;
use crate::diff::CommitDiff;
use crate::file_index::FileIndex;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::copy_async_to_sync;
use crate::object_id::BlobId;
use crate::object_id::CommitId;
use crate::object_id::ObjectId as _;
use crate::object_store::BackendError;
use crate::object_store::ObjectStore;

/// A violation of the store's integrity invariants, reported by
/// [`Dataset::verify`] and surfaced by read paths that trip over one.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Blob {blob} referenced by commit {commit} is missing")]
    MissingBlob { commit: String, blob: String },
    #[error("Commit {commit} recomputes to hash {computed}")]
    HashMismatch { commit: String, computed: String },
    #[error("Commit {commit} records parent {parent:?} but follows {expected:?}")]
    BrokenChain {
        commit: String,
        parent: Option<String>,
        expected: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Commit message must not be empty")]
    EmptyMessage,
    #[error("Invalid dataset name {name:?}")]
    InvalidName { name: String },
    #[error("Invalid filename {name:?}")]
    InvalidFilename { name: String },
    #[error("Commit would not change anything relative to its parent")]
    NoChanges,
    #[error("File {name} is not in the dataset")]
    FileNotInDataset { name: String },
    #[error("Unknown commit {hash}")]
    UnknownCommit { hash: String },
    #[error("File {name} is not valid UTF-8")]
    InvalidUtf8 {
        name: String,
        source: std::str::Utf8Error,
    },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    CommitStore(#[from] CommitStoreError),
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// One item to add in a commit.
pub enum FileSource {
    /// A filesystem path; the basename becomes the filename.
    Path(PathBuf),
    /// In-memory content under an explicit filename.
    Bytes { name: String, data: Vec<u8> },
    /// An in-process object serialized through the registered
    /// [`ArtifactSerializer`](crate::artifact::ArtifactSerializer)s. `name`
    /// is the caller's binding name for the object when known.
    Artifact {
        name: Option<String>,
        value: Box<dyn Any + Send>,
    },
}

impl FileSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn artifact(name: Option<&str>, value: Box<dyn Any + Send>) -> Self {
        Self::Artifact {
            name: name.map(str::to_string),
            value,
        }
    }
}

/// Everything a commit can change besides its message.
#[derive(Default)]
pub struct CommitOptions {
    pub add_files: Vec<FileSource>,
    /// Filenames to drop; each must exist in the parent commit.
    pub remove_files: Vec<String>,
    pub metadata: Metadata,
    /// Duplicates are removed preserving first occurrence.
    pub tags: Vec<String>,
}

/// Structural metadata filter for [`Dataset::find_commits`].
///
/// The structural forms are portable (they can cross an RPC boundary as
/// data); the predicate form is process-local.
#[derive(Clone, Default)]
pub enum MetadataFilter {
    #[default]
    Any,
    /// Dotted-path equality; every pair must match
    /// (`("models.m.lr", 0.1)` matches `{"models":{"m":{"lr":0.1}}}`).
    KeyEquals(Vec<(String, serde_json::Value)>),
    /// Arbitrary predicate over the commit's metadata.
    Predicate(Arc<dyn Fn(&Metadata) -> bool + Send + Sync>),
}

impl MetadataFilter {
    fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Self::Any => true,
            Self::KeyEquals(pairs) => pairs
                .iter()
                .all(|(path, want)| lookup_path(metadata, path) == Some(want)),
            Self::Predicate(predicate) => predicate(metadata),
        }
    }
}

fn lookup_path<'a>(metadata: &'a Metadata, path: &str) -> Option<&'a serde_json::Value> {
    let mut parts = path.split('.');
    let mut current = metadata.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Query over a dataset's history. Filters combine with AND.
#[derive(Clone, Default)]
pub struct FindQuery {
    /// Matching commits carry every one of these tags.
    pub tags: Vec<String>,
    pub metadata: MetadataFilter,
    /// Truncate the newest-first result to this many commits.
    pub limit: Option<usize>,
}

/// HEAD's files materialized to local paths, removed again when the value is
/// dropped - on every exit path, panics included.
pub struct LocalFiles {
    // Kept for its Drop impl, which deletes the directory.
    _dir: TempDir,
    paths: BTreeMap<String, PathBuf>,
}

impl LocalFiles {
    /// The local path of the named file.
    pub fn path(&self, name: &str) -> Option<&Path> {
        self.paths.get(name).map(PathBuf::as_path)
    }

    /// All materialized files, keyed by filename.
    pub fn paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// A named, linear history of commits in one storage root.
pub struct Dataset {
    name: String,
    store: Arc<dyn ObjectStore>,
    content_store: ContentStore,
    commit_store: CommitStore,
    file_index: FileIndex,
    serializers: SerializerRegistry,
    commits: Vec<Commit>,
    head: Option<usize>,
}

fn valid_dataset_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

fn valid_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

impl Dataset {
    /// Opens the named dataset in the given store, loading its history. A
    /// dataset that does not exist yet is empty until its first commit.
    pub fn open(store: Arc<dyn ObjectStore>, name: impl Into<String>) -> DatasetResult<Self> {
        Self::open_async(store, name).block_on()
    }

    pub async fn open_async(
        store: Arc<dyn ObjectStore>,
        name: impl Into<String>,
    ) -> DatasetResult<Self> {
        let name = name.into();
        if !valid_dataset_name(&name) {
            return Err(DatasetError::InvalidName { name });
        }
        let commit_store = CommitStore::new(store.clone(), name.clone());
        let commits = commit_store.load().await?;
        let head = commits.len().checked_sub(1);
        Ok(Self {
            name,
            content_store: ContentStore::new(store.clone()),
            commit_store,
            file_index: FileIndex::new(store.clone()),
            store,
            serializers: SerializerRegistry::new(),
            commits,
            head,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the dataset has any commits.
    pub fn exists(&self) -> bool {
        !self.commits.is_empty()
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.content_store
    }

    /// The serializer registry consulted for
    /// [`FileSource::Artifact`] additions.
    pub fn serializers_mut(&mut self) -> &mut SerializerRegistry {
        &mut self.serializers
    }

    pub(crate) fn set_serializers(&mut self, serializers: SerializerRegistry) {
        self.serializers = serializers;
    }

    /// The commit HEAD points at, if any.
    pub fn head(&self) -> Option<&Commit> {
        self.head.map(|i| &self.commits[i])
    }

    /// The newest commit, regardless of HEAD.
    pub fn latest(&self) -> Option<&Commit> {
        self.commits.last()
    }

    // ---- Committing ----

    /// Creates a commit on top of the current tail and returns its hash.
    ///
    /// The tail, not HEAD, is the parent: checking out an older commit only
    /// changes what reads see. Fails with [`DatasetError::NoChanges`] when
    /// files, metadata, and tags would all equal the parent's.
    pub fn commit(&mut self, message: &str, options: CommitOptions) -> DatasetResult<CommitId> {
        self.commit_async(message, options).block_on()
    }

    pub async fn commit_async(
        &mut self,
        message: &str,
        options: CommitOptions,
    ) -> DatasetResult<CommitId> {
        if message.is_empty() {
            return Err(DatasetError::EmptyMessage);
        }

        let parent = self.commits.last();
        let parent_hash = parent.map(|parent| parent.hash.clone());
        let mut files = parent.map(|parent| parent.files.clone()).unwrap_or_default();

        for name in &options.remove_files {
            if files.shift_remove(name).is_none() {
                return Err(DatasetError::FileNotInDataset { name: name.clone() });
            }
        }

        // Extracted model metadata, keyed by the artifact's name.
        let mut extracted: BTreeMap<String, Metadata> = BTreeMap::new();
        let mut artifact_filenames: HashSet<String> = HashSet::new();
        for source in options.add_files {
            let entry = match source {
                FileSource::Path(path) => self.ingest_path(&path).await?,
                FileSource::Bytes { name, data } => self.ingest_bytes(name, &data).await?,
                FileSource::Artifact { name, value } => {
                    let serialized = self
                        .serializers
                        .serialize(value.as_ref(), name.as_deref())?;
                    let filename = if name.is_some() {
                        serialized.filename
                    } else {
                        // Anonymous artifacts fall back to a fixed stem;
                        // keep several of them apart within this commit.
                        disambiguate_filename(&serialized.filename, &artifact_filenames)
                    };
                    artifact_filenames.insert(filename.clone());
                    if let Some(metadata) = serialized.extracted_metadata {
                        let model_name = name.clone().unwrap_or_else(|| {
                            filename.rsplit_once('.').map_or(filename.as_str(), |(stem, _)| stem).to_string()
                        });
                        extracted.insert(model_name, metadata);
                    }
                    self.ingest_bytes(filename, &serialized.bytes).await?
                }
            };
            // Within one call, a later addition of the same filename wins.
            files.insert(entry.name.clone(), entry);
        }

        let metadata = merge_model_metadata(options.metadata, extracted);
        let tags = dedup_tags(options.tags);

        let unchanged = match parent {
            Some(parent) => {
                files == parent.files && metadata == parent.metadata && tags == parent.tags
            }
            None => files.is_empty() && metadata.is_empty() && tags.is_empty(),
        };
        if unchanged {
            return Err(DatasetError::NoChanges);
        }

        let commit = Commit::new(
            message.to_string(),
            chrono::Utc::now(),
            parent_hash,
            files,
            metadata,
            tags,
        );
        self.commit_store.append(&commit).await?;

        // Index updates are a best-effort side effect: the commit is already
        // durable, and a rebuild reconciles anything missed here.
        let parent_files = parent.map(|parent| &parent.files);
        for entry in commit.files.values() {
            let in_parent = parent_files
                .and_then(|files| files.get(&entry.name))
                .is_some_and(|parent_entry| parent_entry.hash == entry.hash);
            if in_parent {
                continue;
            }
            if let Err(err) = self
                .file_index
                .record(
                    &entry.hash,
                    &self.name,
                    &commit.hash,
                    commit.timestamp,
                    &entry.name,
                )
                .await
            {
                warn!(
                    dataset = %self.name,
                    filename = %entry.name,
                    error = %err,
                    "failed to update file index; run a rebuild to reconcile"
                );
            }
        }

        let hash = commit.hash.clone();
        self.commits.push(commit);
        self.head = Some(self.commits.len() - 1);
        Ok(hash)
    }

    async fn ingest_path(&self, path: &Path) -> DatasetResult<FileEntry> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| DatasetError::InvalidFilename {
                name: path.display().to_string(),
            })?
            .to_string();
        let size = std::fs::metadata(path).context(path)?.len();
        let hash = self.content_store.put_path(path).await?;
        Ok(self.make_entry(name, hash, size))
    }

    async fn ingest_bytes(&self, name: String, data: &[u8]) -> DatasetResult<FileEntry> {
        if !valid_filename(&name) {
            return Err(DatasetError::InvalidFilename { name });
        }
        let hash = self.content_store.put_bytes(data).await?;
        Ok(self.make_entry(name, hash, data.len() as u64))
    }

    fn make_entry(&self, name: String, hash: BlobId, size: u64) -> FileEntry {
        let content_type = mime_guess::from_path(&name).first_raw().map(str::to_string);
        FileEntry {
            hash,
            name,
            size,
            content_type,
        }
    }

    // ---- Checkout and file access ----

    /// Points HEAD at the given commit, or at the newest when `None`. A pure
    /// pointer move; no files are materialized and the log is untouched.
    pub fn checkout(&mut self, hash: Option<&CommitId>) -> DatasetResult<()> {
        match hash {
            None => {
                self.head = self.commits.len().checked_sub(1);
                Ok(())
            }
            Some(hash) => {
                let position = self
                    .commits
                    .iter()
                    .position(|commit| commit.hash == *hash)
                    .ok_or_else(|| DatasetError::UnknownCommit { hash: hash.hex() })?;
                self.head = Some(position);
                Ok(())
            }
        }
    }

    /// The HEAD commit's file map; empty if there are no commits.
    pub fn files(&self) -> indexmap::IndexMap<String, FileEntry> {
        self.head().map(|commit| commit.files.clone()).unwrap_or_default()
    }

    /// One file of the HEAD commit.
    pub fn get_file(&self, name: &str) -> Option<FileEntry> {
        self.head().and_then(|commit| commit.files.get(name).cloned())
    }

    fn file_entry(&self, name: &str) -> DatasetResult<FileEntry> {
        self.get_file(name)
            .ok_or_else(|| DatasetError::FileNotInDataset {
                name: name.to_string(),
            })
    }

    fn map_blob_err(&self, err: BackendError, entry: &FileEntry) -> DatasetError {
        match err {
            BackendError::ObjectNotFound { .. } => {
                let commit = self.head().expect("file implies a head commit");
                IntegrityError::MissingBlob {
                    commit: commit.hash.hex(),
                    blob: entry.hash.hex(),
                }
                .into()
            }
            err => err.into(),
        }
    }

    /// The file's bytes, streamed from the content store.
    pub fn read_file(&self, name: &str) -> DatasetResult<Vec<u8>> {
        self.read_file_async(name).block_on()
    }

    pub async fn read_file_async(&self, name: &str) -> DatasetResult<Vec<u8>> {
        let entry = self.file_entry(name)?;
        self.content_store
            .get_bytes(&entry.hash)
            .await
            .map_err(|err| self.map_blob_err(err, &entry))
    }

    /// The file's content as text.
    pub fn read_file_text(&self, name: &str) -> DatasetResult<String> {
        let data = self.read_file(name)?;
        match std::str::from_utf8(&data) {
            Ok(text) => Ok(text.to_string()),
            Err(source) => Err(DatasetError::InvalidUtf8 {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// A reader over the file's bytes. The handle is owned by the caller.
    pub fn open_file(&self, name: &str) -> DatasetResult<Pin<Box<dyn AsyncRead + Send>>> {
        self.open_file_async(name).block_on()
    }

    pub async fn open_file_async(
        &self,
        name: &str,
    ) -> DatasetResult<Pin<Box<dyn AsyncRead + Send>>> {
        let entry = self.file_entry(name)?;
        self.content_store
            .open(&entry.hash)
            .await
            .map_err(|err| self.map_blob_err(err, &entry))
    }

    /// Streams the file to `target` and returns the path written.
    pub fn download_file(&self, name: &str, target: &Path) -> DatasetResult<PathBuf> {
        self.download_file_async(name, target).block_on()
    }

    pub async fn download_file_async(&self, name: &str, target: &Path) -> DatasetResult<PathBuf> {
        let reader = self.open_file_async(name).await?;
        let mut file = File::create(target).context(target)?;
        copy_async_to_sync(reader, &mut file).await.context(target)?;
        Ok(target.to_path_buf())
    }

    /// Materializes HEAD's files into a temporary directory.
    ///
    /// The returned [`LocalFiles`] owns the directory and removes it when
    /// dropped, whichever way the scope exits.
    pub fn local_files(&self) -> DatasetResult<LocalFiles> {
        self.local_files_async().block_on()
    }

    pub async fn local_files_async(&self) -> DatasetResult<LocalFiles> {
        let dir = tempfile::Builder::new()
            .prefix("kirin-")
            .tempdir()
            .map_err(|err| BackendError::Other(Box::new(err)))?;
        let mut paths = BTreeMap::new();
        let files = self.files();
        for name in files.keys() {
            let target = dir.path().join(name);
            self.download_file_async(name, &target).await?;
            paths.insert(name.clone(), target);
        }
        Ok(LocalFiles { _dir: dir, paths })
    }

    // ---- History and queries ----

    /// Commits, newest first, optionally truncated.
    pub fn history(&self, limit: Option<usize>) -> Vec<Commit> {
        let mut commits: Vec<Commit> = self.commits.iter().rev().cloned().collect();
        if let Some(limit) = limit {
            commits.truncate(limit);
        }
        commits
    }

    /// The commit with the given hash, if present.
    pub fn get_commit(&self, hash: &CommitId) -> Option<&Commit> {
        self.commits.iter().find(|commit| commit.hash == *hash)
    }

    /// Commits matching the query, newest first.
    pub fn find_commits(&self, query: &FindQuery) -> Vec<Commit> {
        let mut matches: Vec<Commit> = self
            .commits
            .iter()
            .rev()
            .filter(|commit| commit.has_tags(&query.tags))
            .filter(|commit| query.metadata.matches(&commit.metadata))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        matches
    }

    /// Changes in `to` relative to `from`.
    pub fn compare_commits(&self, from: &CommitId, to: &CommitId) -> DatasetResult<CommitDiff> {
        let resolve = |hash: &CommitId| {
            self.get_commit(hash)
                .ok_or_else(|| DatasetError::UnknownCommit { hash: hash.hex() })
        };
        Ok(diff::compare_commits(resolve(from)?, resolve(to)?))
    }

    // ---- Maintenance ----

    /// Deletes every blob in the store that no commit of any dataset under
    /// this root references, and drops their index shards. Returns the
    /// number of blobs deleted.
    ///
    /// Advisory: a concurrent writer may be uploading a blob this walk
    /// classifies as orphaned. Quiesce writers before cleaning.
    pub fn cleanup_orphaned_files(&self) -> DatasetResult<usize> {
        self.cleanup_orphaned_files_async().block_on()
    }

    pub async fn cleanup_orphaned_files_async(&self) -> DatasetResult<usize> {
        // The commit logs, not the file index, decide liveness; the index is
        // advisory and may be stale in either direction.
        let mut live: HashSet<BlobId> = HashSet::new();
        for name in crate::catalog::list_dataset_names(self.store.as_ref()).await? {
            let commits = CommitStore::new(self.store.clone(), name).load().await?;
            for commit in &commits {
                live.extend(commit.referenced_blobs().cloned());
            }
        }

        let mut deleted = 0;
        for blob in self.content_store.list().await? {
            if live.contains(&blob) {
                continue;
            }
            self.content_store.delete(&blob).await?;
            if let Err(err) = self.file_index.forget(&blob, None, None).await {
                warn!(blob = %blob, error = %err, "failed to drop index shard of deleted blob");
            }
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Audits this dataset: recomputes every commit hash, checks the parent
    /// chain, and checks that every referenced blob is present. Returns all
    /// violations found rather than failing on the first.
    pub fn verify(&self) -> DatasetResult<Vec<IntegrityError>> {
        self.verify_async().block_on()
    }

    pub async fn verify_async(&self) -> DatasetResult<Vec<IntegrityError>> {
        let mut violations = Vec::new();
        let mut expected_parent: Option<&CommitId> = None;
        for commit in &self.commits {
            if !commit.verify_hash() {
                violations.push(IntegrityError::HashMismatch {
                    commit: commit.hash.hex(),
                    computed: commit.canonical_hash().hex(),
                });
            }
            if commit.parent_hash.as_ref() != expected_parent {
                violations.push(IntegrityError::BrokenChain {
                    commit: commit.hash.hex(),
                    parent: commit.parent_hash.as_ref().map(|p| p.hex()),
                    expected: expected_parent.map(|p| p.hex()),
                });
            }
            for blob in commit.referenced_blobs() {
                if !self.content_store.has(blob).await? {
                    violations.push(IntegrityError::MissingBlob {
                        commit: commit.hash.hex(),
                        blob: blob.hex(),
                    });
                }
            }
            expected_parent = Some(&commit.hash);
        }
        Ok(violations)
    }

    /// Blob hashes referenced by any commit of this dataset.
    pub fn referenced_blobs(&self) -> HashSet<BlobId> {
        self.commits
            .iter()
            .flat_map(|commit| commit.referenced_blobs().cloned())
            .collect()
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("commits", &self.commits.len())
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Files the auto-extracted model metadata under `metadata.models.<name>`,
/// letting caller-supplied values shallowly override extracted ones. All
/// other metadata keys pass through untouched.
fn merge_model_metadata(user: Metadata, extracted: BTreeMap<String, Metadata>) -> Metadata {
    if extracted.is_empty() {
        return user;
    }
    let mut result = user;
    let user_models = match result.get("models").and_then(|v| v.as_object()) {
        Some(models) => models.clone(),
        None => Metadata::new(),
    };
    let mut models = Metadata::new();
    for (model_name, extracted_fields) in extracted {
        let mut merged = extracted_fields;
        if let Some(overrides) = user_models.get(&model_name).and_then(|v| v.as_object()) {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        models.insert(model_name, serde_json::Value::Object(merged));
    }
    for (model_name, value) in user_models {
        models.entry(model_name).or_insert(value);
    }
    result.insert("models".to_string(), serde_json::Value::Object(models));
    result
}
