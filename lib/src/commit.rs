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

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use itertools::Itertools as _;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest as _;
use sha2::Sha256;

use crate::object_id::BlobId;
use crate::object_id::CommitId;
use crate::object_id::ObjectId as _;

/// Commit metadata: an arbitrary JSON object, opaque to the engine but
/// queryable.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Timestamp (de)serialization used in commit records and index shards.
///
/// Serialization always emits UTC with microsecond precision
/// (`2026-01-02T03:04:05.123456Z`); this exact rendering is also the form
/// hashed into commit ids, so it must never change. Parsing accepts any
/// RFC 3339 offset and precision.
pub mod timestamp_format {
    use chrono::DateTime;
    use chrono::Utc;
    use serde::Deserialize as _;

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn format(timestamp: &DateTime<Utc>) -> String {
        timestamp.format(FORMAT).to_string()
    }

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format(timestamp))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        parse(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {value}")))
    }
}

/// A file at one point in history. Two entries with the same `hash` denote
/// identical content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub hash: BlobId,
    /// Original filename, extension included. The stored blob path has no
    /// extension.
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// A snapshot of filename→blob bindings plus metadata and tags.
///
/// Commits are immutable and form a linear chain through `parent_hash`;
/// `None` marks the first commit of a dataset. Keys we don't understand are
/// kept in `extra` and written back verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: CommitId,
    pub message: String,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    pub parent_hash: Option<CommitId>,
    pub files: IndexMap<String, FileEntry>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten, default, skip_serializing_if = "Metadata::is_empty")]
    pub extra: Metadata,
}

impl Commit {
    /// Builds a commit, computing its hash from the canonical serialization.
    pub fn new(
        message: String,
        timestamp: DateTime<Utc>,
        parent_hash: Option<CommitId>,
        files: IndexMap<String, FileEntry>,
        metadata: Metadata,
        tags: Vec<String>,
    ) -> Self {
        let mut commit = Self {
            hash: CommitId::new(vec![]),
            message,
            timestamp,
            parent_hash,
            files,
            metadata,
            tags,
            extra: Metadata::new(),
        };
        commit.hash = commit.canonical_hash();
        commit
    }

    /// The canonical hash: SHA-256 over the sorted file hashes joined by
    /// newlines, then the message, the parent hash (or empty), and the
    /// timestamp, each on its own line.
    ///
    /// Metadata and tags are deliberately not part of the preimage; two
    /// commits with identical content, message, parent, and timestamp
    /// collide by design.
    pub fn canonical_hash(&self) -> CommitId {
        let mut file_hashes: Vec<String> =
            self.files.values().map(|entry| entry.hash.hex()).collect();
        file_hashes.sort_unstable();
        let parent = self
            .parent_hash
            .as_ref()
            .map(|parent| parent.hex())
            .unwrap_or_default();
        let preimage = format!(
            "{}\n{}\n{}\n{}",
            file_hashes.join("\n"),
            self.message,
            parent,
            timestamp_format::format(&self.timestamp),
        );
        CommitId::new(Sha256::digest(preimage.as_bytes()).to_vec())
    }

    /// Whether the stored hash matches a recomputation from the commit's
    /// content.
    pub fn verify_hash(&self) -> bool {
        self.canonical_hash() == self.hash
    }

    /// Hashes of all blobs this commit references.
    pub fn referenced_blobs(&self) -> impl Iterator<Item = &BlobId> {
        self.files.values().map(|entry| &entry.hash)
    }

    /// Whether this commit's tag list contains every tag in `wanted`.
    pub fn has_tags(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Removes duplicate tags, preserving first occurrence.
pub fn dedup_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    tags.into_iter().unique().collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn entry(hash: &'static str, name: &str, size: u64) -> FileEntry {
        FileEntry {
            hash: BlobId::from_hex(hash),
            name: name.to_string(),
            size,
            content_type: None,
        }
    }

    fn some_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_canonical_hash_is_stable() {
        let mut files = IndexMap::new();
        files.insert("b.txt".to_string(), entry("beef", "b.txt", 4));
        files.insert("a.txt".to_string(), entry("cafe", "a.txt", 4));
        let commit = Commit::new(
            "message".to_string(),
            some_timestamp(),
            None,
            files.clone(),
            Metadata::new(),
            vec![],
        );

        // Insertion order of the file map must not matter.
        let mut reordered = IndexMap::new();
        reordered.insert("a.txt".to_string(), entry("cafe", "a.txt", 4));
        reordered.insert("b.txt".to_string(), entry("beef", "b.txt", 4));
        let other = Commit::new(
            "message".to_string(),
            some_timestamp(),
            None,
            reordered,
            Metadata::new(),
            vec![],
        );
        assert_eq!(commit.hash, other.hash);
        assert!(commit.verify_hash());
    }

    #[test]
    fn test_canonical_hash_depends_on_parts() {
        let base = Commit::new(
            "message".to_string(),
            some_timestamp(),
            None,
            IndexMap::new(),
            Metadata::new(),
            vec![],
        );
        let changed_message = Commit::new(
            "other".to_string(),
            some_timestamp(),
            None,
            IndexMap::new(),
            Metadata::new(),
            vec![],
        );
        let changed_parent = Commit::new(
            "message".to_string(),
            some_timestamp(),
            Some(base.hash.clone()),
            IndexMap::new(),
            Metadata::new(),
            vec![],
        );
        assert_ne!(base.hash, changed_message.hash);
        assert_ne!(base.hash, changed_parent.hash);

        // Metadata and tags are not part of the preimage.
        let mut metadata = Metadata::new();
        metadata.insert("accuracy".to_string(), 0.9.into());
        let changed_metadata = Commit::new(
            "message".to_string(),
            some_timestamp(),
            None,
            IndexMap::new(),
            metadata,
            vec!["prod".to_string()],
        );
        assert_eq!(base.hash, changed_metadata.hash);
    }

    #[test]
    fn test_serde_round_trip_preserves_unknown_keys() {
        let json = serde_json::json!({
            "hash": "00ff",
            "message": "init",
            "timestamp": "2024-05-17T12:30:45.000000Z",
            "parent_hash": null,
            "files": {
                "a.txt": {"hash": "cafe", "name": "a.txt", "size": 5, "content_type": "text/plain"},
            },
            "metadata": {"accuracy": 0.9},
            "tags": ["prod"],
            "reviewer": "someone",
        });
        let commit: Commit = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(commit.message, "init");
        assert_eq!(commit.extra.get("reviewer").unwrap(), "someone");
        assert_eq!(commit.timestamp, some_timestamp());

        let rewritten = serde_json::to_value(&commit).unwrap();
        assert_eq!(rewritten, json);
    }

    #[test]
    fn test_timestamp_format_round_trip() {
        let rendered = timestamp_format::format(&some_timestamp());
        assert_eq!(rendered, "2024-05-17T12:30:45.000000Z");
        assert_eq!(timestamp_format::parse(&rendered), Some(some_timestamp()));
        // Other RFC 3339 offsets parse too.
        assert_eq!(
            timestamp_format::parse("2024-05-17T14:30:45+02:00"),
            Some(some_timestamp())
        );
        assert_eq!(timestamp_format::parse("yesterday"), None);
    }

    #[test]
    fn test_dedup_tags() {
        let tags = ["prod", "v2", "prod", "dev"].map(String::from);
        assert_eq!(dedup_tags(tags), ["prod", "v2", "dev"].map(String::from));
    }
}
