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

//! Comparison of two commits: files, metadata, and tags.

#![expect(missing_docs)]

use std::collections::BTreeSet;

use serde::Serialize;

use crate::commit::Commit;
use crate::commit::Metadata;

/// Filename-level changes between two commits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FilesDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Same filename, different content hash.
    pub changed: Vec<String>,
}

/// Metadata-key changes between two commits. Keys are dotted paths: top
/// level plus one level deep under `models`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetadataDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

/// Tag changes between two commits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TagsDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// The full difference from one commit to another.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitDiff {
    pub files: FilesDiff,
    pub metadata: MetadataDiff,
    pub tags: TagsDiff,
}

/// Flattens a metadata object into dotted keys: every top-level key, with
/// `models` additionally expanded one level so individual models diff
/// separately.
fn metadata_keys(metadata: &Metadata) -> Vec<(String, &serde_json::Value)> {
    let mut keys = Vec::new();
    for (key, value) in metadata {
        match (key.as_str(), value.as_object()) {
            ("models", Some(models)) => {
                for (model_name, model_value) in models {
                    keys.push((format!("models.{model_name}"), model_value));
                }
            }
            _ => keys.push((key.clone(), value)),
        }
    }
    keys
}

/// Compares two commits, reporting changes in `to` relative to `from`.
pub fn compare_commits(from: &Commit, to: &Commit) -> CommitDiff {
    let mut files = FilesDiff::default();
    for (name, entry) in &to.files {
        match from.files.get(name) {
            None => files.added.push(name.clone()),
            Some(old) if old.hash != entry.hash => files.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    for name in from.files.keys() {
        if !to.files.contains_key(name) {
            files.removed.push(name.clone());
        }
    }
    files.added.sort_unstable();
    files.removed.sort_unstable();
    files.changed.sort_unstable();

    let mut metadata = MetadataDiff::default();
    let from_keys: Vec<_> = metadata_keys(&from.metadata);
    let to_keys: Vec<_> = metadata_keys(&to.metadata);
    for (key, value) in &to_keys {
        match from_keys.iter().find(|(from_key, _)| from_key == key) {
            None => metadata.added.push(key.clone()),
            Some((_, old_value)) if old_value != value => metadata.changed.push(key.clone()),
            Some(_) => {}
        }
    }
    for (key, _) in &from_keys {
        if !to_keys.iter().any(|(to_key, _)| to_key == key) {
            metadata.removed.push(key.clone());
        }
    }
    metadata.added.sort_unstable();
    metadata.removed.sort_unstable();
    metadata.changed.sort_unstable();

    let from_tags: BTreeSet<_> = from.tags.iter().collect();
    let to_tags: BTreeSet<_> = to.tags.iter().collect();
    let tags = TagsDiff {
        added: to_tags
            .difference(&from_tags)
            .map(|tag| (*tag).clone())
            .collect(),
        removed: from_tags
            .difference(&to_tags)
            .map(|tag| (*tag).clone())
            .collect(),
    };

    CommitDiff {
        files,
        metadata,
        tags,
    }
}
