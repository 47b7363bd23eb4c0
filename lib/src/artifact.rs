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

//! Pluggable serialization of in-process artifacts.
//!
//! `commit()` accepts arbitrary in-memory objects (models, plots) next to
//! paths and raw bytes. The engine knows nothing about concrete ML or
//! plotting libraries: it walks a registry of [`ArtifactSerializer`]s, each
//! claiming the artifact types it understands via `dyn Any` downcasts, and
//! uses the first one that matches. A serializer produces the bytes to
//! store, the filename to store them under, and optionally extracted
//! metadata (hyperparameters and the like) that `commit()` files under
//! `metadata.models.<name>`.

#![expect(missing_docs)]

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::commit::Metadata;

/// The product of serializing one artifact.
#[derive(Clone, Debug)]
pub struct SerializedArtifact {
    /// Filename the artifact is committed under, extension included.
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Auto-extracted metadata, merged into `metadata.models.<name>`.
    pub extracted_metadata: Option<Metadata>,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    /// No registered serializer claims the artifact's concrete type.
    #[error("No serializer registered for artifact {name:?}")]
    NoSerializer { name: Option<String> },
    #[error("Could not serialize artifact {name:?}")]
    Serialize {
        name: Option<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Serializes one family of artifact types.
///
/// `name` is the caller's binding name for the artifact when known; the
/// serializer folds it into the filename (`<name>.pkl`-style) and falls back
/// to a fixed stem (`model`, `plot`, ...) when it isn't.
pub trait ArtifactSerializer: Send + Sync {
    /// Whether this serializer understands the artifact's concrete type.
    fn can_serialize(&self, artifact: &dyn Any) -> bool;

    fn serialize(
        &self,
        artifact: &dyn Any,
        name: Option<&str>,
    ) -> Result<SerializedArtifact, ArtifactError>;
}

/// An ordered set of serializers; first match wins.
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    serializers: Vec<Arc<dyn ArtifactSerializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, serializer: Arc<dyn ArtifactSerializer>) {
        self.serializers.push(serializer);
    }

    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }

    /// Serializes `artifact` with the first matching serializer.
    pub fn serialize(
        &self,
        artifact: &dyn Any,
        name: Option<&str>,
    ) -> Result<SerializedArtifact, ArtifactError> {
        let serializer = self
            .serializers
            .iter()
            .find(|serializer| serializer.can_serialize(artifact))
            .ok_or_else(|| ArtifactError::NoSerializer {
                name: name.map(str::to_string),
            })?;
        serializer.serialize(artifact, name)
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("len", &self.serializers.len())
            .finish()
    }
}

/// Makes `filename` unique within `taken` by inserting `-1`, `-2`, ...
/// before the extension. Used when several anonymous artifacts fall back to
/// the same stem in one commit.
pub fn disambiguate_filename(filename: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(filename) {
        return filename.to_string();
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (filename, None),
    };
    for counter in 1.. {
        let candidate = match ext {
            Some(ext) => format!("{stem}-{counter}.{ext}"),
            None => format!("{stem}-{counter}"),
        };
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
    unreachable!();
}
