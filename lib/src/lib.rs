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

//! Library for Kirin - git-like version control for datasets.
//!
//! A dataset is a named, linear history of commits stored in an object store
//! (local filesystem, S3, GCS, Azure, or in-memory). File contents are kept
//! in a content-addressed blob store keyed by SHA-256, so identical files are
//! stored once no matter how many commits or datasets reference them.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod artifact;
pub mod catalog;
#[cfg(feature = "cloud")]
pub mod cloud_store;
pub mod commit;
pub mod commit_store;
pub mod content_store;
pub mod dataset;
pub mod diff;
pub mod file_index;
pub mod file_util;
pub mod local_store;
pub mod memory_store;
pub mod object_id;
pub mod object_store;
