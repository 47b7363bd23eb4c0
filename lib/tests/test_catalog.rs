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

use assert_matches::assert_matches;
use kirin_lib::catalog::Catalog;
use kirin_lib::dataset::DatasetError;
use kirin_lib::object_store::StoreCredentials;
use pretty_assertions::assert_eq;
use test_case::test_case;
use testutils::TestBackend;
use testutils::TestCatalog;
use testutils::commit_files;
use testutils::new_temp_dir;

#[test_case(TestBackend::Local ; "local backend")]
#[test_case(TestBackend::Memory ; "memory backend")]
fn test_datasets_appear_after_first_commit(backend: TestBackend) {
    let test_catalog = TestCatalog::init_with_backend(backend);
    assert_eq!(test_catalog.catalog.list_datasets().unwrap().len(), 0);

    // Opening a dataset creates nothing.
    let mut pending = test_catalog.catalog.get_dataset("pending").unwrap();
    assert_eq!(test_catalog.catalog.list_datasets().unwrap().len(), 0);

    commit_files(&mut pending, "init", &[("a.txt", b"1")]);
    let mut other = test_catalog.catalog.get_dataset("other").unwrap();
    commit_files(&mut other, "init", &[("b.txt", b"2")]);

    assert_eq!(
        test_catalog.catalog.list_datasets().unwrap(),
        ["other", "pending"]
    );
}

#[test]
fn test_open_catalog_from_uri() {
    let temp_dir = new_temp_dir();
    let uri = format!("file://{}", temp_dir.path().display());
    let catalog = Catalog::open(&uri, &StoreCredentials::default()).unwrap();
    let mut dataset = catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "init", &[("a.txt", b"from uri")]);

    // A second catalog over the same root sees the same state.
    let reopened = Catalog::open(&uri, &StoreCredentials::default()).unwrap();
    assert_eq!(reopened.list_datasets().unwrap(), ["d"]);
    assert_eq!(
        reopened
            .get_dataset("d")
            .unwrap()
            .read_file("a.txt")
            .unwrap(),
        b"from uri"
    );
}

#[test]
fn test_dataset_instances_share_the_catalog_store() {
    let test_catalog = TestCatalog::init_memory();
    let mut writer = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(&mut writer, "init", &[("a.txt", b"visible")]);

    // A view opened later from the same catalog reads the committed state.
    let reader = test_catalog.catalog.get_dataset("d").unwrap();
    assert!(reader.exists());
    assert_eq!(reader.read_file("a.txt").unwrap(), b"visible");
}

#[test]
fn test_invalid_dataset_names_are_rejected() {
    let test_catalog = TestCatalog::init_memory();
    for bad in ["", "a/b", ".", ".."] {
        assert_matches!(
            test_catalog.catalog.get_dataset(bad),
            Err(DatasetError::InvalidName { .. })
        );
    }
}

#[test]
fn test_memory_uri_round_trip() {
    let catalog = Catalog::open("memory://scratch", &StoreCredentials::default()).unwrap();
    let mut dataset = catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "init", &[("a.txt", b"ephemeral")]);
    assert_eq!(catalog.list_datasets().unwrap(), ["d"]);
}
