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

use kirin_lib::dataset::CommitOptions;
use kirin_lib::object_store::ObjectStore as _;
use pollster::FutureExt as _;
use pretty_assertions::assert_eq;
use test_case::test_case;
use testutils::TestBackend;
use testutils::TestCatalog;
use testutils::commit_files;

#[test_case(TestBackend::Local ; "local backend")]
#[test_case(TestBackend::Memory ; "memory backend")]
fn test_cleanup_deletes_only_unreferenced_blobs(backend: TestBackend) {
    let test_catalog = TestCatalog::init_with_backend(backend);
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "live", &[("kept.txt", b"kept")]);

    // Orphan a blob by writing it outside any commit, the way an aborted
    // commit would.
    let orphan = dataset
        .content_store()
        .put_bytes(b"orphaned upload")
        .block_on()
        .unwrap();

    let deleted = dataset.cleanup_orphaned_files().unwrap();
    assert_eq!(deleted, 1);
    assert!(!dataset.content_store().has(&orphan).block_on().unwrap());

    // The live blob survived, and a second pass finds nothing.
    let kept = dataset.get_file("kept.txt").unwrap().hash;
    assert!(dataset.content_store().has(&kept).block_on().unwrap());
    assert_eq!(dataset.cleanup_orphaned_files().unwrap(), 0);
}

#[test]
fn test_cleanup_respects_other_datasets() {
    let test_catalog = TestCatalog::init_memory();
    let mut first = test_catalog.catalog.get_dataset("first").unwrap();
    let mut second = test_catalog.catalog.get_dataset("second").unwrap();

    // Identical content in both datasets: one shared blob.
    commit_files(&mut first, "add", &[("shared.txt", b"shared")]);
    commit_files(&mut second, "add", &[("copy.txt", b"shared")]);
    let shared = first.get_file("shared.txt").unwrap().hash;

    // Even when the whole history of "first" goes away, "second" still
    // references the content.
    test_catalog
        .store()
        .delete("datasets/first/commits.json")
        .block_on()
        .unwrap();
    let survivor = test_catalog.catalog.get_dataset("second").unwrap();
    assert_eq!(survivor.cleanup_orphaned_files().unwrap(), 0);
    assert!(survivor.content_store().has(&shared).block_on().unwrap());
}

#[test]
fn test_cleanup_after_history_rewrite() {
    let test_catalog = TestCatalog::init_memory();
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "add x", &[("x.bin", b"ex marks the spot")]);
    let doomed = dataset.get_file("x.bin").unwrap().hash;
    dataset
        .commit(
            "rm x",
            CommitOptions {
                remove_files: vec!["x.bin".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

    // While the first commit exists, the blob is live.
    assert_eq!(dataset.cleanup_orphaned_files().unwrap(), 0);

    // Rewrite history so only the empty tail commit remains (as if the log
    // had been rebuilt without the addition), then clean up again.
    let store = test_catalog.store();
    let raw = store.read("datasets/d/commits.json").block_on().unwrap();
    let mut log: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    let commits = log["commits"].as_array_mut().unwrap();
    commits.remove(0);
    commits[0]["parent_hash"] = serde_json::Value::Null;
    store
        .write("datasets/d/commits.json", &serde_json::to_vec(&log).unwrap())
        .block_on()
        .unwrap();
    test_catalog.catalog.rebuild_file_index().unwrap();

    let survivor = test_catalog.catalog.get_dataset("d").unwrap();
    let deleted = survivor.cleanup_orphaned_files().unwrap();
    assert!(deleted >= 1);
    assert!(!survivor.content_store().has(&doomed).block_on().unwrap());
    // The orphan's index shard went with it.
    assert!(
        test_catalog
            .catalog
            .find_datasets_with_file(&doomed)
            .unwrap()
            .is_empty()
    );
}
