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

use std::io::Write as _;
use std::path::PathBuf;

use assert_matches::assert_matches;
use kirin_lib::dataset::CommitOptions;
use kirin_lib::dataset::DatasetError;
use kirin_lib::dataset::FileSource;
use kirin_lib::file_util::copy_async_to_sync;
use pollster::FutureExt as _;
use pretty_assertions::assert_eq;
use test_case::test_case;
use testutils::TestBackend;
use testutils::TestCatalog;
use testutils::commit_files;
use testutils::new_temp_dir;

#[test]
fn test_commit_from_filesystem_path() {
    let test_catalog = TestCatalog::init_memory();
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();

    let src_dir = new_temp_dir();
    let src_path = src_dir.path().join("measurements.csv");
    let mut src = std::fs::File::create(&src_path).unwrap();
    src.write_all(b"a,b\n1,2\n").unwrap();
    drop(src);

    dataset
        .commit(
            "from path",
            CommitOptions {
                add_files: vec![FileSource::path(&src_path)],
                ..Default::default()
            },
        )
        .unwrap();

    // The basename is the filename; the extension drives the content type.
    let entry = dataset.get_file("measurements.csv").unwrap();
    assert_eq!(entry.size, 8);
    assert_eq!(entry.content_type.as_deref(), Some("text/csv"));
    assert_eq!(dataset.read_file("measurements.csv").unwrap(), b"a,b\n1,2\n");
}

#[test_case(TestBackend::Local ; "local backend")]
#[test_case(TestBackend::Memory ; "memory backend")]
fn test_read_and_download(backend: TestBackend) {
    let test_catalog = TestCatalog::init_with_backend(backend);
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "init", &[("a.txt", b"text contents")]);

    assert_eq!(dataset.read_file("a.txt").unwrap(), b"text contents");
    assert_eq!(dataset.read_file_text("a.txt").unwrap(), "text contents");

    let target_dir = new_temp_dir();
    let target = target_dir.path().join("downloaded.txt");
    let written = dataset.download_file("a.txt", &target).unwrap();
    assert_eq!(written, target);
    assert_eq!(std::fs::read(&target).unwrap(), b"text contents");

    assert_matches!(
        dataset.read_file("missing.txt"),
        Err(DatasetError::FileNotInDataset { .. })
    );
}

#[test]
fn test_read_file_text_rejects_binary() {
    let test_catalog = TestCatalog::init_memory();
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "init", &[("blob.bin", b"\xff\xfe\x00")]);
    assert_matches!(
        dataset.read_file_text("blob.bin"),
        Err(DatasetError::InvalidUtf8 { .. })
    );
}

#[test]
fn test_open_file_streams() {
    let test_catalog = TestCatalog::init_memory();
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "init", &[("a.txt", b"streamed")]);

    let reader = dataset.open_file("a.txt").unwrap();
    let mut out = Vec::new();
    copy_async_to_sync(reader, &mut out).block_on().unwrap();
    assert_eq!(out, b"streamed");
}

#[test]
fn test_files_view_follows_head() {
    let test_catalog = TestCatalog::init_memory();
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    assert!(dataset.files().is_empty());

    let first = commit_files(&mut dataset, "one", &[("a.txt", b"1")]);
    commit_files(&mut dataset, "two", &[("b.txt", b"2")]);
    assert_eq!(dataset.files().len(), 2);

    dataset.checkout(Some(&first)).unwrap();
    assert_eq!(dataset.files().len(), 1);
    assert_eq!(dataset.get_file("b.txt"), None);
}

#[test_case(TestBackend::Local ; "local backend")]
#[test_case(TestBackend::Memory ; "memory backend")]
fn test_local_files_materializes_and_cleans_up(backend: TestBackend) {
    let test_catalog = TestCatalog::init_with_backend(backend);
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(
        &mut dataset,
        "init",
        &[("a.txt", b"alpha"), ("b.bin", b"\x01\x02")],
    );

    let materialized_paths: Vec<PathBuf>;
    {
        let local_files = dataset.local_files().unwrap();
        assert_eq!(local_files.len(), 2);
        let a_path = local_files.path("a.txt").unwrap();
        assert_eq!(std::fs::read(a_path).unwrap(), b"alpha");
        let b_path = local_files.path("b.bin").unwrap();
        assert_eq!(std::fs::read(b_path).unwrap(), b"\x01\x02");
        materialized_paths = local_files.paths().values().cloned().collect();
    }
    // Dropping the scope removed everything that was materialized.
    for path in materialized_paths {
        assert!(!path.exists());
    }
}

#[test]
fn test_missing_blob_is_an_integrity_error() {
    let test_catalog = TestCatalog::init_memory();
    let mut dataset = test_catalog.catalog.get_dataset("d").unwrap();
    commit_files(&mut dataset, "init", &[("a.txt", b"doomed")]);

    let hash = dataset.get_file("a.txt").unwrap().hash;
    dataset.content_store().delete(&hash).block_on().unwrap();

    assert_matches!(
        dataset.read_file("a.txt"),
        Err(DatasetError::Integrity(_))
    );
    let violations = dataset.verify().unwrap();
    assert_eq!(violations.len(), 1);
}
