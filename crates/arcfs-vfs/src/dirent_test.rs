// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::OsStr;

use arcfs::FileKind;
use rstest::rstest;

use super::{dirent_size, DirentBatch};

#[rstest]
#[case(1, 32)]
#[case(8, 32)]
#[case(9, 40)]
#[case(16, 40)]
#[case(255, 280)]
fn test_dirent_size(#[case] name_len: usize, #[case] expected: usize) {
    assert_eq!(dirent_size(name_len), expected);
    assert_eq!(dirent_size(name_len) % 8, 0);
}

#[rstest]
fn test_batch_respects_budget() {
    let mut batch = DirentBatch::with_budget(100).unwrap();
    assert!(batch.push(2, 1, FileKind::RegularFile, OsStr::new("a")));
    assert!(batch.push(3, 2, FileKind::Directory, OsStr::new("b")));
    assert!(batch.push(4, 3, FileKind::Symlink, OsStr::new("c")));
    assert_eq!(batch.used(), 96);
    assert!(!batch.push(5, 4, FileKind::RegularFile, OsStr::new("d")));
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.remaining(), 4);
}

#[rstest]
fn test_batch_skips_nothing_after_refusal() {
    let mut batch = DirentBatch::with_budget(64).unwrap();
    assert!(!batch.push(2, 1, FileKind::RegularFile, OsStr::new(&"x".repeat(60))));
    assert!(batch.is_empty());
    assert!(batch.push(3, 2, FileKind::RegularFile, OsStr::new("short")));
    assert_eq!(batch.entries()[0].offset, 2);
}

#[rstest]
fn test_batch_zero_budget() {
    let mut batch = DirentBatch::with_budget(0).unwrap();
    assert!(!batch.push(2, 1, FileKind::RegularFile, OsStr::new("a")));
}
