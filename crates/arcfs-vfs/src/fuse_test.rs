// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use arcfs::fixtures::*;
use arcfs::{FileKind, Stat};
use fuser::FileType;
use rstest::rstest;
use tempfile::TempDir;

use super::{attr_from_stat, file_type, negative_attr, Session};
use crate::dispatch::{Dispatcher, Mutation};
use crate::filesystem::FilesystemHandle;
use crate::idle::Activity;

#[rstest]
#[case(FileKind::Directory, FileType::Directory)]
#[case(FileKind::RegularFile, FileType::RegularFile)]
#[case(FileKind::Symlink, FileType::Symlink)]
#[case(FileKind::CharDevice, FileType::CharDevice)]
#[case(FileKind::BlockDevice, FileType::BlockDevice)]
#[case(FileKind::NamedPipe, FileType::NamedPipe)]
#[case(FileKind::Socket, FileType::Socket)]
fn test_file_type(#[case] kind: FileKind, #[case] expected: FileType) {
    assert_eq!(file_type(kind), expected);
}

#[rstest]
fn test_attr_from_stat() {
    let mtime = UNIX_EPOCH + Duration::from_secs(1_234_567);
    let stat = Stat {
        ino: 42,
        kind: FileKind::RegularFile,
        perm: 0o640,
        nlink: 3,
        uid: 10,
        gid: 20,
        rdev: 0,
        size: 1025,
        blocks: 3,
        blksize: 512,
        mtime,
    };
    let attr = attr_from_stat(&stat);
    assert_eq!(attr.ino, 42);
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.perm, 0o640);
    assert_eq!(attr.nlink, 3);
    assert_eq!((attr.uid, attr.gid), (10, 20));
    assert_eq!(attr.size, 1025);
    assert_eq!(attr.blocks, 3);
    assert_eq!(attr.mtime, mtime);
    assert_eq!(attr.atime, mtime);
    assert_eq!(attr.ctime, mtime);
}

#[rstest]
fn test_negative_entry_has_no_inode() {
    assert_eq!(negative_attr().ino, 0);
}

#[rstest]
fn test_session_refuses_every_mutation(tmpdir: TempDir) {
    let path = sample_image().write_to(tmpdir.path());
    let fs = FilesystemHandle::open(&path, 0).unwrap();
    let session = Session::new(Dispatcher::new(fs, Arc::new(Activity::new())));
    for op in Mutation::ALL {
        session.dispatcher().activity().touch_at(0);
        assert_eq!(session.refuse(op), libc::EROFS, "{}", op.name());
        assert!(session.dispatcher().activity().last_access() > 0);
    }
}

#[rstest]
fn test_mutations_cover_every_writing_request() {
    let names = Mutation::ALL.iter().map(Mutation::name).collect::<HashSet<_>>();
    let expected = [
        "create",
        "mknod",
        "mkdir",
        "unlink",
        "rmdir",
        "symlink",
        "rename",
        "link",
        "write",
        "setattr",
        "setxattr",
        "removexattr",
    ];
    assert_eq!(names, expected.into_iter().collect());
}
