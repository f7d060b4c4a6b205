// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::Arc;

use arcfs::fixtures::*;
use arcfs::{
    ArchiveAccess,
    DirCursor,
    DirEntry,
    Inode,
    InodeId,
    Stat,
    StatFs,
    TarArchive,
    TrackingRegistry,
    ROOT_INO,
};
use rstest::rstest;
use tempfile::TempDir;

use super::{Dispatcher, Mutation, Xattr};
use crate::dirent::dirent_size;
use crate::filesystem::FilesystemHandle;
use crate::idle::Activity;

fn dispatcher(tmpdir: &TempDir) -> Dispatcher {
    let path = sample_image().write_to(tmpdir.path());
    let fs = FilesystemHandle::open(&path, 0).unwrap();
    Dispatcher::new(fs, Arc::new(Activity::new()))
}

fn lookup_path(dispatcher: &Dispatcher, path: &str) -> Stat {
    let mut stat = dispatcher.getattr(ROOT_INO).unwrap();
    for name in path.split('/') {
        stat = dispatcher
            .lookup(stat.ino, OsStr::new(name))
            .unwrap()
            .unwrap_or_else(|| panic!("missing {name} in {path}"));
    }
    stat
}

fn list_all(dispatcher: &Dispatcher, ino: u64, budget: usize) -> Vec<(String, u64)> {
    let fh = dispatcher.opendir(ino).unwrap();
    let mut offset = 0;
    let mut listed = Vec::new();
    loop {
        let batch = dispatcher.readdir(fh, offset, budget).unwrap();
        let Some(last) = batch.entries().last() else {
            break;
        };
        offset = last.offset as i64;
        listed.extend(
            batch
                .entries()
                .iter()
                .map(|e| (e.name.to_string_lossy().into_owned(), e.ino)),
        );
    }
    dispatcher.releasedir(fh);
    listed
}

#[rstest]
fn test_getattr_root(tmpdir: TempDir) {
    init_logging();
    let dispatcher = dispatcher(&tmpdir);
    let stat = dispatcher.getattr(ROOT_INO).unwrap();
    assert_eq!(stat.ino, ROOT_INO);
    assert!(stat.kind.is_dir());
}

#[rstest]
fn test_getattr_unknown(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    assert_eq!(dispatcher.getattr(424242), Err(libc::ENOENT));
}

#[rstest]
fn test_lookup_numbers_are_stable(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let first = lookup_path(&dispatcher, "etc/hosts");
    let again = lookup_path(&dispatcher, "etc/hosts");
    assert_eq!(first.ino, again.ino);
    assert_eq!(dispatcher.getattr(first.ino).unwrap().ino, first.ino);
    assert_eq!(first.size, 20);
}

#[rstest]
fn test_lookup_missing_is_negative(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    assert_eq!(
        dispatcher.lookup(ROOT_INO, OsStr::new("nothing-here")),
        Ok(None)
    );
}

#[rstest]
fn test_lookup_errors(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "readme");
    assert_eq!(
        dispatcher.lookup(file.ino, OsStr::new("child")),
        Err(libc::ENOTDIR)
    );
    assert_eq!(
        dispatcher.lookup(9999, OsStr::new("child")),
        Err(libc::ENOENT)
    );
}

#[rstest]
fn test_forget_releases_numbers(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let stat = lookup_path(&dispatcher, "readme");
    dispatcher.lookup(ROOT_INO, OsStr::new("readme")).unwrap();

    dispatcher.forget(stat.ino, 1);
    assert!(dispatcher.getattr(stat.ino).is_ok());
    dispatcher.batch_forget([(stat.ino, 1), (9999, 3)]);
    assert_eq!(dispatcher.getattr(stat.ino), Err(libc::ENOENT));

    dispatcher.forget(ROOT_INO, 1);
    assert!(dispatcher.getattr(ROOT_INO).is_ok(), "the root is never forgotten");
}

#[rstest]
#[case(4096)]
#[case(dirent_size(6))]
#[case(100)]
fn test_readdir_resumes_without_repeats(tmpdir: TempDir, #[case] budget: usize) {
    let dispatcher = dispatcher(&tmpdir);
    let listed = list_all(&dispatcher, ROOT_INO, budget);
    let names = listed.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["etc", "pipe", "readme", "usr"]);
    assert_eq!(dispatcher.activity().open_count(), 0);
}

#[rstest]
fn test_readdir_numbers_match_lookup(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let usr = lookup_path(&dispatcher, "usr/bin");
    let listed = list_all(&dispatcher, usr.ino, 4096);
    for (name, ino) in listed {
        let stat = dispatcher
            .lookup(usr.ino, OsStr::new(&name))
            .unwrap()
            .unwrap();
        assert_eq!(stat.ino, ino, "{name} should report the same number");
    }
}

#[rstest]
fn test_readdir_never_exceeds_budget(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let fh = dispatcher.opendir(ROOT_INO).unwrap();
    let batch = dispatcher.readdir(fh, 0, 70).unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch.used() <= 70);
    dispatcher.releasedir(fh);
}

#[rstest]
fn test_readdir_bad_handles(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "readme");
    let fh = dispatcher.open(file.ino, libc::O_RDONLY).unwrap();
    assert_eq!(dispatcher.readdir(fh, 0, 4096).err(), Some(libc::EBADF));
    assert_eq!(dispatcher.readdir(777, 0, 4096).err(), Some(libc::EBADF));

    let dir = dispatcher.opendir(ROOT_INO).unwrap();
    assert_eq!(dispatcher.readdir(dir, -1, 4096).err(), Some(libc::EINVAL));
    assert_eq!(dispatcher.readdir(dir, 100, 4096).err(), Some(libc::EINVAL));
}

#[rstest]
fn test_opendir_requires_directory(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "readme");
    assert_eq!(dispatcher.opendir(file.ino), Err(libc::ENOTDIR));
    assert_eq!(dispatcher.opendir(5555), Err(libc::ENOENT));
    assert_eq!(dispatcher.activity().open_count(), 0);
}

#[rstest]
#[case(libc::O_WRONLY)]
#[case(libc::O_RDWR)]
#[case(libc::O_RDWR | libc::O_APPEND)]
fn test_open_for_writing(tmpdir: TempDir, #[case] flags: i32) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "readme");
    assert_eq!(dispatcher.open(file.ino, flags), Err(libc::EROFS));
}

#[rstest]
fn test_open_non_files(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    assert_eq!(dispatcher.open(ROOT_INO, libc::O_RDONLY), Err(libc::EISDIR));
    let link = lookup_path(&dispatcher, "usr/bin/alias");
    assert_eq!(dispatcher.open(link.ino, libc::O_RDONLY), Err(libc::EISDIR));
    assert_eq!(dispatcher.open(31337, libc::O_RDONLY), Err(libc::ENOENT));
}

#[rstest]
fn test_open_release_counts(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "usr/bin/tool");
    let files = (0..5)
        .map(|_| dispatcher.open(file.ino, libc::O_RDONLY).unwrap())
        .collect::<HashSet<_>>();
    let dir = dispatcher.opendir(ROOT_INO).unwrap();
    assert_eq!(files.len(), 5);
    assert_eq!(dispatcher.activity().open_count(), 6);

    // closing with the wrong kind of release changes nothing
    dispatcher.releasedir(*files.iter().next().unwrap());
    assert_eq!(dispatcher.activity().open_count(), 6);

    dispatcher.releasedir(dir);
    for fh in files {
        dispatcher.release(fh);
    }
    assert_eq!(dispatcher.activity().open_count(), 0);
    dispatcher.release(1);
    assert_eq!(dispatcher.activity().open_count(), 0);
}

#[rstest]
fn test_read(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "etc/hosts");
    let fh = dispatcher.open(file.ino, libc::O_RDONLY).unwrap();

    assert_eq!(dispatcher.read(fh, 0, 4096).unwrap(), b"127.0.0.1 localhost\n");
    assert_eq!(dispatcher.read(fh, 10, 4).unwrap(), b"loca");
    assert!(dispatcher.read(fh, 20, 4096).unwrap().is_empty());
    assert!(dispatcher.read(fh, 5000, 4096).unwrap().is_empty());
    assert_eq!(dispatcher.read(fh, -1, 10), Err(libc::EINVAL));

    let dir = dispatcher.opendir(ROOT_INO).unwrap();
    assert_eq!(dispatcher.read(dir, 0, 10), Err(libc::EBADF));
    dispatcher.release(fh);
    assert_eq!(dispatcher.read(fh, 0, 10), Err(libc::EBADF));
}

#[rstest]
fn test_readlink(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let link = lookup_path(&dispatcher, "usr/bin/alias");
    assert_eq!(dispatcher.readlink(link.ino).unwrap(), b"tool");
    let file = lookup_path(&dispatcher, "readme");
    assert_eq!(dispatcher.readlink(file.ino), Err(libc::EINVAL));
    assert_eq!(dispatcher.readlink(8888), Err(libc::ENOENT));
}

#[rstest]
fn test_getxattr_protocol(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "etc/secure");
    let name = OsStr::new("user.origin");
    assert_eq!(dispatcher.getxattr(file.ino, name, 0), Ok(Xattr::Size(7)));
    assert_eq!(dispatcher.getxattr(file.ino, name, 3), Err(libc::ERANGE));
    assert_eq!(
        dispatcher.getxattr(file.ino, name, 64),
        Ok(Xattr::Data(b"fixture".to_vec()))
    );
    assert_eq!(
        dispatcher.getxattr(file.ino, OsStr::new("user.none"), 64),
        Err(libc::ENODATA)
    );
}

#[rstest]
fn test_listxattr_protocol(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let file = lookup_path(&dispatcher, "etc/secure");
    let expected = b"security.label\0user.origin\0";
    assert_eq!(
        dispatcher.listxattr(file.ino, 0),
        Ok(Xattr::Size(expected.len() as u32))
    );
    assert_eq!(
        dispatcher.listxattr(file.ino, 256),
        Ok(Xattr::Data(expected.to_vec()))
    );
    assert_eq!(dispatcher.listxattr(file.ino, 4), Err(libc::ERANGE));

    let plain = lookup_path(&dispatcher, "readme");
    assert_eq!(dispatcher.listxattr(plain.ino, 0), Ok(Xattr::Size(0)));
}

#[rstest]
fn test_statfs(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let stats = dispatcher.statfs().unwrap();
    assert_eq!(stats.blocks_free, 0);
    assert!(stats.files > 0);
}

#[rstest]
fn test_writes_are_refused(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    for op in Mutation::ALL {
        dispatcher.activity().touch_at(0);
        assert_eq!(dispatcher.refuse_write(op), libc::EROFS, "{}", op.name());
        assert!(dispatcher.activity().last_access() > 0);
    }
}

#[rstest]
fn test_operations_record_activity(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    dispatcher.activity().touch_at(0);
    let _ = dispatcher.getattr(123456);
    assert!(dispatcher.activity().last_access() > 0, "even failures count as use");
}

#[rstest]
fn test_readdir_records_activity_before_allocating(tmpdir: TempDir) {
    let dispatcher = dispatcher(&tmpdir);
    let fh = dispatcher.opendir(ROOT_INO).unwrap();
    dispatcher.activity().touch_at(0);
    assert_eq!(dispatcher.readdir(fh, 0, usize::MAX).err(), Some(libc::ENOMEM));
    assert!(dispatcher.activity().last_access() > 0);
}

/// Serves the sample image, but fails part way through any listing
struct FailingListing(TarArchive);

impl ArchiveAccess for FailingListing {
    fn root(&self) -> InodeId {
        self.0.root()
    }
    fn inode(&self, id: InodeId) -> arcfs::Result<Inode> {
        self.0.inode(id)
    }
    fn stat(&self, inode: &Inode) -> arcfs::Result<Stat> {
        self.0.stat(inode)
    }
    fn dir_open(&self, dir: &Inode, offset: u64) -> arcfs::Result<DirCursor<'_>> {
        let cursor = self.0.dir_open(dir, offset)?.take(1).chain(std::iter::once(Err(
            arcfs::Error::ReadError(dir.id, std::io::ErrorKind::UnexpectedEof.into()),
        )));
        Ok(Box::new(cursor))
    }
    fn dir_lookup(&self, dir: &Inode, name: &[u8]) -> arcfs::Result<Option<DirEntry>> {
        self.0.dir_lookup(dir, name)
    }
    fn read_range(&self, file: &Inode, offset: u64, buf: &mut [u8]) -> arcfs::Result<usize> {
        self.0.read_range(file, offset, buf)
    }
    fn readlink_len(&self, link: &Inode) -> arcfs::Result<usize> {
        self.0.readlink_len(link)
    }
    fn readlink(&self, link: &Inode, buf: &mut [u8]) -> arcfs::Result<usize> {
        self.0.readlink(link, buf)
    }
    fn listxattr(&self, inode: &Inode, buf: Option<&mut [u8]>) -> arcfs::Result<usize> {
        self.0.listxattr(inode, buf)
    }
    fn xattr_lookup(
        &self,
        inode: &Inode,
        name: &[u8],
        buf: Option<&mut [u8]>,
    ) -> arcfs::Result<usize> {
        self.0.xattr_lookup(inode, name, buf)
    }
    fn statfs(&self) -> arcfs::Result<StatFs> {
        self.0.statfs()
    }
}

#[rstest]
fn test_readdir_failure_mid_listing(tmpdir: TempDir) {
    let path = sample_image().write_to(tmpdir.path());
    let archive = TarArchive::open(&path, 0).unwrap();
    let registry = TrackingRegistry::new(archive.root());
    let fs = FilesystemHandle::new(Box::new(FailingListing(archive)), Box::new(registry));
    let dispatcher = Dispatcher::new(fs, Arc::new(Activity::new()));

    let fh = dispatcher.opendir(ROOT_INO).unwrap();
    assert_eq!(dispatcher.readdir(fh, 0, 4096).err(), Some(libc::EIO));
}
