// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arcfs::{FileKind, Stat};
use fuser::consts::*;
use fuser::{
    FileAttr,
    FileType,
    KernelConfig,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyStatfs,
    ReplyWrite,
    ReplyXattr,
    Request,
    TimeOrNow,
};
use libc::c_int;

use crate::dispatch::{Dispatcher, Mutation, Xattr};

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

/// The space available for one readdir reply. The kernel typically
/// asks for one page, and any entries that do not make it into the
/// reply are picked up again from their offset on the next call.
const READDIR_BUDGET: usize = 4096;

/// Extract the ok value from a result, or reply with the errno and return
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(errno) => err!($reply, errno),
        }
    }};
}

/// Reply with an errno to FUSE and return
macro_rules! err {
    ($reply:ident, $errno:expr) => {{
        $reply.error($errno);
        return;
    }};
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

/// Archives carry only a modification time, which is reported for all others
fn attr_from_stat(stat: &Stat) -> FileAttr {
    FileAttr {
        ino: stat.ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.mtime,
        mtime: stat.mtime,
        ctime: stat.mtime,
        crtime: stat.mtime,
        kind: file_type(stat.kind),
        perm: stat.perm,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        blksize: stat.blksize,
        flags: 0,
    }
}

/// The attributes sent for a name that does not exist. Inode zero
/// tells the kernel to cache the absence of the name.
fn negative_attr() -> FileAttr {
    FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
        flags: 0,
    }
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receiving each
/// request from the kernel, passing it to the [`Dispatcher`] and
/// packing the outcome into the reply.
pub struct Session {
    dispatcher: Arc<Dispatcher>,
    ttl: Duration,
}

impl Session {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            // the archive cannot change, so nothing ever goes stale
            ttl: Duration::from_secs(u64::MAX),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The dispatcher, kept alive past the end of the session
    pub(crate) fn shared_dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// The reply to every request that would change the filesystem
    fn refuse(&self, op: Mutation) -> c_int {
        self.dispatcher.refuse_write(op)
    }
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl fuser::Filesystem for Session {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        let desired = [
            ("FUSE_ASYNC_READ", FUSE_ASYNC_READ),
            #[cfg(feature = "fuse-backend-abi-7-28")]
            ("FUSE_CACHE_SYMLINKS", FUSE_CACHE_SYMLINKS),
        ];
        let all_desired = desired.iter().fold(0, |prev, (_, cap)| prev | cap);
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            let rejected = desired
                .iter()
                .filter_map(|d| (d.1 & unsupported != 0).then_some(d.0));
            for name in rejected {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            if let Err(err) = config.add_capabilities(all_desired & !unsupported) {
                tracing::warn!("FUSE features rejected after removing unsupported: {err:#x}");
            }
        }
        tracing::info!("Filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.dispatcher.destroy();
        tracing::info!("Filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match unwrap!(reply, self.dispatcher.lookup(parent, name)) {
            Some(stat) => reply.entry(&self.ttl, &attr_from_stat(&stat), 0),
            None => reply.entry(&self.ttl, &negative_attr(), 0),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.dispatcher.forget(ino, nlookup);
    }

    #[cfg(feature = "fuse-backend-abi-7-22")]
    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        self.dispatcher
            .batch_forget(nodes.iter().map(|node| (node.nodeid, node.nlookup)));
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let stat = unwrap!(reply, self.dispatcher.getattr(ino));
        reply.attr(&self.ttl, &attr_from_stat(&stat));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let target = unwrap!(reply, self.dispatcher.readlink(ino));
        reply.data(&target);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fh = unwrap!(reply, self.dispatcher.open(ino, flags));
        // the data behind a file never changes, so it
        // can stay cached across separate opens
        reply.opened(fh, FOPEN_KEEP_CACHE);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let data = unwrap!(reply, self.dispatcher.read(fh, offset, size));
        reply.data(&data);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        // ignore flush because we don't support write operations
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatcher.release(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fh = unwrap!(reply, self.dispatcher.opendir(ino));
        #[allow(unused_mut)]
        let mut flags = 0;
        #[cfg(feature = "fuse-backend-abi-7-28")]
        {
            flags |= FOPEN_CACHE_DIR;
        }
        reply.opened(fh, flags);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let batch = unwrap!(reply, self.dispatcher.readdir(fh, offset, READDIR_BUDGET));
        for entry in batch.entries() {
            let buffer_full = reply.add(
                entry.ino,
                entry.offset as i64,
                file_type(entry.kind),
                &entry.name,
            );
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.dispatcher.releasedir(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = unwrap!(reply, self.dispatcher.statfs());
        reply.statfs(
            stats.blocks,
            stats.blocks_free,
            stats.blocks_available,
            stats.files,
            stats.files_free,
            stats.block_size,
            stats.name_max,
            stats.fragment_size,
        );
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match unwrap!(reply, self.dispatcher.listxattr(ino, size)) {
            Xattr::Size(size) => reply.size(size),
            Xattr::Data(names) => reply.data(&names),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        match unwrap!(reply, self.dispatcher.getxattr(ino, name, size)) {
            Xattr::Size(size) => reply.size(size),
            Xattr::Data(value) => reply.data(&value),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(self.refuse(Mutation::Create));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.refuse(Mutation::Mknod));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.refuse(Mutation::Mkdir));
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.refuse(Mutation::Unlink));
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.refuse(Mutation::Rmdir));
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(self.refuse(Mutation::Symlink));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.refuse(Mutation::Rename));
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(self.refuse(Mutation::Link));
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(self.refuse(Mutation::Write));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(self.refuse(Mutation::Setattr));
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.refuse(Mutation::Setxattr));
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.refuse(Mutation::Removexattr));
    }
}
