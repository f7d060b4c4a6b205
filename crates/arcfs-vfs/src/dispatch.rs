// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! The semantics of every filesystem operation, independent
//! of how requests and replies travel to and from the kernel.
//!
//! Each operation records activity before doing anything that
//! can fail, and reports failure as the errno to reply with.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use arcfs::{OsError, Stat, StatFs};
use libc::c_int;

use crate::dirent::DirentBatch;
use crate::filesystem::FilesystemHandle;
use crate::handles::HandleTable;
use crate::idle::Activity;

#[cfg(test)]
#[path = "./dispatch_test.rs"]
mod dispatch_test;

/// The reply to an extended attribute query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Xattr {
    /// Only the size of the data was requested
    Size(u32),
    Data(Vec<u8>),
}

/// The requests that would change the filesystem, all of which are refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    Create,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Write,
    Setattr,
    Setxattr,
    Removexattr,
}

impl Mutation {
    pub const ALL: [Mutation; 12] = [
        Self::Create,
        Self::Mknod,
        Self::Mkdir,
        Self::Unlink,
        Self::Rmdir,
        Self::Symlink,
        Self::Rename,
        Self::Link,
        Self::Write,
        Self::Setattr,
        Self::Setxattr,
        Self::Removexattr,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Mknod => "mknod",
            Self::Mkdir => "mkdir",
            Self::Unlink => "unlink",
            Self::Rmdir => "rmdir",
            Self::Symlink => "symlink",
            Self::Rename => "rename",
            Self::Link => "link",
            Self::Write => "write",
            Self::Setattr => "setattr",
            Self::Setxattr => "setxattr",
            Self::Removexattr => "removexattr",
        }
    }
}

/// Allocate a zeroed buffer, reporting exhaustion as ENOMEM
fn buffer(len: usize) -> Result<Vec<u8>, c_int> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| libc::ENOMEM)?;
    buf.resize(len, 0);
    Ok(buf)
}

fn size_of(len: usize) -> Result<u32, c_int> {
    u32::try_from(len).map_err(|_| libc::E2BIG)
}

/// Serves one archive through one table of open handles
pub struct Dispatcher {
    fs: FilesystemHandle,
    handles: HandleTable,
    activity: Arc<Activity>,
}

impl Dispatcher {
    pub fn new(fs: FilesystemHandle, activity: Arc<Activity>) -> Self {
        Self {
            fs,
            handles: HandleTable::new(Arc::clone(&activity)),
            activity,
        }
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn filesystem(&self) -> &FilesystemHandle {
        &self.fs
    }

    pub fn getattr(&self, ino: u64) -> Result<Stat, c_int> {
        self.activity.touch();
        let view = self.fs.view(ino)?;
        view.stat().map_err(|err| {
            tracing::debug!(?err, "getattr {ino} = ENOENT");
            libc::ENOENT
        })
    }

    /// Find a name in a directory.
    ///
    /// A missing name is not an error, and is reported as `None` so
    /// that the kernel can cache the absence of the entry.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<Option<Stat>, c_int> {
        self.activity.touch();
        let parent = self.fs.view(parent)?;
        if !parent.inode().kind.is_dir() {
            tracing::debug!("lookup {name:?} in {} = ENOTDIR", parent.ino());
            return Err(libc::ENOTDIR);
        }

        let archive = self.fs.archive();
        let entry = match archive.dir_lookup(parent.inode(), name.as_bytes()) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::trace!("lookup {name:?} in {} = <none>", parent.ino());
                return Ok(None);
            }
            Err(err) => {
                tracing::error!(?err, "lookup {name:?} in {}", parent.ino());
                return Err(libc::EIO);
            }
        };
        let child = archive.inode(entry.inode).map_err(|err| {
            tracing::debug!(?err, "lookup {name:?} = ENOENT");
            libc::ENOENT
        })?;
        let mut stat = archive.stat(&child).map_err(|err| {
            tracing::error!(?err, "lookup {name:?} stat");
            libc::EIO
        })?;

        // only count the reference once the reply is certain
        stat.ino = self.fs.registry().register(&entry);
        tracing::trace!("lookup {name:?} in {} = {}", parent.ino(), stat.ino);
        Ok(Some(stat))
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.activity.touch();
        self.fs.registry().forget(ino, nlookup);
    }

    pub fn batch_forget(&self, nodes: impl IntoIterator<Item = (u64, u64)>) {
        self.activity.touch();
        let registry = self.fs.registry();
        for (ino, nlookup) in nodes {
            registry.forget(ino, nlookup);
        }
    }

    pub fn opendir(&self, ino: u64) -> Result<u64, c_int> {
        self.activity.touch();
        let view = self.fs.view(ino)?;
        let fh = self.handles.open_dir(view.into_inode())?;
        tracing::trace!("opendir {ino} = {fh}");
        Ok(fh)
    }

    /// Collect the entries of an open directory that fit in `budget`
    /// bytes, starting from the kernel's resume offset.
    pub fn readdir(&self, fh: u64, offset: i64, budget: usize) -> Result<DirentBatch, c_int> {
        self.activity.touch();
        let mut batch = DirentBatch::with_budget(budget)?;
        let Some(dir) = self.handles.directory(fh) else {
            tracing::debug!("readdir {fh} = EBADF");
            return Err(libc::EBADF);
        };
        let Ok(offset) = u64::try_from(offset) else {
            return Err(libc::EINVAL);
        };

        let registry = self.fs.registry();
        let cursor = self.fs.archive().dir_open(&dir, offset).map_err(|err| {
            tracing::debug!(?err, "readdir {fh} @{offset} = EINVAL");
            libc::EINVAL
        })?;
        for entry in cursor {
            let entry = entry.map_err(|err| {
                tracing::error!(?err, "readdir {fh} @{offset}");
                libc::EIO
            })?;
            let ino = registry.peek(&entry);
            if !batch.push(ino, entry.next_offset, entry.kind, &entry.name) {
                break;
            }
        }
        tracing::trace!("readdir {fh} @{offset} = {} entries", batch.len());
        Ok(batch)
    }

    pub fn releasedir(&self, fh: u64) {
        self.activity.touch();
        if !self.handles.release_dir(fh) {
            tracing::warn!("releasedir of unknown directory handle {fh}");
        }
    }

    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, c_int> {
        self.activity.touch();
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            tracing::debug!("open {ino} {flags:#o} = EROFS");
            return Err(libc::EROFS);
        }
        let view = self.fs.view(ino)?;
        let fh = self.handles.open_file(view.into_inode()).inspect_err(|errno| {
            tracing::debug!("open {ino} = {errno}");
        })?;
        tracing::trace!("open {ino} = {fh}");
        Ok(fh)
    }

    pub fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, c_int> {
        self.activity.touch();
        let Some(file) = self.handles.file(fh) else {
            tracing::debug!("read {fh} = EBADF");
            return Err(libc::EBADF);
        };
        let Ok(offset) = u64::try_from(offset) else {
            return Err(libc::EINVAL);
        };

        let available = file.size.saturating_sub(offset);
        let len = available.min(size as u64) as usize;
        let mut buf = buffer(len)?;
        let count = self
            .fs
            .archive()
            .read_range(&file, offset, &mut buf)
            .map_err(|err| {
                tracing::error!(?err, "read {fh} @{offset}");
                libc::EIO
            })?;
        buf.truncate(count);
        tracing::trace!("read {fh} = {count}/{size}");
        Ok(buf)
    }

    pub fn release(&self, fh: u64) {
        self.activity.touch();
        if !self.handles.release_file(fh) {
            tracing::warn!("release of unknown file handle {fh}");
        }
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>, c_int> {
        self.activity.touch();
        let view = self.fs.view(ino)?;
        if !view.inode().kind.is_symlink() {
            return Err(libc::EINVAL);
        }
        let archive = self.fs.archive();
        let io_error = |err: arcfs::Error| {
            tracing::error!(?err, "readlink {ino}");
            libc::EIO
        };
        let len = archive.readlink_len(view.inode()).map_err(io_error)?;
        let mut target = buffer(len)?;
        let count = archive
            .readlink(view.inode(), &mut target)
            .map_err(io_error)?;
        target.truncate(count);
        Ok(target)
    }

    /// List the names of extended attributes.
    ///
    /// A zero size asks only for the space required.
    pub fn listxattr(&self, ino: u64, size: u32) -> Result<Xattr, c_int> {
        self.activity.touch();
        let view = self.fs.view(ino)?;
        let archive = self.fs.archive();
        let errno = |err: arcfs::Error| {
            let errno = err.os_error().unwrap_or(libc::EIO);
            tracing::debug!(?err, "listxattr {ino} = {errno}");
            errno
        };

        if size == 0 {
            let needed = archive.listxattr(view.inode(), None).map_err(errno)?;
            return size_of(needed).map(Xattr::Size);
        }
        let mut names = buffer(size as usize)?;
        let len = archive
            .listxattr(view.inode(), Some(&mut names))
            .map_err(errno)?;
        names.truncate(len);
        Ok(Xattr::Data(names))
    }

    /// Fetch the value of one extended attribute.
    ///
    /// A zero size asks only for the space required.
    pub fn getxattr(&self, ino: u64, name: &OsStr, size: u32) -> Result<Xattr, c_int> {
        self.activity.touch();
        let view = self.fs.view(ino)?;
        let archive = self.fs.archive();
        let io_error = |err: arcfs::Error| {
            tracing::error!(?err, "getxattr {ino} {name:?}");
            libc::EIO
        };

        let needed = archive
            .xattr_lookup(view.inode(), name.as_bytes(), None)
            .map_err(io_error)?;
        if needed == 0 {
            return Err(libc::ENODATA);
        }
        if size == 0 {
            return size_of(needed).map(Xattr::Size);
        }
        if (size as usize) < needed {
            return Err(libc::ERANGE);
        }
        let mut value = buffer(needed)?;
        archive
            .xattr_lookup(view.inode(), name.as_bytes(), Some(&mut value))
            .map_err(io_error)?;
        Ok(Xattr::Data(value))
    }

    pub fn statfs(&self) -> Result<StatFs, c_int> {
        self.activity.touch();
        self.fs.archive().statfs().map_err(|err| {
            let errno = err.os_error().unwrap_or(libc::EIO);
            tracing::error!(?err, "statfs = {errno}");
            errno
        })
    }

    /// Refuse an operation that would modify the filesystem
    pub fn refuse_write(&self, op: Mutation) -> c_int {
        self.activity.touch();
        tracing::debug!("{} = EROFS", op.name());
        libc::EROFS
    }

    /// Release everything still held for the kernel
    pub fn destroy(&self) {
        let open = self.handles.clear();
        if open > 0 {
            tracing::debug!("{open} handles were still open at shutdown");
        }
    }
}
