// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arcfs::Inode;
use dashmap::DashMap;
use libc::c_int;

use crate::idle::Activity;

#[cfg(test)]
#[path = "./handles_test.rs"]
mod handles_test;

/// An open directory
#[derive(Debug)]
pub struct DirectoryHandle {
    inode: Inode,
}

/// An open regular file
#[derive(Debug)]
pub struct FileHandle {
    inode: Inode,
}

#[derive(Debug)]
pub enum Handle {
    Directory(DirectoryHandle),
    File(FileHandle),
}

/// Tracks the handles given to the kernel for open files
/// and directories, and how many of them remain open.
#[derive(Debug)]
pub struct HandleTable {
    next_handle: AtomicU64,
    handles: DashMap<u64, Handle>,
    activity: Arc<Activity>,
}

impl HandleTable {
    pub fn new(activity: Arc<Activity>) -> Self {
        Self {
            // we do not allocate handle 0, so skip it for now
            next_handle: AtomicU64::new(1),
            handles: DashMap::new(),
            activity,
        }
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // the zero handle is never allocated so that it
                // can never be confused with a missing handle
                continue;
            }
            match self.handles.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(data);
                    break id;
                }
            }
        }
    }

    /// Open a directory, returning its new handle
    pub fn open_dir(&self, inode: Inode) -> Result<u64, c_int> {
        if !inode.kind.is_dir() {
            return Err(libc::ENOTDIR);
        }
        let fh = self.allocate_handle(Handle::Directory(DirectoryHandle { inode }));
        self.activity.opened();
        Ok(fh)
    }

    /// Open a regular file, returning its new handle
    pub fn open_file(&self, inode: Inode) -> Result<u64, c_int> {
        if !inode.kind.is_file() {
            return Err(libc::EISDIR);
        }
        let fh = self.allocate_handle(Handle::File(FileHandle { inode }));
        self.activity.opened();
        Ok(fh)
    }

    /// The directory open under this handle, if any
    pub fn directory(&self, fh: u64) -> Option<Inode> {
        match self.handles.get(&fh)?.value() {
            Handle::Directory(dir) => Some(dir.inode.clone()),
            Handle::File(_) => None,
        }
    }

    /// The file open under this handle, if any
    pub fn file(&self, fh: u64) -> Option<Inode> {
        match self.handles.get(&fh)?.value() {
            Handle::File(file) => Some(file.inode.clone()),
            Handle::Directory(_) => None,
        }
    }

    /// Close a directory handle.
    ///
    /// Returns false, leaving everything untouched, when
    /// the handle is unknown or does not name a directory.
    pub fn release_dir(&self, fh: u64) -> bool {
        self.release(fh, |h| matches!(h, Handle::Directory(_)))
    }

    /// Close a file handle.
    ///
    /// Returns false, leaving everything untouched, when
    /// the handle is unknown or does not name a file.
    pub fn release_file(&self, fh: u64) -> bool {
        self.release(fh, |h| matches!(h, Handle::File(_)))
    }

    fn release(&self, fh: u64, is_kind: impl FnOnce(&Handle) -> bool) -> bool {
        if self.handles.remove_if(&fh, |_, h| is_kind(h)).is_none() {
            return false;
        }
        if !self.activity.closed() {
            tracing::warn!("open handle count was already zero when releasing {fh}");
        }
        true
    }

    /// The number of handles currently open
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drop every open handle, returning how many there were
    pub(crate) fn clear(&self) -> usize {
        let count = self.handles.len();
        self.handles.clear();
        count
    }
}
