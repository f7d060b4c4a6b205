// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use arcfs::{ArchiveAccess, Inode, InodeRegistry, Stat, TarArchive, TrackingRegistry};
use libc::c_int;

#[cfg(test)]
#[path = "./filesystem_test.rs"]
mod filesystem_test;

/// The opened archive together with the numbers that
/// have been handed out to the kernel for its inodes.
pub struct FilesystemHandle {
    archive: Box<dyn ArchiveAccess>,
    registry: Box<dyn InodeRegistry>,
}

impl FilesystemHandle {
    pub fn new(archive: Box<dyn ArchiveAccess>, registry: Box<dyn InodeRegistry>) -> Self {
        Self { archive, registry }
    }

    /// Open the tar archive found at `offset` bytes into the image at `path`
    pub fn open<P: AsRef<Path>>(path: P, offset: u64) -> crate::Result<Self> {
        let archive = TarArchive::open(path, offset)?;
        let registry = TrackingRegistry::new(archive.root());
        Ok(Self::new(Box::new(archive), Box::new(registry)))
    }

    pub fn archive(&self) -> &dyn ArchiveAccess {
        self.archive.as_ref()
    }

    pub fn registry(&self) -> &dyn InodeRegistry {
        self.registry.as_ref()
    }

    /// Resolve a kernel inode number for the duration of one request
    pub fn view(&self, ino: u64) -> Result<InodeView<'_>, c_int> {
        let Some(id) = self.registry.resolve(ino) else {
            tracing::debug!("resolve {ino} = ENOENT");
            return Err(libc::ENOENT);
        };
        match self.archive.inode(id) {
            Ok(inode) => Ok(InodeView {
                fs: self,
                ino,
                inode,
            }),
            Err(err) => {
                tracing::debug!(?err, "resolve {ino} ({id}) = ENOENT");
                Err(libc::ENOENT)
            }
        }
    }
}

/// An archive inode paired with the kernel number it was requested by
pub struct InodeView<'a> {
    fs: &'a FilesystemHandle,
    ino: u64,
    inode: Inode,
}

impl InodeView<'_> {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn into_inode(self) -> Inode {
        self.inode
    }

    /// The attributes of this inode, reported under its kernel number
    pub fn stat(&self) -> arcfs::Result<Stat> {
        let mut stat = self.fs.archive.stat(&self.inode)?;
        stat.ino = self.ino;
        Ok(stat)
    }
}
