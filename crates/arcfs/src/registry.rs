// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Mapping between kernel-visible inode numbers and archive inodes

use dashmap::DashMap;

use crate::{DirEntry, InodeId};

#[cfg(test)]
#[path = "./registry_test.rs"]
mod registry_test;

/// The inode number that the kernel always uses for the mount root
pub const ROOT_INO: u64 = 1;

/// Translates between the inode numbers given to the kernel and
/// the inodes of an archive.
///
/// The kernel counts every successful lookup reply as a reference to
/// the returned number, and later releases them through forget. The
/// registry is free to reuse or drop a number once it has been forgotten.
pub trait InodeRegistry: Send + Sync {
    /// Assign a kernel number to the inode named by `entry`,
    /// adding one lookup reference to it
    fn register(&self, entry: &DirEntry) -> u64;

    /// The kernel number that would be assigned to the inode named
    /// by `entry`, without adding a lookup reference
    fn peek(&self, entry: &DirEntry) -> u64;

    /// The archive inode for a kernel number, if it is still known
    fn resolve(&self, ino: u64) -> Option<InodeId>;

    /// Release `nlookup` references previously added through [`Self::register`]
    fn forget(&self, ino: u64, nlookup: u64);
}

#[derive(Debug)]
struct Tracked {
    id: InodeId,
    lookups: u64,
}

/// An [`InodeRegistry`] that numbers inodes after their archive id and
/// keeps each mapping resolvable for as long as the kernel references it.
///
/// The root is pinned to [`ROOT_INO`], trading places with whichever
/// inode has that id, so every inode has exactly one number that can be
/// computed without recording anything.
#[derive(Debug)]
pub struct TrackingRegistry {
    root: InodeId,
    by_kernel: DashMap<u64, Tracked>,
}

impl TrackingRegistry {
    pub fn new(root: InodeId) -> Self {
        Self {
            root,
            by_kernel: DashMap::new(),
        }
    }

    /// The number of outstanding lookup references for a kernel number
    pub fn lookups(&self, ino: u64) -> u64 {
        self.by_kernel.get(&ino).map(|t| t.lookups).unwrap_or(0)
    }

    /// The number of non-root inodes currently tracked
    pub fn len(&self) -> usize {
        self.by_kernel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kernel.is_empty()
    }

    fn number_for(&self, id: InodeId) -> u64 {
        match id {
            id if id == self.root => ROOT_INO,
            InodeId(ROOT_INO) => self.root.0,
            InodeId(n) => n,
        }
    }
}

impl InodeRegistry for TrackingRegistry {
    fn register(&self, entry: &DirEntry) -> u64 {
        let ino = self.number_for(entry.inode);
        if ino != ROOT_INO {
            self.by_kernel
                .entry(ino)
                .or_insert(Tracked {
                    id: entry.inode,
                    lookups: 0,
                })
                .lookups += 1;
        }
        ino
    }

    fn peek(&self, entry: &DirEntry) -> u64 {
        self.number_for(entry.inode)
    }

    fn resolve(&self, ino: u64) -> Option<InodeId> {
        if ino == ROOT_INO {
            return Some(self.root);
        }
        self.by_kernel.get(&ino).map(|t| t.id)
    }

    fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let removed = self
            .by_kernel
            .remove_if_mut(&ino, |_, tracked| {
                tracked.lookups = tracked.lookups.saturating_sub(nlookup);
                tracked.lookups == 0
            });
        if let Some((_, tracked)) = removed {
            tracing::trace!(ino, id = %tracked.id, "evicted inode");
        }
    }
}
