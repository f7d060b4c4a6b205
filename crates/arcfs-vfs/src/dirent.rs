// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{OsStr, OsString};

use arcfs::FileKind;
use libc::c_int;

#[cfg(test)]
#[path = "./dirent_test.rs"]
mod dirent_test;

/// The fixed part of a `fuse_dirent`: ino, off, namelen and type
const DIRENT_HEADER: usize = 24;

/// The space taken by one directory entry in a readdir reply,
/// including the padding that aligns the next record to 8 bytes
pub fn dirent_size(name_len: usize) -> usize {
    (DIRENT_HEADER + name_len + 7) & !7
}

/// One directory entry ready to be sent to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    /// The offset at which to resume listing after this entry
    pub offset: u64,
    pub kind: FileKind,
    pub name: OsString,
}

/// Collects the entries of a single readdir reply, never
/// exceeding the number of bytes that the kernel asked for.
#[derive(Debug)]
pub struct DirentBatch {
    budget: usize,
    used: usize,
    entries: Vec<Dirent>,
}

impl DirentBatch {
    pub fn with_budget(budget: usize) -> Result<Self, c_int> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(budget / dirent_size(1))
            .map_err(|_| libc::ENOMEM)?;
        Ok(Self {
            budget,
            used: 0,
            entries,
        })
    }

    /// Append an entry if it fits in the remaining space.
    ///
    /// Returns false, without taking the entry, when it does not.
    pub fn push(&mut self, ino: u64, offset: u64, kind: FileKind, name: &OsStr) -> bool {
        let size = dirent_size(name.len());
        if size > self.remaining() {
            return false;
        }
        self.used += size;
        self.entries.push(Dirent {
            ino,
            offset,
            kind,
            name: name.to_owned(),
        });
        true
    }

    pub fn remaining(&self) -> usize {
        self.budget - self.used
    }

    /// The encoded size of all entries so far
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Dirent] {
        &self.entries
    }
}
