// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Read-only access to archive images, and the inode bookkeeping
//! required to present them as a filesystem.

#![deny(unsafe_op_in_unsafe_fn)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub mod archive;
pub mod config;
mod error;
pub mod registry;

pub use archive::{
    ArchiveAccess,
    DirCursor,
    DirEntry,
    FileKind,
    Inode,
    InodeId,
    Stat,
    StatFs,
    TarArchive,
};
pub use error::{Error, OsError, Result};
pub use registry::{InodeRegistry, TrackingRegistry, ROOT_INO};

pub use self::config::{load_config, Config, Transport};
