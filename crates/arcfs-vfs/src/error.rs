// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// A specialized result for mount and session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors in establishing or tearing down the filesystem
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    /// The filesystem could not be mounted
    #[error("Failed to mount filesystem at {0}")]
    #[diagnostic(
        code("arcfs::mount"),
        help("Check that the mountpoint exists and that fuse is available to this user")
    )]
    Mount(PathBuf, #[source] io::Error),

    /// The kernel channel could not be opened
    #[error("Failed to open the fuse channel")]
    #[diagnostic(code("arcfs::channel"))]
    Channel(#[source] io::Error),

    /// The serving loop failed
    #[error("FUSE session failed")]
    Session(#[source] io::Error),

    /// The filesystem could not be detached from its mountpoint
    #[error("Failed to unmount {0}")]
    Unmount(PathBuf, #[source] io::Error),

    /// An operation required an established mount
    #[error("Filesystem is not mounted")]
    NotMounted,

    /// Mount was called more than once
    #[error("Filesystem is already mounted")]
    AlreadyMounted,

    /// The archive could not be opened or read
    #[error("Failed to load the archive")]
    Archive(#[from] arcfs::Error),
}

