// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::InodeId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error("Failed to open archive image {0}")]
    #[diagnostic(
        code("arcfs::image_open"),
        help("Check that the image exists and is readable by the current user")
    )]
    ImageOpen(PathBuf, #[source] io::Error),
    #[error("Invalid archive image {path} at offset {offset}")]
    #[diagnostic(code("arcfs::invalid_image"))]
    InvalidImage {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Unknown inode: {0}")]
    UnknownInode(InodeId),
    #[error("Inode {0} is not a directory")]
    NotADirectory(InodeId),
    #[error("Inode {0} is not a regular file")]
    NotAFile(InodeId),
    #[error("Inode {0} is not a symbolic link")]
    NotASymlink(InodeId),
    #[error("Invalid directory offset {offset} for inode {inode}")]
    InvalidDirOffset { inode: InodeId, offset: u64 },
    #[error("Buffer of {given} bytes is too small, {needed} bytes are required")]
    BufferTooSmall { given: usize, needed: usize },
    #[error("Failed to read archive data for inode {0}")]
    ReadError(InodeId, #[source] io::Error),
    #[error("Failed to load configuration")]
    #[diagnostic(code("arcfs::config"))]
    Config(#[from] config::ConfigError),
    #[error("{0}")]
    String(String),
}

/// A type that may be able to report a matching os error code
pub trait OsError {
    /// The underlying os error code for this error, if any
    fn os_error(&self) -> Option<i32>;
}

impl OsError for io::Error {
    fn os_error(&self) -> Option<i32> {
        match self.raw_os_error() {
            Some(errno) => Some(errno),
            None => match self.kind() {
                io::ErrorKind::UnexpectedEof => Some(libc::EIO),
                io::ErrorKind::NotFound => Some(libc::ENOENT),
                io::ErrorKind::OutOfMemory => Some(libc::ENOMEM),
                _ => None,
            },
        }
    }
}

impl OsError for Error {
    fn os_error(&self) -> Option<i32> {
        match self {
            Error::ImageOpen(_, err) => err.os_error(),
            Error::InvalidImage { .. } => Some(libc::EINVAL),
            Error::UnknownInode(_) => Some(libc::ENOENT),
            Error::NotADirectory(_) => Some(libc::ENOTDIR),
            Error::NotAFile(_) => Some(libc::EISDIR),
            Error::NotASymlink(_) => Some(libc::EINVAL),
            Error::InvalidDirOffset { .. } => Some(libc::EINVAL),
            Error::BufferTooSmall { .. } => Some(libc::ERANGE),
            Error::ReadError(_, _) => Some(libc::EIO),
            Error::Config(_) | Error::String(_) => None,
        }
    }
}
