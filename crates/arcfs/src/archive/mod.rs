// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Read access to the contents of an immutable archive image

mod tarball;

use std::ffi::OsString;
use std::time::SystemTime;

pub use self::tarball::TarArchive;
use crate::Result;

/// Identifies an inode record within an archive.
///
/// These numbers are internal to the archive and are distinct from
/// the inode numbers handed out to the kernel, see [`crate::InodeRegistry`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(pub u64);

impl std::fmt::Display for InodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
}

impl FileKind {
    /// The `S_IFMT` bits for this kind of file
    pub fn format_bits(&self) -> u32 {
        match self {
            Self::Directory => libc::S_IFDIR,
            Self::RegularFile => libc::S_IFREG,
            Self::Symlink => libc::S_IFLNK,
            Self::CharDevice => libc::S_IFCHR,
            Self::BlockDevice => libc::S_IFBLK,
            Self::NamedPipe => libc::S_IFIFO,
            Self::Socket => libc::S_IFSOCK,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::RegularFile)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Self::Symlink)
    }
}

/// A decoded inode record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub id: InodeId,
    pub kind: FileKind,
    /// Permission bits only, see [`FileKind::format_bits`] for the rest
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: SystemTime,
    pub nlink: u32,
    pub rdev: u32,
}

impl Inode {
    /// The full `st_mode` value for this inode
    pub fn st_mode(&self) -> u32 {
        self.kind.format_bits() | (self.mode & 0o7777)
    }
}

/// The attributes of an inode as reported to callers of stat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub ino: u64,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub mtime: SystemTime,
}

/// One named member of a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub inode: InodeId,
    pub kind: FileKind,
    /// The offset that resumes iteration just after this entry
    pub next_offset: u64,
}

/// Filesystem-wide statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// Iterates the entries of one directory, starting from some offset
pub type DirCursor<'a> = Box<dyn Iterator<Item = Result<DirEntry>> + Send + 'a>;

/// The primitives required to serve an archive as a filesystem.
///
/// Implementations are expected to be immutable once opened, every
/// method takes a shared reference and the same inputs always produce
/// the same outputs for the life of the value.
pub trait ArchiveAccess: Send + Sync {
    /// The root directory of the archive
    fn root(&self) -> InodeId;

    /// Decode the inode record for the given id
    fn inode(&self, id: InodeId) -> Result<Inode>;

    /// Produce the attributes of an inode
    fn stat(&self, inode: &Inode) -> Result<Stat>;

    /// Open an iterator over a directory's entries.
    ///
    /// Offset zero is the start of the directory, otherwise it must be a
    /// value previously reported as some entry's [`DirEntry::next_offset`].
    fn dir_open(&self, dir: &Inode, offset: u64) -> Result<DirCursor<'_>>;

    /// Find a single entry in a directory by name
    fn dir_lookup(&self, dir: &Inode, name: &[u8]) -> Result<Option<DirEntry>>;

    /// Read file data starting at `offset` into `buf`, returning the
    /// number of bytes read. Zero is returned at or beyond the end of file.
    fn read_range(&self, file: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// The length in bytes of a symlink's target
    fn readlink_len(&self, link: &Inode) -> Result<usize>;

    /// Copy a symlink's target into `buf`, returning the length written
    fn readlink(&self, link: &Inode, buf: &mut [u8]) -> Result<usize>;

    /// Report the size of the NUL-separated list of extended attribute
    /// names, filling `buf` with that list when one is given.
    ///
    /// Fails with [`crate::Error::BufferTooSmall`] if the given buffer
    /// cannot hold the full list.
    fn listxattr(&self, inode: &Inode, buf: Option<&mut [u8]>) -> Result<usize>;

    /// Report the size of the named extended attribute's value, zero if it
    /// does not exist. The value is copied into `buf` only if one is given
    /// and it is large enough.
    fn xattr_lookup(&self, inode: &Inode, name: &[u8], buf: Option<&mut [u8]>) -> Result<usize>;

    /// Filesystem-wide statistics
    fn statfs(&self) -> Result<StatFs>;
}
