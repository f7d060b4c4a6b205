// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Component, Path};
use std::time::{Duration, UNIX_EPOCH};

use tar::EntryType;

use super::{ArchiveAccess, DirCursor, DirEntry, FileKind, Inode, InodeId, Stat, StatFs};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./tarball_test.rs"]
mod tarball_test;

/// The root directory is always the first inode
const ROOT: InodeId = InodeId(1);

/// Extended attributes are stored as pax records with this prefix,
/// the same convention used by GNU tar and libarchive
const XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";

// tar has no notion of a block size, so report the
// same unit that is used for the header records
const BLOCK_SIZE: u32 = 512;

// the longest name allowed in a single path component
const NAME_MAX: u32 = 255;

// ids that do not fit into 32 bits are reported as the
// kernel's overflow id rather than being truncated
const OVERFLOW_ID: u32 = 65534;

/// A tar stream, indexed once when opened and served with positional
/// reads from the underlying image file.
///
/// The stream can start at any byte offset in the image, which allows
/// an archive to be appended to some other file (eg: an executable).
pub struct TarArchive {
    image: File,
    offset: u64,
    image_len: u64,
    nodes: Vec<Node>,
}

#[derive(Debug)]
struct Node {
    inode: Inode,
    content: Content,
    /// Sorted by attribute name
    xattrs: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug)]
enum Content {
    /// Sorted by entry name
    Directory(Vec<(OsString, InodeId)>),
    /// The absolute position of the file data in the image
    File { position: u64 },
    Symlink(Vec<u8>),
    Special,
}

impl TarArchive {
    /// Open and index the tar stream found at `offset` bytes into the image
    pub fn open<P: AsRef<Path>>(path: P, offset: u64) -> Result<Self> {
        let path = path.as_ref();
        let image = File::open(path).map_err(|err| Error::ImageOpen(path.to_owned(), err))?;
        let image_len = image
            .metadata()
            .map_err(|err| Error::ImageOpen(path.to_owned(), err))?
            .len();
        let invalid = |source| Error::InvalidImage {
            path: path.to_owned(),
            offset,
            source,
        };

        if offset > image_len {
            return Err(invalid(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset is beyond the end of the image ({image_len} bytes)"),
            )));
        }
        let mut window = Window::new(&image, offset);
        window.seek(SeekFrom::Start(0)).map_err(invalid)?;

        let mut index = Index::new();
        {
            let mut archive = tar::Archive::new(window);
            for entry in archive.entries_with_seek().map_err(invalid)? {
                let mut entry = entry.map_err(invalid)?;
                index.add_entry(&mut entry, offset).map_err(invalid)?;
            }
        }
        let nodes = index.finish();
        tracing::debug!(
            image = %path.display(),
            offset,
            inodes = nodes.len(),
            "indexed tar archive"
        );

        Ok(Self {
            image,
            offset,
            image_len,
            nodes,
        })
    }

    /// The number of inodes in the archive
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, id: InodeId) -> Result<&Node> {
        id.0.checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| self.nodes.get(i))
            .ok_or(Error::UnknownInode(id))
    }

    fn entries(&self, dir: &Inode) -> Result<&[(OsString, InodeId)]> {
        match &self.node(dir.id)?.content {
            Content::Directory(entries) => Ok(entries),
            _ => Err(Error::NotADirectory(dir.id)),
        }
    }

    fn symlink_target(&self, link: &Inode) -> Result<&[u8]> {
        match &self.node(link.id)?.content {
            Content::Symlink(target) => Ok(target),
            _ => Err(Error::NotASymlink(link.id)),
        }
    }

    fn dir_entry(&self, name: &OsString, id: InodeId, next_offset: u64) -> Result<DirEntry> {
        Ok(DirEntry {
            name: name.clone(),
            inode: id,
            kind: self.node(id)?.inode.kind,
            next_offset,
        })
    }
}

impl ArchiveAccess for TarArchive {
    fn root(&self) -> InodeId {
        ROOT
    }

    fn inode(&self, id: InodeId) -> Result<Inode> {
        self.node(id).map(|n| n.inode.clone())
    }

    fn stat(&self, inode: &Inode) -> Result<Stat> {
        Ok(Stat {
            ino: inode.id.0,
            kind: inode.kind,
            perm: (inode.mode & 0o7777) as u16,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            rdev: inode.rdev,
            size: inode.size,
            blocks: inode.size.div_ceil(BLOCK_SIZE as u64),
            blksize: BLOCK_SIZE,
            mtime: inode.mtime,
        })
    }

    fn dir_open(&self, dir: &Inode, offset: u64) -> Result<DirCursor<'_>> {
        let entries = self.entries(dir)?;
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= entries.len())
            .ok_or(Error::InvalidDirOffset {
                inode: dir.id,
                offset,
            })?;
        let cursor = entries[start..]
            .iter()
            .zip(offset + 1..)
            .map(|((name, id), next_offset)| self.dir_entry(name, *id, next_offset));
        Ok(Box::new(cursor))
    }

    fn dir_lookup(&self, dir: &Inode, name: &[u8]) -> Result<Option<DirEntry>> {
        let entries = self.entries(dir)?;
        match entries.binary_search_by(|(n, _)| n.as_bytes().cmp(name)) {
            Ok(i) => {
                let (name, id) = &entries[i];
                self.dir_entry(name, *id, i as u64 + 1).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    fn read_range(&self, file: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Content::File { position } = self.node(file.id)?.content else {
            return Err(Error::NotAFile(file.id));
        };
        if offset >= file.size {
            return Ok(0);
        }
        let remaining = file.size - offset;
        let count = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.image
            .read_exact_at(&mut buf[..count], position + offset)
            .map_err(|err| Error::ReadError(file.id, err))?;
        Ok(count)
    }

    fn readlink_len(&self, link: &Inode) -> Result<usize> {
        self.symlink_target(link).map(<[u8]>::len)
    }

    fn readlink(&self, link: &Inode, buf: &mut [u8]) -> Result<usize> {
        let target = self.symlink_target(link)?;
        let Some(dest) = buf.get_mut(..target.len()) else {
            return Err(Error::BufferTooSmall {
                given: buf.len(),
                needed: target.len(),
            });
        };
        dest.copy_from_slice(target);
        Ok(target.len())
    }

    fn listxattr(&self, inode: &Inode, buf: Option<&mut [u8]>) -> Result<usize> {
        let xattrs = &self.node(inode.id)?.xattrs;
        let needed = xattrs.iter().map(|(name, _)| name.len() + 1).sum();
        let Some(buf) = buf else {
            return Ok(needed);
        };
        if buf.len() < needed {
            return Err(Error::BufferTooSmall {
                given: buf.len(),
                needed,
            });
        }
        let mut pos = 0;
        for (name, _) in xattrs {
            buf[pos..pos + name.len()].copy_from_slice(name);
            buf[pos + name.len()] = 0;
            pos += name.len() + 1;
        }
        Ok(needed)
    }

    fn xattr_lookup(&self, inode: &Inode, name: &[u8], buf: Option<&mut [u8]>) -> Result<usize> {
        let xattrs = &self.node(inode.id)?.xattrs;
        let Ok(i) = xattrs.binary_search_by(|(n, _)| n.as_slice().cmp(name)) else {
            return Ok(0);
        };
        let value = &xattrs[i].1;
        if let Some(dest) = buf.and_then(|buf| buf.get_mut(..value.len())) {
            dest.copy_from_slice(value);
        }
        Ok(value.len())
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(StatFs {
            blocks: (self.image_len - self.offset).div_ceil(BLOCK_SIZE as u64),
            blocks_free: 0,
            blocks_available: 0,
            files: self.nodes.len() as u64,
            files_free: 0,
            block_size: BLOCK_SIZE,
            name_max: NAME_MAX,
            fragment_size: BLOCK_SIZE,
        })
    }
}

/// A view of the image in which position zero is the start of the
/// tar stream, so that positions seen by the tar reader stay
/// consistent with the ones it counts itself.
struct Window<'a> {
    image: &'a File,
    start: u64,
}

impl<'a> Window<'a> {
    fn new(image: &'a File, start: u64) -> Self {
        Self { image, start }
    }
}

impl Read for Window<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut image = self.image;
        image.read(buf)
    }
}

impl Seek for Window<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let pos = match pos {
            SeekFrom::Start(relative) => SeekFrom::Start(
                self.start
                    .checked_add(relative)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek position overflows"))?,
            ),
            other => other,
        };
        let mut image = self.image;
        let absolute = image.seek(pos)?;
        absolute.checked_sub(self.start).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of the archive")
        })
    }
}

/// Accumulates the members of a tar stream into a tree of inodes
struct Index {
    nodes: Vec<Node>,
    children: BTreeMap<InodeId, BTreeMap<OsString, InodeId>>,
}

impl Index {
    fn new() -> Self {
        let mut index = Self {
            nodes: Vec::new(),
            children: BTreeMap::new(),
        };
        let root = index.push(implicit_dir(ROOT), Content::Directory(Vec::new()), Vec::new());
        debug_assert_eq!(root, ROOT);
        index
    }

    fn push(&mut self, inode: Inode, content: Content, xattrs: Vec<(Vec<u8>, Vec<u8>)>) -> InodeId {
        let id = InodeId(self.nodes.len() as u64 + 1);
        if inode.kind.is_dir() {
            self.children.entry(id).or_default();
        }
        self.nodes.push(Node {
            inode: Inode { id, ..inode },
            content,
            xattrs,
        });
        id
    }

    fn node_mut(&mut self, id: InodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize - 1]
    }

    fn is_dir(&self, id: InodeId) -> bool {
        self.nodes[id.0 as usize - 1].inode.kind.is_dir()
    }

    /// Find an existing inode by its path components
    fn resolve(&self, components: &[OsString]) -> Option<InodeId> {
        let mut current = ROOT;
        for name in components {
            current = *self.children.get(&current)?.get(name)?;
        }
        Some(current)
    }

    /// Find the directory that will contain the final component,
    /// creating any missing directories along the way
    fn ensure_parent(&mut self, components: &[OsString]) -> Option<InodeId> {
        let (_, parents) = components.split_last()?;
        let mut current = ROOT;
        for name in parents {
            current = match self.children.get(&current).and_then(|c| c.get(name)).copied() {
                Some(id) if self.is_dir(id) => id,
                Some(_) => return None,
                None => {
                    let id = self.push(
                        implicit_dir(InodeId(0)),
                        Content::Directory(Vec::new()),
                        Vec::new(),
                    );
                    self.children
                        .entry(current)
                        .or_default()
                        .insert(name.clone(), id);
                    id
                }
            };
        }
        Some(current)
    }

    fn add_entry<R: io::Read>(&mut self, entry: &mut tar::Entry<'_, R>, base: u64) -> io::Result<()> {
        let path = entry.path()?.into_owned();
        let Some(components) = normalize(&path) else {
            tracing::warn!(path = %path.display(), "skipping tar member with unsafe path");
            return Ok(());
        };

        let header = entry.header();
        let entry_type = header.entry_type();
        let kind = match entry_type {
            EntryType::Regular | EntryType::Continuous => FileKind::RegularFile,
            EntryType::Directory => FileKind::Directory,
            EntryType::Symlink => FileKind::Symlink,
            EntryType::Char => FileKind::CharDevice,
            EntryType::Block => FileKind::BlockDevice,
            EntryType::Fifo => FileKind::NamedPipe,
            EntryType::Link => {
                let target = entry.link_name()?.map(|t| t.into_owned());
                self.add_hard_link(&components, target.as_deref());
                return Ok(());
            }
            other => {
                tracing::debug!(path = %path.display(), kind = ?other, "skipping unsupported tar member");
                return Ok(());
            }
        };

        let mut inode = Inode {
            id: InodeId(0),
            kind,
            mode: header.mode()? & 0o7777,
            uid: narrow_id(header.uid()?),
            gid: narrow_id(header.gid()?),
            size: 0,
            mtime: UNIX_EPOCH + Duration::from_secs(header.mtime()?),
            nlink: 1,
            rdev: 0,
        };
        // only device members carry meaningful numbers, the fields
        // are left empty in the headers of everything else
        if matches!(kind, FileKind::CharDevice | FileKind::BlockDevice) {
            if let (Some(major), Some(minor)) = (header.device_major()?, header.device_minor()?) {
                inode.rdev = encode_dev(major, minor);
            }
        }
        let content = match kind {
            FileKind::RegularFile => {
                inode.size = entry.size();
                Content::File {
                    position: base + entry.raw_file_position(),
                }
            }
            FileKind::Symlink => {
                let target = entry
                    .link_name_bytes()
                    .map(|t| t.into_owned())
                    .unwrap_or_default();
                inode.size = target.len() as u64;
                Content::Symlink(target)
            }
            FileKind::Directory => Content::Directory(Vec::new()),
            _ => Content::Special,
        };

        let mut xattrs = Vec::new();
        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                let Ok(key) = extension.key() else {
                    continue;
                };
                if let Some(name) = key.strip_prefix(XATTR_PAX_PREFIX) {
                    xattrs.push((name.as_bytes().to_vec(), extension.value_bytes().to_vec()));
                }
            }
        }
        xattrs.sort();
        xattrs.dedup_by(|a, b| a.0 == b.0);

        self.insert(&path, &components, inode, content, xattrs);
        Ok(())
    }

    fn insert(
        &mut self,
        path: &Path,
        components: &[OsString],
        inode: Inode,
        content: Content,
        xattrs: Vec<(Vec<u8>, Vec<u8>)>,
    ) {
        let Some(name) = components.last() else {
            // only the root itself has no components, and
            // it can only ever be replaced by another directory
            if inode.kind.is_dir() {
                let root = self.node_mut(ROOT);
                root.inode = Inode { id: ROOT, ..inode };
                root.xattrs = xattrs;
            }
            return;
        };
        let Some(parent) = self.ensure_parent(components) else {
            tracing::warn!(path = %path.display(), "skipping tar member nested under a non-directory");
            return;
        };

        let existing = self.children.get(&parent).and_then(|c| c.get(name)).copied();
        match existing {
            Some(id) if inode.kind.is_dir() && self.is_dir(id) => {
                // a directory can be listed again after some of its
                // contents, keep the contents but take the new metadata
                let node = self.node_mut(id);
                node.inode = Inode { id, ..inode };
                node.xattrs = xattrs;
            }
            _ => {
                // later members replace earlier ones with the same path
                let id = self.push(inode, content, xattrs);
                self.children
                    .entry(parent)
                    .or_default()
                    .insert(name.clone(), id);
            }
        }
    }

    fn add_hard_link(&mut self, components: &[OsString], target: Option<&Path>) {
        let target_id = target
            .and_then(normalize)
            .and_then(|target| self.resolve(&target));
        let Some(target_id) = target_id.filter(|id| !self.is_dir(*id)) else {
            tracing::warn!(?target, "skipping hard link to a missing or directory member");
            return;
        };
        let (Some(name), Some(parent)) = (components.last(), self.ensure_parent(components)) else {
            return;
        };
        self.children
            .entry(parent)
            .or_default()
            .insert(name.clone(), target_id);
        self.node_mut(target_id).inode.nlink += 1;
    }

    fn finish(mut self) -> Vec<Node> {
        for (id, children) in std::mem::take(&mut self.children) {
            let subdirs = children.values().filter(|c| self.is_dir(**c)).count();
            let node = self.node_mut(id);
            node.inode.nlink = 2 + subdirs as u32;
            node.inode.size = children.len() as u64;
            node.content = Content::Directory(children.into_iter().collect());
        }
        self.nodes
    }
}

fn implicit_dir(id: InodeId) -> Inode {
    Inode {
        id,
        kind: FileKind::Directory,
        mode: 0o755,
        uid: 0,
        gid: 0,
        size: 0,
        mtime: UNIX_EPOCH,
        nlink: 2,
        rdev: 0,
    }
}

/// Split an archive member path into its names, relative to the root.
///
/// Returns None for paths that try to escape the root.
fn normalize(path: &Path) -> Option<Vec<OsString>> {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => components.push(name.to_os_string()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => continue,
            Component::ParentDir => return None,
        }
    }
    Some(components)
}

fn narrow_id(id: u64) -> u32 {
    u32::try_from(id).unwrap_or(OVERFLOW_ID)
}

/// Pack a device number the way the kernel expects it in 32 bits
fn encode_dev(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12)
}
