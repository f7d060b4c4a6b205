// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for tests that need archive images on disk

use std::path::{Path, PathBuf};

use rstest::fixture;
use tar::{EntryType, Header};
use tempfile::TempDir;

/// The modification time given to every member of a test image
pub const FIXTURE_MTIME: u64 = 1_600_000_000;

pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

#[fixture]
pub fn tmpdir() -> TempDir {
    tempfile::Builder::new()
        .prefix("arcfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

/// Assembles a tar image in memory, optionally preceded by
/// arbitrary bytes so that the stream starts at some offset.
pub struct ImageBuilder {
    prefix: Vec<u8>,
    builder: tar::Builder<Vec<u8>>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            prefix: Vec::new(),
            builder: tar::Builder::new(Vec::new()),
        }
    }

    /// Place these bytes in the image before the tar stream
    pub fn with_prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = prefix.to_vec();
        self
    }

    /// The offset of the tar stream in the final image
    pub fn offset(&self) -> u64 {
        self.prefix.len() as u64
    }

    fn header(entry_type: EntryType, mode: u32, size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(size);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_mtime(FIXTURE_MTIME);
        header
    }

    pub fn dir(self, path: &str) -> Self {
        self.dir_with_mode(path, 0o755)
    }

    pub fn dir_with_mode(mut self, path: &str, mode: u32) -> Self {
        let mut header = Self::header(EntryType::Directory, mode, 0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("failed to append directory");
        self
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.file_with_mode(path, data, 0o644)
    }

    pub fn file_with_mode(mut self, path: &str, data: &[u8], mode: u32) -> Self {
        let mut header = Self::header(EntryType::Regular, mode, data.len() as u64);
        self.builder
            .append_data(&mut header, path, data)
            .expect("failed to append file");
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(EntryType::Symlink, 0o777, 0);
        header
            .set_link_name(target)
            .expect("failed to set symlink target");
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("failed to append symlink");
        self
    }

    pub fn hardlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Self::header(EntryType::Link, 0o644, 0);
        header
            .set_link_name(target)
            .expect("failed to set hard link target");
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("failed to append hard link");
        self
    }

    pub fn fifo(mut self, path: &str) -> Self {
        let mut header = Self::header(EntryType::Fifo, 0o600, 0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("failed to append fifo");
        self
    }

    pub fn char_device(mut self, path: &str, major: u32, minor: u32) -> Self {
        let mut header = Self::header(EntryType::Char, 0o600, 0);
        header.set_device_major(major).expect("failed to set major");
        header.set_device_minor(minor).expect("failed to set minor");
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("failed to append device");
        self
    }

    /// Append a file carrying the given extended attributes
    pub fn file_with_xattrs(mut self, path: &str, data: &[u8], xattrs: &[(&str, &[u8])]) -> Self {
        let keys = xattrs
            .iter()
            .map(|(name, value)| (format!("SCHILY.xattr.{name}"), *value))
            .collect::<Vec<_>>();
        self.builder
            .append_pax_extensions(keys.iter().map(|(k, v)| (k.as_str(), *v)))
            .expect("failed to append pax extensions");
        self.file(path, data)
    }

    /// Finish the tar stream and return the full image contents
    pub fn build(self) -> Vec<u8> {
        let mut image = self.prefix;
        image.extend(self.builder.into_inner().expect("failed to finish tar stream"));
        image
    }

    /// Finish the image and write it to `image.tar` in the given directory
    pub fn write_to(self, dir: &Path) -> PathBuf {
        let path = dir.join("image.tar");
        std::fs::write(&path, self.build()).expect("failed to write image");
        path
    }
}

/// A small image with one of each kind of member that tests rely on
pub fn sample_image() -> ImageBuilder {
    ImageBuilder::new()
        .dir("etc")
        .file("etc/hosts", b"127.0.0.1 localhost\n")
        .file_with_xattrs("etc/secure", b"secret", &[
            ("user.origin", b"fixture"),
            ("security.label", b"confined"),
        ])
        .dir("usr")
        .dir("usr/bin")
        .file_with_mode("usr/bin/tool", b"#!/bin/sh\necho hello\n", 0o755)
        .symlink("usr/bin/alias", "tool")
        .hardlink("usr/bin/tool-again", "usr/bin/tool")
        .fifo("pipe")
        .file("readme", b"arcfs fixture image\n")
}
