// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Attaching a [`Session`] to a mountpoint.
//!
//! There are two ways to get a fuse session mounted: either the fuse
//! library does everything in one step, or the channel to the kernel is
//! opened and mounted here and handed to the library afterwards. Both
//! are exposed through the same [`MountStrategy`] so that the caller
//! can pick one from configuration.

use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use arcfs::Transport;
use fuser::{MountOption, SessionACL, SessionUnmounter};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};

use crate::dispatch::Dispatcher;
use crate::fuse::Session;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./mount_test.rs"]
mod mount_test;

const FUSE_DEVICE: &str = "/dev/fuse";
const DEFAULT_FSNAME: &str = "arcfs";
const UNMOUNT_HELPERS: &[&str] = &["fusermount3", "fusermount"];

/// Mounts and unmounts a filesystem session, and runs
/// the loop that serves its requests.
pub trait MountStrategy: Send {
    /// Attach the filesystem at `mountpoint`.
    ///
    /// Nothing is left open or mounted if this fails.
    fn mount(&mut self, mountpoint: &Path, options: &[MountOption], fs: Session) -> Result<()>;

    /// Serve requests until the filesystem is unmounted or interrupted
    fn run(&mut self) -> Result<()>;

    /// A value that can make [`Self::run`] return from another thread
    fn interrupter(&mut self) -> Result<Interrupter>;

    /// Release the filesystem, then tear down the session
    /// and detach it from the mountpoint.
    ///
    /// Only the first call has any effect.
    fn unmount(&mut self) -> Result<()>;
}

/// Create the strategy that implements a transport
pub fn strategy(transport: Transport) -> Box<dyn MountStrategy> {
    match transport {
        Transport::Session => Box::<SessionMount>::default(),
        Transport::Channel => Box::<ChannelMount>::default(),
    }
}

/// Stops a running session from another thread
pub struct Interrupter {
    mountpoint: PathBuf,
    method: Method,
}

enum Method {
    Unmounter(SessionUnmounter),
    Detach,
}

impl Interrupter {
    pub fn interrupt(&mut self) -> Result<()> {
        tracing::debug!(mountpoint = %self.mountpoint.display(), "interrupting session");
        match &mut self.method {
            Method::Unmounter(unmounter) => unmounter
                .unmount()
                .map_err(|err| Error::Unmount(self.mountpoint.clone(), err)),
            Method::Detach => lazy_unmount(&self.mountpoint),
        }
    }

    /// Detach the filesystem even when the session is no longer
    /// answering, for use once [`Self::interrupt`] has not worked.
    pub fn force(&self) -> Result<()> {
        tracing::warn!(mountpoint = %self.mountpoint.display(), "forcing detach");
        detach(&self.mountpoint)
    }
}

/// Mounts in one step through [`fuser::Session::new`]
#[derive(Default)]
pub struct SessionMount {
    mountpoint: Option<PathBuf>,
    session: Option<fuser::Session<Session>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl MountStrategy for SessionMount {
    fn mount(&mut self, mountpoint: &Path, options: &[MountOption], fs: Session) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyMounted);
        }
        tracing::debug!("Establishing fuse session...");
        let dispatcher = fs.shared_dispatcher();
        let session = fuser::Session::new(fs, mountpoint, options)
            .map_err(|err| Error::Mount(mountpoint.to_owned(), err))?;
        self.session = Some(session);
        self.dispatcher = Some(dispatcher);
        self.mountpoint = Some(mountpoint.to_owned());
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotMounted)?;
        session.run().map_err(Error::Session)
    }

    fn interrupter(&mut self) -> Result<Interrupter> {
        let (Some(session), Some(mountpoint)) = (self.session.as_mut(), &self.mountpoint) else {
            return Err(Error::NotMounted);
        };
        Ok(Interrupter {
            mountpoint: mountpoint.clone(),
            method: Method::Unmounter(session.unmount_callable()),
        })
    }

    fn unmount(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        release_then(self.dispatcher.take(), || {
            session.unmount();
            drop(session);
            Ok(())
        })?;
        if let Some(mountpoint) = self.mountpoint.take() {
            tracing::debug!(mountpoint = %mountpoint.display(), "unmounted");
        }
        Ok(())
    }
}

/// Opens the kernel channel and mounts it directly, then
/// serves it with [`fuser::Session::from_fd`].
///
/// Mounting this way requires privileges.
#[derive(Default)]
pub struct ChannelMount {
    mountpoint: Option<PathBuf>,
    session: Option<fuser::Session<Session>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl MountStrategy for ChannelMount {
    fn mount(&mut self, mountpoint: &Path, options: &[MountOption], fs: Session) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyMounted);
        }
        tracing::debug!("Opening fuse channel...");
        let channel = OpenOptions::new()
            .read(true)
            .write(true)
            .open(FUSE_DEVICE)
            .map_err(Error::Channel)?;

        let args = KernelMount::new(
            channel.as_raw_fd(),
            options,
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        );
        tracing::debug!(?args, "Mounting fuse channel...");
        // the channel is closed when dropped on failure
        nix::mount::mount(
            Some(args.source.as_str()),
            mountpoint,
            Some(args.fstype.as_str()),
            args.flags,
            Some(args.data.as_str()),
        )
        .map_err(|errno| Error::Mount(mountpoint.to_owned(), errno.into()))?;

        let dispatcher = fs.shared_dispatcher();
        let session = fuser::Session::from_fd(fs, OwnedFd::from(channel), session_acl(options));
        self.session = Some(session);
        self.dispatcher = Some(dispatcher);
        self.mountpoint = Some(mountpoint.to_owned());
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotMounted)?;
        session.run().map_err(Error::Session)
    }

    fn interrupter(&mut self) -> Result<Interrupter> {
        let Some(mountpoint) = self.mountpoint.as_ref().filter(|_| self.session.is_some()) else {
            return Err(Error::NotMounted);
        };
        Ok(Interrupter {
            mountpoint: mountpoint.clone(),
            method: Method::Detach,
        })
    }

    fn unmount(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let mountpoint = self.mountpoint.take();
        release_then(self.dispatcher.take(), || {
            // the session owns the channel, which must be
            // closed before the mount can be fully released
            drop(session);
            match mountpoint {
                Some(mountpoint) => detach(&mountpoint),
                None => Ok(()),
            }
        })
    }
}

/// Release everything the filesystem still holds, and only
/// then take away the transport with `teardown`
fn release_then<F>(dispatcher: Option<Arc<Dispatcher>>, teardown: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    if let Some(dispatcher) = dispatcher {
        dispatcher.destroy();
    }
    teardown()
}

/// The arguments to the mount system call for a fuse channel
#[derive(Debug, Clone, PartialEq, Eq)]
struct KernelMount {
    source: String,
    fstype: String,
    flags: MsFlags,
    data: String,
}

impl KernelMount {
    fn new(fd: RawFd, options: &[MountOption], uid: u32, gid: u32) -> Self {
        let mut source = DEFAULT_FSNAME.to_string();
        let mut fstype = "fuse".to_string();
        let mut flags = MsFlags::empty();
        let mut data = format!("fd={fd},rootmode=40000,user_id={uid},group_id={gid}");
        for option in options {
            match option {
                MountOption::FSName(name) => source = name.clone(),
                MountOption::Subtype(subtype) => fstype = format!("fuse.{subtype}"),
                MountOption::RO => flags |= MsFlags::MS_RDONLY,
                MountOption::NoDev => flags |= MsFlags::MS_NODEV,
                MountOption::NoSuid => flags |= MsFlags::MS_NOSUID,
                MountOption::NoExec => flags |= MsFlags::MS_NOEXEC,
                MountOption::NoAtime => flags |= MsFlags::MS_NOATIME,
                MountOption::Sync => flags |= MsFlags::MS_SYNCHRONOUS,
                MountOption::DirSync => flags |= MsFlags::MS_DIRSYNC,
                MountOption::AllowOther | MountOption::AllowRoot => {
                    if !data.contains(",allow_other") {
                        data.push_str(",allow_other");
                    }
                }
                MountOption::DefaultPermissions => data.push_str(",default_permissions"),
                MountOption::CUSTOM(opt) => {
                    data.push(',');
                    data.push_str(opt);
                }
                MountOption::AutoUnmount => {
                    tracing::warn!("auto_unmount is not available when mounting a channel directly");
                }
                // the remaining options are defaults for a new mount
                _ => {}
            }
        }
        Self {
            source,
            fstype,
            flags,
            data,
        }
    }
}

fn session_acl(options: &[MountOption]) -> SessionACL {
    if options.contains(&MountOption::AllowOther) {
        SessionACL::All
    } else if options.contains(&MountOption::AllowRoot) {
        SessionACL::RootAndOwner
    } else {
        SessionACL::Owner
    }
}

/// Find the first unmount helper program in a `PATH`-style list
fn find_unmount_helper(search_path: &OsStr) -> Option<PathBuf> {
    UNMOUNT_HELPERS.iter().find_map(|name| {
        std::env::split_paths(search_path)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Detach a mount, preferring the fuse helper when it is installed
fn detach(mountpoint: &Path) -> Result<()> {
    let helper = std::env::var_os("PATH").and_then(|path| find_unmount_helper(&path));
    if let Some(helper) = helper {
        match Command::new(&helper)
            .arg("-u")
            .arg("-z")
            .arg(mountpoint)
            .status()
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => {
                tracing::debug!(helper = %helper.display(), %status, "unmount helper failed")
            }
            Err(err) => {
                tracing::debug!(helper = %helper.display(), ?err, "unmount helper could not run")
            }
        }
    }
    lazy_unmount(mountpoint)
}

fn lazy_unmount(mountpoint: &Path) -> Result<()> {
    match nix::mount::umount2(mountpoint, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        // not (or no longer) a mountpoint
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(errno) => Err(Error::Unmount(mountpoint.to_owned(), errno.into())),
    }
}
