// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Serving an archive image to the kernel over FUSE
//!
//! The [`Dispatcher`] holds the semantics of each operation, while
//! [`Session`] adapts it to the fuse library and a [`MountStrategy`]
//! attaches it to a mountpoint. An [`IdleSupervisor`] can interrupt
//! the session once nothing has touched the filesystem for a while.

pub mod dirent;
mod dispatch;
mod error;
mod filesystem;
mod fuse;
pub mod handles;
pub mod idle;
mod mount;

pub use dirent::DirentBatch;
pub use dispatch::{Dispatcher, Mutation, Xattr};
pub use error::{Error, Result};
pub use filesystem::{FilesystemHandle, InodeView};
pub use fuse::Session;
pub use handles::HandleTable;
pub use idle::{Activity, IdleState, IdleSupervisor, Tick};
pub use mount::{strategy, ChannelMount, Interrupter, MountStrategy, SessionMount};
