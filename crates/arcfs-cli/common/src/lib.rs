// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Common macros and argument structures for the arcfs command line

mod args;

pub use args::{configure_logging, filter_directives, Logging, ARCFS_LOG};

#[doc(hidden)]
pub mod __private {
    pub use arcfs;
}
