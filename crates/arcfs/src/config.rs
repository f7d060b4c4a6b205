// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

const SYSTEM_CONFIG: &str = "/etc/arcfs";
const ENV_PREFIX: &str = "ARCFS_";

/// How the filesystem is attached to the mountpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Let the fuse library open the channel and perform the mount
    #[default]
    Session,
    /// Open `/dev/fuse` directly and mount it with a system call,
    /// handing the open channel to the fuse library afterwards
    Channel,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Channel => f.write_str("channel"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "channel" => Ok(Self::Channel),
            other => Err(Error::String(format!(
                "Unknown transport '{other}', expected one of: session, channel"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Fuse {
    /// Unmount after this many seconds without any filesystem activity
    /// and no open files or directories, zero to disable
    pub idle_timeout_secs: u64,
    pub transport: Transport,
    /// Additional mount options, in the same comma-separated form
    /// accepted on the command line
    pub mount_options: String,
}

impl Fuse {
    /// The individual entries of [`Self::mount_options`]
    pub fn mount_options(&self) -> impl Iterator<Item = &str> {
        self.mount_options
            .split(',')
            .map(str::trim)
            .filter(|opt| !opt.is_empty())
    }
}

/// Configuration values for arcfs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // These sub-types should only have one level of values within
    // them, otherwise they cannot be addressed with environment variables.
    pub fuse: Fuse,
}

impl Config {
    /// Parse a config from a toml string, without any other sources
    pub fn load_string<S: AsRef<str>>(conf: S) -> Result<Self> {
        use config::{Config as RawConfig, File, FileFormat};

        let config = RawConfig::builder()
            .add_source(File::from_str(conf.as_ref(), FileFormat::Toml))
            .build()?;
        Ok(Config::deserialize(config)?)
    }
}

/// The per-user configuration file, without an extension
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("arcfs").join("arcfs"))
}

/// Load the arcfs configuration.
///
/// This includes the defaults, the system and user config files (if they
/// exist) and any `ARCFS_<SECTION>_<NAME>` environment variables.
pub fn load_config() -> Result<Config> {
    load_config_from(
        SYSTEM_CONFIG,
        user_config_path(),
        std::env::vars(),
    )
}

pub(crate) fn load_config_from<I>(
    system_config: &str,
    user_config: Option<PathBuf>,
    vars: I,
) -> Result<Config>
where
    I: IntoIterator<Item = (String, String)>,
{
    use config::{Config as RawConfig, File};

    // either file can be written in any supported format: toml, yaml, json, ini, etc
    let mut config_builder =
        RawConfig::builder().add_source(File::with_name(system_config).required(false));
    if let Some(user_config) = user_config {
        config_builder = config_builder
            .add_source(File::with_name(&format!("{}", user_config.display())).required(false));
    }

    for (var, value) in vars {
        let Some(tail) = var.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // a value with no section is not a configuration
            // value, and can be skipped (eg: ARCFS_LOG)
            continue;
        };

        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        config_builder = config_builder.set_override(key, value)?;
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}
