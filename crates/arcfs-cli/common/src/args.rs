// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

/// The environment variable holding the default log filter
pub const ARCFS_LOG: &str = "ARCFS_LOG";

/// Command line flags for configuring logging
#[derive(Debug, Clone, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Send logs to syslog instead of stderr
    #[clap(long, global = true, env = "ARCFS_SYSLOG")]
    pub syslog: bool,
}

impl Logging {
    pub fn configure(&self) {
        configure_logging(self.verbose as usize, self.syslog)
    }
}

/// Build the filter for a verbosity level.
///
/// Without any verbosity the `ARCFS_LOG` value is used when it is set.
/// Anything in `RUST_LOG` is appended so that it can refine the result.
pub fn filter_directives(
    verbosity: usize,
    arcfs_log: Option<String>,
    rust_log: Option<String>,
) -> String {
    let mut config = match verbosity {
        0 => arcfs_log.unwrap_or_else(|| "arcfs=info,warn".to_string()),
        1 => "arcfs=debug,info".to_string(),
        2 => "arcfs=trace,info".to_string(),
        3 => "arcfs=trace,debug".to_string(),
        _ => "trace".to_string(),
    };
    if let Some(overrides) = rust_log.filter(|o| !o.is_empty()) {
        config.push(',');
        config.push_str(&overrides);
    }
    config
}

pub fn configure_logging(verbosity: usize, syslog: bool) {
    let config = filter_directives(
        verbosity,
        std::env::var(ARCFS_LOG).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let env_filter = tracing_subscriber::filter::EnvFilter::new(config);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(verbosity > 2);

    let result = if syslog {
        let identity = c"arcfs";
        let (options, facility) = Default::default();
        match syslog_tracing::Syslog::new(identity, options, facility) {
            Some(writer) => {
                let sub = tracing_subscriber::registry()
                    .with(fmt_layer.with_ansi(false).with_writer(writer).with_filter(env_filter));
                tracing::subscriber::set_global_default(sub)
            }
            None => {
                // another logger already owns syslog for this process
                let sub = tracing_subscriber::registry()
                    .with(fmt_layer.with_writer(std::io::stderr).with_filter(env_filter));
                tracing::subscriber::set_global_default(sub)
            }
        }
    } else {
        let sub = tracing_subscriber::registry()
            .with(fmt_layer.with_writer(std::io::stderr).with_filter(env_filter));
        tracing::subscriber::set_global_default(sub)
    };
    if let Err(err) = result {
        eprintln!("logging was already configured: {err}");
    }
}

/// Turn the result of a command into a process exit code,
/// logging any error that caused it to fail.
#[macro_export]
macro_rules! handle_result {
    ($result:ident) => {{
        match $result {
            Err(err) => match err
                .chain()
                .find_map(|cause| cause.downcast_ref::<$crate::__private::arcfs::Error>())
            {
                Some($crate::__private::arcfs::Error::ImageOpen(path, io_err)) => {
                    tracing::error!("Cannot open {}: {io_err}", path.display());
                    1
                }
                _ => {
                    tracing::error!("{err:?}");
                    1
                }
            },
            Ok(code) => code,
        }
    }};
}
