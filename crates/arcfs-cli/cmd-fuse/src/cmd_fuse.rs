// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use arcfs::Transport;
use arcfs_cli_common as cli;
use arcfs_vfs::{Activity, Dispatcher, FilesystemHandle, IdleSupervisor, Session};
use clap::Parser;
use fuser::MountOption;
use nix::sys::signal::{SigHandler, Signal};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};

#[cfg(test)]
#[path = "./cmd_fuse_test.rs"]
mod cmd_fuse_test;

/// How long an interrupted session gets to stop before it is forced off
/// its mountpoint, and again before it is abandoned altogether
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let mut opt = CmdFuse::parse();
    // once daemonized, stderr goes nowhere
    opt.logging.syslog |= !opt.foreground && !opt.log_foreground;
    opt.logging.configure();

    let config = match arcfs::load_config() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };
    let result = opt.run(&config);

    cli::handle_result!(result)
}

/// Mount an archive image as a read-only filesystem
#[derive(Debug, Parser)]
#[clap(name = "arcfs-fuse", version = arcfs::VERSION)]
pub struct CmdFuse {
    #[clap(flatten)]
    logging: cli::Logging,

    /// Do not daemonize the filesystem, run it in the foreground instead
    #[clap(long, short)]
    foreground: bool,

    /// Do not disconnect the filesystem logs from stderr
    ///
    /// Although the filesystem will still daemonize, the logs will
    /// still appear in the stderr of the calling process/shell
    #[clap(long, env = "ARCFS_FUSE_LOG_FOREGROUND")]
    log_foreground: bool,

    /// Accepted for compatibility, requests are always served one at a time
    #[clap(short = 's', long)]
    single_threaded: bool,

    /// Byte offset of the archive within the image file
    #[clap(long)]
    offset: Option<u64>,

    /// Unmount after this many idle seconds, zero to disable
    #[clap(long)]
    idle_timeout: Option<u64>,

    /// How to attach the filesystem to the mountpoint (session, channel)
    #[clap(long)]
    transport: Option<Transport>,

    /// Options for the mount in the form opt1,opt2=value
    ///
    /// In addition to all existing fuse mount options, the following custom
    /// options are also supported:
    ///
    ///  offset  - byte offset of the archive within the image file
    ///  timeout - unmount after this many idle seconds, zero to disable
    #[clap(long, short, value_delimiter = ',')]
    options: Vec<String>,

    /// The archive image to mount
    #[clap(name = "IMAGE")]
    image: PathBuf,

    /// The location where to mount the archive
    #[clap(name = "MOUNTPOINT")]
    mountpoint: PathBuf,
}

/// Everything needed to mount, after combining config and arguments
#[derive(Debug, PartialEq)]
struct MountSettings {
    offset: u64,
    idle_timeout: u64,
    transport: Transport,
    options: Vec<MountOption>,
}

impl CmdFuse {
    pub fn run(&mut self, config: &arcfs::Config) -> Result<i32> {
        let settings = self.settings(config)?;
        tracing::debug!("FUSE Config: {settings:#?}");
        if !self.single_threaded {
            tracing::debug!("requests will be served on a single thread");
        }

        reserve_standard_fds();
        let fs = FilesystemHandle::open(&self.image, settings.offset)
            .context("Failed to open archive image")?;

        let mountpoint = self
            .mountpoint
            .canonicalize()
            .context("Invalid mount point")?;

        let activity = Arc::new(Activity::new());
        let session = Session::new(Dispatcher::new(fs, Arc::clone(&activity)));
        let mut strategy = arcfs_vfs::strategy(settings.transport);
        strategy
            .mount(&mountpoint, &settings.options, session)
            .context("Failed to create a FUSE session")?;

        if !self.foreground {
            tracing::debug!("Moving into background...");
            // We cannot daemonize until the mount is established above,
            // otherwise initial use of the filesystem may not show any mount
            // at all.
            if let Err(err) = nix::unistd::daemon(false, self.log_foreground) {
                strategy.unmount()?;
                return Err(err).context("Failed to move into the background");
            }
        }

        // The runtime must not be started until after daemonizing,
        // since its threads would not survive the fork.
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to establish runtime")?;

        let idle_timeout = settings.idle_timeout;
        let result = rt.block_on(async move {
            let mut interrupt = signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate = signal(SignalKind::terminate()).context("terminate signal handler")?;

            let mut supervisor = IdleSupervisor::new(activity);
            supervisor.arm(idle_timeout);

            let mut interrupter = strategy.interrupter()?;
            tracing::info!("Starting FUSE filesystem");
            let mut serving = tokio::task::spawn_blocking(move || {
                let result = strategy.run();
                (strategy, result)
            });
            let finished = tokio::select! {
                res = &mut serving => Some(res),
                // we explicitly catch any signal related to interruption
                // and will act by shutting down the filesystem early
                _ = terminate.recv() => {
                    tracing::info!("Terminate signal received, filesystem shutting down");
                    None
                }
                _ = interrupt.recv() => {
                    tracing::info!("Interrupt signal received, filesystem shutting down");
                    None
                }
                _ = quit.recv() => {
                    tracing::info!("Quit signal received, filesystem shutting down");
                    None
                }
            };
            let joined = match finished {
                Some(res) => Some(res),
                None => {
                    if let Err(err) = interrupter.interrupt() {
                        tracing::warn!(?err, "Failed to interrupt the FUSE session");
                    }
                    let signalled = any_signal(&mut interrupt, &mut quit, &mut terminate);
                    match stop_within(&mut serving, SHUTDOWN_GRACE, signalled).await {
                        Some(res) => Some(res),
                        None => {
                            if let Err(err) = interrupter.force() {
                                tracing::error!(?err, "Failed to detach the filesystem");
                            }
                            stop_within(&mut serving, SHUTDOWN_GRACE, std::future::pending())
                                .await
                        }
                    }
                }
            };
            supervisor.teardown();
            match joined {
                Some(res) => res.map_err(|err| anyhow!("FUSE session failed: {err}")),
                // the blocking thread is left behind, and goes away with the process
                None => bail!("FUSE session did not stop and was abandoned"),
            }
        });

        restore_default_signals();
        // we generally expect at this point that the command is complete
        // and nothing else should be executing, but it's possible that
        // we've launched long running tasks that are waiting for signals or
        // events which will never come and so we don't want to block forever
        // when the runtime is dropped.
        rt.shutdown_timeout(std::time::Duration::from_secs(2));

        let (mut strategy, served) = result?;
        tracing::info!("Filesystem shutting down");
        strategy.unmount().context("Failed to unmount filesystem")?;
        served.context("FUSE session failed")?;
        Ok(0)
    }

    /// Combine the configuration with the command line, which takes precedence
    fn settings(&self, config: &arcfs::Config) -> Result<MountSettings> {
        let mut settings = MountSettings {
            offset: 0,
            idle_timeout: config.fuse.idle_timeout_secs,
            transport: config.fuse.transport,
            // these will cause conflicts later on if their counterpart is also provided
            options: vec![
                MountOption::RO,
                MountOption::NoDev,
                MountOption::NoSuid,
                MountOption::FSName(self.image.display().to_string()),
                MountOption::Subtype("arcfs".into()),
            ],
        };

        let args = config
            .fuse
            .mount_options()
            .map(String::from)
            .chain(self.options.iter().cloned())
            .collect::<Vec<_>>();
        for option in parse_options_from_args(&args) {
            match option {
                MountOption::RW => bail!("rw mode is not supported, the filesystem is read-only"),
                MountOption::CUSTOM(opt) => match opt.split_once('=') {
                    Some(("offset", num)) => settings.offset = parse_number("offset", num)?,
                    Some(("timeout", num)) => settings.idle_timeout = parse_number("timeout", num)?,
                    _ => settings.insert(MountOption::CUSTOM(opt)),
                },
                option => settings.insert(option),
            }
        }

        if let Some(offset) = self.offset {
            settings.offset = offset;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            settings.idle_timeout = idle_timeout;
        }
        if let Some(transport) = self.transport {
            settings.transport = transport;
        }
        Ok(settings)
    }
}

impl MountSettings {
    fn insert(&mut self, option: MountOption) {
        // a later name replaces the default one
        match &option {
            MountOption::FSName(_) => self
                .options
                .retain(|o| !matches!(o, MountOption::FSName(_))),
            MountOption::Subtype(_) => self
                .options
                .retain(|o| !matches!(o, MountOption::Subtype(_))),
            _ => {}
        }
        if !self.options.contains(&option) {
            self.options.push(option);
        }
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|err| anyhow!("Invalid parameter value for {name}={value}: {err}"))
}

/// Daemonizing unconditionally replaces descriptors 0-2, which must
/// not be allowed to happen to the image once it has been opened.
fn reserve_standard_fds() {
    loop {
        match std::fs::File::open("/dev/null") {
            Ok(null) if null.as_raw_fd() <= 2 => {
                // left open for the lifetime of the process
                let _ = null.into_raw_fd();
            }
            Ok(_) => break,
            Err(err) => {
                // nothing else will be able to open it either
                tracing::debug!(?err, "failed to open /dev/null");
                break;
            }
        }
    }
}

/// Wait for the session to stop, giving up after `grace` or as
/// soon as `signalled` completes
async fn stop_within<F, S>(serving: &mut F, grace: Duration, signalled: S) -> Option<F::Output>
where
    F: Future + Unpin,
    S: Future<Output = ()>,
{
    tokio::select! {
        res = serving => Some(res),
        _ = tokio::time::sleep(grace) => {
            tracing::warn!("FUSE session did not stop within {grace:?}");
            None
        }
        _ = signalled => {
            tracing::warn!("Signal received again while shutting down");
            None
        }
    }
}

/// Completes when any of the shutdown signals arrives
async fn any_signal(
    interrupt: &mut SignalStream,
    quit: &mut SignalStream,
    terminate: &mut SignalStream,
) {
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = quit.recv() => {}
        _ = terminate.recv() => {}
    }
}

fn restore_default_signals() {
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        // Safety: the default disposition runs no code in this process
        if let Err(err) = unsafe { nix::sys::signal::signal(sig, SigHandler::SigDfl) } {
            tracing::warn!(?err, "failed to restore default handler for {sig}");
        }
    }
}

/// Copies from the private [`fuser::MountOption::from_str`]
fn parse_options_from_args(args: &[String]) -> Vec<MountOption> {
    args.iter()
        .map(|s| match s.as_str() {
            "auto_unmount" => MountOption::AutoUnmount,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "default_permissions" => MountOption::DefaultPermissions,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            "atime" => MountOption::Atime,
            "noatime" => MountOption::NoAtime,
            "dirsync" => MountOption::DirSync,
            "sync" => MountOption::Sync,
            "async" => MountOption::Async,
            x if x.starts_with("fsname=") => MountOption::FSName(x[7..].into()),
            x if x.starts_with("subtype=") => MountOption::Subtype(x[8..].into()),
            x => MountOption::CUSTOM(x.into()),
        })
        .collect()
}
