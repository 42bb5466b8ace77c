use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use common::{DefaultFileSystem, MemoryFileSystem, RawFileSystem};
use rawfs_daemon::fuse::{DeviceChannel, SessionSummary};
use rawfs_daemon::{Config, Dispatcher, DispatcherConfig, Session};

/// Serve a filesystem over an already-mounted FUSE device
#[derive(Debug, Parser)]
#[command(name = "rawfs", version, about)]
struct Args {
    /// Open FUSE device descriptor inherited from the mounting process
    #[arg(long, env = "RAWFS_FD")]
    fd: RawFd,

    /// Config file (defaults to <config dir>/rawfs/config.toml if present)
    #[arg(long, env = "RAWFS_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to serve read-only from memory; without it every
    /// operation reports "not implemented"
    #[arg(long)]
    source: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(args.config.as_deref())?;
    let _log_guard = init_logging(config.log_dir.as_deref())?;

    // SAFETY: getuid and getgid cannot fail and touch no memory
    config
        .dispatcher
        .uid
        .get_or_insert_with(|| unsafe { libc::getuid() });
    config
        .dispatcher
        .gid
        .get_or_insert_with(|| unsafe { libc::getgid() });

    let channel = DeviceChannel::new(take_fd(args.fd)?, config.dispatcher.max_write);

    let summary = match args.source {
        Some(source) => {
            let fs = MemoryFileSystem::from_directory(&source)
                .with_context(|| format!("failed to load {}", source.display()))?;
            tracing::info!(
                source = %source.display(),
                nodes = fs.node_count(),
                "serving directory snapshot"
            );
            serve(fs, config.dispatcher, channel).await?
        }
        None => {
            tracing::info!("no source given, serving an empty capability set");
            serve(DefaultFileSystem, config.dispatcher, channel).await?
        }
    };

    tracing::info!(
        requests = summary.requests,
        destroyed = summary.destroyed,
        "exiting"
    );
    Ok(())
}

async fn serve<F: RawFileSystem>(
    fs: F,
    config: DispatcherConfig,
    channel: DeviceChannel,
) -> anyhow::Result<SessionSummary> {
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(fs), config));
    let summary = Session::new(dispatcher, channel).run().await?;
    Ok(summary)
}

/// Take ownership of the inherited device descriptor.
fn take_fd(fd: RawFd) -> anyhow::Result<OwnedFd> {
    if fd < 0 {
        bail!("invalid device descriptor {fd}");
    }
    // SAFETY: F_GETFD only inspects the descriptor table
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("descriptor {fd} is not open"));
    }
    // SAFETY: the descriptor is open and was handed to this process for its
    // exclusive use; nothing else in the process refers to it
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Log to stderr, and to a daily rolling file when `log_dir` is set.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(
    log_dir: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "rawfs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}
