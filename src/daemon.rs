//! Mount lifecycle: bring the filesystem up, wait for a signal, tear it
//! down hard.

use std::process::Command;
use std::sync::Arc;

use tokio::select;
use tracing::{debug, error, info, warn};

use hdfsfs::clock::{Clock, WallClock};
use hdfsfs::filter::PathFilter;
use hdfsfs::retry::RetryPolicy;

use crate::config::Config;
use crate::fs::FileSystem;
use crate::fs::fuser::FuseDispatcher;
use crate::hdfs::{FaultTolerantHdfsAccessor, HdfsAccessor, WebHdfsAccessor};

/// Build the accessor stack and mount. Blocks until SIGINT/SIGTERM.
pub fn run(config: &Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let clock: Arc<dyn Clock> = Arc::new(WallClock);
    let policy = Arc::new(RetryPolicy::new(
        Arc::clone(&clock),
        config.total_attempts(),
        config.retry_time_limit,
        config.retry_min_delay,
        config.retry_max_delay,
    ));

    let base: Arc<dyn HdfsAccessor> = Arc::new(WebHdfsAccessor::new(
        &config.name_nodes,
        &local_user(),
        Arc::clone(&clock),
    ));
    let accessor: Arc<dyn HdfsAccessor> = Arc::new(FaultTolerantHdfsAccessor::new(
        base,
        Arc::clone(&policy),
    ));

    if !config.lazy {
        accessor.ensure_connected().map_err(|e| {
            std::io::Error::other(format!(
                "can't establish connection to HDFS, mounting will NOT be performed \
                 (suppress with -lazy): {e}"
            ))
        })?;
    }

    let fs = FileSystem::new(
        accessor,
        PathFilter::new(&config.allowed_prefixes),
        config.expand_zips,
        config.read_only,
        Arc::clone(&policy),
        clock,
        config.staging_dir.clone(),
    );

    let mut options = vec![
        fuser::MountOption::FSName("hdfs".to_owned()),
        fuser::MountOption::Subtype("hdfs".to_owned()),
        fuser::MountOption::AllowOther,
    ];
    if config.read_only {
        options.push(fuser::MountOption::RO);
    } else {
        options.push(fuser::MountOption::RW);
    }

    let dispatcher = FuseDispatcher::new(Arc::clone(&fs), runtime.handle().clone());
    let session = fuser::spawn_mount2(dispatcher, &config.mount_point, &options)?;
    info!(mount_point = %config.mount_point.display(), "mounted successfully");

    raise_fd_limit();

    runtime.block_on(wait_for_exit())?;

    // Stop in-flight retries from stretching the teardown.
    policy.disable();
    unmount(config, &fs);
    drop(session);
    Ok(())
}

/// The username backend requests are issued as.
fn local_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::effective())
        .ok()
        .flatten()
        .map_or_else(|| "root".to_owned(), |u| u.name)
}

/// FUSE keeps one backend stream per open file; the default 1K fd cap
/// is far too small for a busy mount.
fn raise_fd_limit() {
    const WANT: u64 = 1024 * 1024;
    if let Err(e) =
        nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE, WANT, WANT)
    {
        warn!(error = %e, "failed to raise the file descriptor limit to 1Mi");
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("received SIGINT, shutting down");
        },
        _ = sigterm.recv() => {
            debug!("received SIGTERM, shutting down");
        },
    }
    Ok(())
}

/// Invoke the OS unmount helper, then close everything registered for
/// close-on-unmount.
fn unmount(config: &Config, fs: &FileSystem) {
    info!("unmounting");
    let status = Command::new("fusermount")
        .arg("-zu")
        .arg(&config.mount_point)
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => error!(%status, "fusermount exited unsuccessfully"),
        Err(e) => error!(error = %e, "failed to run fusermount"),
    }
    fs.close_registered();
}
