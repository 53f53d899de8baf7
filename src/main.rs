//! Mount an HDFS cluster as a local filesystem, without copying a byte.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::error;

mod config;
mod daemon;
mod fs;
mod hdfs;
mod trc;

use crate::config::Config;

#[derive(Parser)]
#[command(
    version,
    about = "Mount an HDFS cluster as a local filesystem.",
    arg_required_else_help = true
)]
struct Args {
    /// Comma-separated name node addresses, host:port.
    #[arg(value_name = "NAMENODE:PORT")]
    name_nodes: String,

    /// Directory to mount the filesystem on.
    #[arg(value_name = "MOUNTPOINT")]
    mount_point: PathBuf,

    /// Allow mounting before HDFS is reachable.
    #[arg(long)]
    lazy: bool,

    /// Time limit for all retry attempts of a failed operation.
    #[arg(long = "retryTimeLimit", default_value = "5m", value_parser = humantime::parse_duration)]
    retry_time_limit: Duration,

    /// Maximum retries for failed operations (the first retry is always
    /// immediate).
    #[arg(long = "retryMaxAttempts", default_value_t = 99_999_999)]
    retry_max_attempts: u32,

    /// Minimum delay between retries.
    #[arg(long = "retryMinDelay", default_value = "1s", value_parser = humantime::parse_duration)]
    retry_min_delay: Duration,

    /// Maximum delay between retries.
    #[arg(long = "retryMaxDelay", default_value = "60s", value_parser = humantime::parse_duration)]
    retry_max_delay: Duration,

    /// Comma-separated list of allowed path prefixes; only those
    /// prefixes are exposed through the mount point.
    #[arg(long = "allowedPrefixes", default_value = "*")]
    allowed_prefixes: String,

    /// Expand ZIP archives into virtual directories.
    #[arg(long = "expandZips")]
    expand_zips: bool,

    /// Mount read-only.
    #[arg(long = "readOnly")]
    read_only: bool,

    /// 0: errors only; 1: plus warnings; 2: plus info.
    #[arg(long = "logLevel", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    log_level: u8,

    /// Directory for local write-staging files.
    #[arg(long = "stagingDir", default_value = "/var/hdfs-fs")]
    staging_dir: PathBuf,
}

fn main() {
    let args = Args::parse();
    trc::init(args.log_level);

    let config = Config {
        name_nodes: args.name_nodes,
        mount_point: args.mount_point,
        lazy: args.lazy,
        retry_time_limit: args.retry_time_limit,
        retry_max_attempts: args.retry_max_attempts,
        retry_min_delay: args.retry_min_delay,
        retry_max_delay: args.retry_max_delay,
        allowed_prefixes: args.allowed_prefixes,
        expand_zips: args.expand_zips,
        read_only: args.read_only,
        log_level: args.log_level,
        staging_dir: args.staging_dir,
    };

    if let Err(e) = daemon::run(&config) {
        error!("{e}");
        std::process::exit(1);
    }
}
