//! ceod - privileged account-administration daemon.
//!
//! Listens on a fixed port, authenticates each connection and runs the
//! requested local operation on the caller's behalf.
//!
//! # Fork Safety
//!
//! The master forks once per connection and, with `--detach`, twice more at
//! startup. `fork()` in a multi-threaded process is undefined behavior, so
//! the master never creates a Tokio runtime: `main` is synchronous and each
//! worker builds its own single-threaded runtime after the fork.
//!
//! Detaching happens only after the configuration is validated and the
//! listener is bound, so every startup error still reaches the terminal.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ceod::config::{CONFIG_DIR_ENV, DEFAULT_CONFIG_DIR, DEFAULT_LIB_DIR, LIB_DIR_ENV, Paths};
use ceod::server::{ServerContext, run_master};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Privileged account-administration daemon
#[derive(Parser, Debug)]
#[command(name = "ceod", version, about, long_about = None)]
struct Args {
    /// Detach from the terminal and run in the background
    #[arg(long)]
    detach: bool,

    /// Configuration directory
    #[arg(long, env = CONFIG_DIR_ENV, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Directory holding the op-<name> executables
    #[arg(long, env = LIB_DIR_ENV, default_value = DEFAULT_LIB_DIR)]
    lib_dir: PathBuf,

    /// Log level filter (e.g. "info", "ceod=debug")
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Perform daemonization via double-fork pattern.
///
/// The process must still be single-threaded. The bound listener survives
/// both forks; stdin, stdout and stderr are pointed at `/dev/null`.
#[allow(unsafe_code)]
fn daemonize() -> Result<()> {
    use nix::unistd::{ForkResult, fork, setsid};

    // SAFETY: no threads or runtime exist yet.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    // Become session leader, lose the controlling terminal.
    setsid().context("setsid")?;

    // SAFETY: still single-threaded.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    std::env::set_current_dir("/").context("chdir('/')")?;
    redirect_stdio()
}

fn redirect_stdio() -> Result<()> {
    use std::os::fd::AsRawFd;

    use nix::unistd::dup2;

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup2(null.as_raw_fd(), target).context("dup2")?;
    }
    Ok(())
}

fn init_logging(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Relative directories must survive the chdir in daemonize().
    let paths = Paths::new(
        std::path::absolute(&args.config_dir).context("invalid --config-dir")?,
        std::path::absolute(&args.lib_dir).context("invalid --lib-dir")?,
    );
    let log_file = args
        .log_file
        .as_deref()
        .map(std::path::absolute)
        .transpose()
        .context("invalid --log-file")?;

    init_logging(&args.log_level, log_file.as_deref())?;

    let ctx = ServerContext::load(paths).context("startup failed")?;
    info!(
        fqdn = %ctx.fqdn(),
        service = %ctx.service_principal(),
        ops = ctx.registry().len(),
        "configuration loaded"
    );

    let listener = ctx.bind()?;

    if args.detach {
        if log_file.is_none() {
            warn!("detaching without --log-file; further logs are discarded");
        }
        daemonize().context("detach failed")?;
    }

    run_master(&ctx, listener)?;
    Ok(())
}
