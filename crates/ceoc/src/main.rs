//! ceoc - invoke a ceod operation.
//!
//! Reads the request payload from stdin, sends it to the daemon that owns
//! the named operation and writes the response payload to stdout.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use ceod::client::Client;
use ceod::config::{CONFIG_DIR_ENV, DEFAULT_CONFIG_DIR, DEFAULT_LIB_DIR, LIB_DIR_ENV, Paths};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Invoke a ceod operation
#[derive(Parser, Debug)]
#[command(name = "ceoc", version, about, long_about = None)]
struct Cli {
    /// Operation name
    op: String,

    /// Configuration directory
    #[arg(long, env = CONFIG_DIR_ENV, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Directory holding the op-<name> executables
    #[arg(long, env = LIB_DIR_ENV, default_value = DEFAULT_LIB_DIR)]
    lib_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let paths = Paths::new(cli.config_dir, cli.lib_dir);
    let client = Client::load(&paths).context("failed to load configuration")?;
    client.operation(&cli.op)?;

    let mut request = Vec::new();
    std::io::stdin()
        .read_to_end(&mut request)
        .context("failed to read request from stdin")?;
    if request.is_empty() {
        bail!("no data to send");
    }
    debug!(op = %cli.op, len = request.len(), "sending request");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let response = runtime
        .block_on(client.call(&cli.op, &request))
        .with_context(|| format!("operation {} failed", cli.op))?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response).context("failed to write response")?;
    stdout.flush().context("failed to write response")?;
    Ok(())
}
