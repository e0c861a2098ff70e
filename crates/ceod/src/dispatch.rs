//! Operation dispatch.
//!
//! Resolves a received message type to a locally owned operation and runs
//! its executable as a subprocess. The subprocess sees exactly three
//! environment variables:
//!
//! | Variable         | Value                                   |
//! |------------------|-----------------------------------------|
//! | `LANG`           | `C`                                     |
//! | `CEO_USER`       | authenticated caller's short user name  |
//! | `CEO_CONFIG_DIR` | daemon configuration directory          |
//!
//! The decrypted request goes to the child's stdin and its entire stdout
//! becomes the response. Stderr is inherited so operation diagnostics land
//! in the daemon's log stream. A response may be at most
//! [`MAX_PLAINTEXT_SIZE`] bytes so that it still fits one message once
//! wrapped.
//!
//! # Failure Semantics
//!
//! A non-zero exit status or an empty response fails the whole connection.
//! Operations must report business-level failures inside their response
//! payload. An operation that partially applied its effects before failing
//! is indistinguishable from one that did nothing.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::registry::{Operation, Registry};
use crate::security::MAX_PLAINTEXT_SIZE;

/// Dispatch failures. All are fatal to the connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No local operation has this type.
    #[error("operation {msg_type:x} does not exist")]
    UnknownOperation {
        /// Received type tag.
        msg_type: u32,
    },

    /// The executable could not be started.
    #[error("cannot run {}: {source}", path.display())]
    Spawn {
        /// Operation name.
        op: String,
        /// Executable path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Pipe I/O with the subprocess failed.
    #[error("I/O error talking to op {op}: {source}")]
    Io {
        /// Operation name.
        op: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The subprocess exited unsuccessfully.
    #[error("child {op} failed: {status}")]
    Failed {
        /// Operation name.
        op: String,
        /// Exit status.
        status: ExitStatus,
    },

    /// The subprocess produced no output.
    #[error("no response from op {op}")]
    EmptyResponse {
        /// Operation name.
        op: String,
    },

    /// The subprocess produced more output than one message can carry.
    #[error("response from op {op} exceeds {max} bytes", max = MAX_PLAINTEXT_SIZE)]
    ResponseTooLarge {
        /// Operation name.
        op: String,
        /// Bytes read before giving up.
        size: usize,
    },
}

/// Result type for dispatch.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// The environment an operation subprocess runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEnv<'a> {
    /// Authenticated caller's short user name.
    pub user: &'a str,
    /// Daemon configuration directory.
    pub config_dir: &'a Path,
}

impl<'a> OperationEnv<'a> {
    /// Environment variables in the order they are set.
    #[must_use]
    pub fn vars(&self) -> [(&'static str, &'a std::ffi::OsStr); 3] {
        [
            ("LANG", std::ffi::OsStr::new("C")),
            ("CEO_USER", std::ffi::OsStr::new(self.user)),
            ("CEO_CONFIG_DIR", self.config_dir.as_os_str()),
        ]
    }
}

/// Maps received message types to local operations and runs them.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'a> {
    registry: &'a Registry,
    config_dir: &'a Path,
}

impl<'a> Dispatcher<'a> {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub const fn new(registry: &'a Registry, config_dir: &'a Path) -> Self {
        Self {
            registry,
            config_dir,
        }
    }

    /// Find the local operation for `msg_type`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownOperation`] if no local operation has
    /// this type.
    pub fn resolve(&self, msg_type: u32) -> DispatchResult<&'a Operation> {
        self.registry
            .get_local_by_type(msg_type)
            .ok_or(DispatchError::UnknownOperation { msg_type })
    }

    /// Run `op` on behalf of `user` with `request` on its stdin.
    ///
    /// # Errors
    ///
    /// See [`run_operation`].
    pub async fn run(&self, op: &Operation, user: &str, request: &[u8]) -> DispatchResult<Vec<u8>> {
        let env = OperationEnv {
            user,
            config_dir: self.config_dir,
        };
        run_operation(op, &env, request).await
    }

    /// Resolve `msg_type` and run the operation.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown or the operation fails.
    pub async fn dispatch(&self, msg_type: u32, user: &str, request: &[u8]) -> DispatchResult<Vec<u8>> {
        let op = self.resolve(msg_type)?;
        self.run(op, user, request).await
    }
}

/// Run a local operation's executable and collect its response.
///
/// # Errors
///
/// Returns a [`DispatchError`] if the executable cannot be spawned, pipe
/// I/O fails, it exits non-zero, or its output is empty or too large.
pub async fn run_operation(
    op: &Operation,
    env: &OperationEnv<'_>,
    request: &[u8],
) -> DispatchResult<Vec<u8>> {
    let Some(path) = op.path.as_deref() else {
        return Err(DispatchError::UnknownOperation {
            msg_type: op.msg_type,
        });
    };
    info!(op = %op.name, user = %env.user, "running op: {}", op.name);

    let mut cmd = Command::new(path);
    cmd.env_clear()
        .envs(env.vars())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(identity) = &op.run_as {
        debug!(op = %op.name, user = %identity.user, "dropping to run-as identity");
        cmd.gid(identity.gid).uid(identity.uid);
    }

    let mut child = cmd.spawn().map_err(|source| DispatchError::Spawn {
        op: op.name.clone(),
        path: path.to_path_buf(),
        source,
    })?;
    let io_error = |source| DispatchError::Io {
        op: op.name.clone(),
        source,
    };

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io_error(io::Error::other("stdin not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_error(io::Error::other("stdout not captured")))?;

    let write = async move {
        let result = stdin.write_all(request).await;
        drop(stdin);
        result
    };
    let read = async move {
        let mut response = Vec::new();
        let limit = u64::try_from(MAX_PLAINTEXT_SIZE + 1).unwrap_or(u64::MAX);
        stdout.take(limit).read_to_end(&mut response).await?;
        Ok::<_, io::Error>(response)
    };
    let (written, response) = tokio::join!(write, read);

    match written {
        Ok(()) => {},
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            warn!(op = %op.name, "op exited without reading its whole request");
        },
        Err(e) => return Err(io_error(e)),
    }
    let response = response.map_err(io_error)?;

    if response.len() > MAX_PLAINTEXT_SIZE {
        // kill_on_drop reaps it if this fails.
        if let Err(e) = child.start_kill() {
            warn!(op = %op.name, error = %e, "cannot kill oversized op");
        }
        return Err(DispatchError::ResponseTooLarge {
            op: op.name.clone(),
            size: response.len(),
        });
    }

    let status = child.wait().await.map_err(io_error)?;
    if !status.success() {
        info!(op = %op.name, %status, "child {} exited with {}", path.display(), status);
        return Err(DispatchError::Failed {
            op: op.name.clone(),
            status,
        });
    }
    if response.is_empty() {
        return Err(DispatchError::EmptyResponse {
            op: op.name.clone(),
        });
    }

    debug!(op = %op.name, len = response.len(), "op completed");
    Ok(response)
}
