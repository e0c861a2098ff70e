//! Connection acceptor (master) and connection workers.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────── master ─┐
//!  ServerContext ─┤ bind ─▶ signals ─▶ accept ─▶ fork   │
//!                 └───────────────────────────────┬─────┘
//!                                                 │ one process per connection
//!                                                 ▼
//!                                     worker: runtime ─▶ serve_connection
//! ```
//!
//! The master is single-threaded and never starts an async runtime, so
//! `fork` always happens in a single-threaded process. Each worker builds
//! its own `current_thread` runtime after the fork.
//!
//! [`ServerContext`] is built once at startup and inherited read-only by
//! every worker.
//!
//! # Security Considerations
//!
//! - Configuration, key table and registry are validated before the socket
//!   is bound, so a misconfigured daemon never accepts a connection
//! - Accepted sockets are close-on-exec; operation subprocesses cannot reach
//!   the client connection

pub mod listener;
pub mod signals;
pub mod worker;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use listener::Listener;
pub use worker::serve_connection;

use crate::config::{CeoConfig, ConfigError, Paths};
use crate::dispatch::Dispatcher;
use crate::protocol::TransportKind;
use crate::registry::{LoadMode, Registry, RegistryError};
use crate::resolve::{FixedFqdn, HostResolver, SystemResolver};
use crate::security::psk::service_principal;
use crate::security::{Keytab, KeytabError, PskAcceptor, Role, SecurityContext};

/// Startup and master failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration file error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Acceptor key table error.
    #[error("cannot load key table {}: {source}", path.display())]
    Keytab {
        /// Key table path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: KeytabError,
    },

    /// This machine's canonical name could not be determined.
    #[error("cannot determine local host name: {0}")]
    LocalHost(#[source] io::Error),

    /// The listening socket could not be set up.
    #[error("cannot listen on port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Signal setup, `accept` or `fork` failed.
    #[error("{what}: {source}")]
    Io {
        /// Failed call.
        what: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Everything a worker needs, built once at startup.
#[derive(Debug)]
pub struct ServerContext {
    paths: Paths,
    transport: TransportKind,
    port: u16,
    fqdn: String,
    service_principal: String,
    keytab: Arc<Keytab>,
    registry: Registry,
}

impl ServerContext {
    /// Load configuration, key table and registry using system resolution.
    ///
    /// # Errors
    ///
    /// Returns the first startup error.
    pub fn load(paths: Paths) -> Result<Self, ServerError> {
        let config = CeoConfig::load(&paths)?;
        match config.daemon.hostname.clone() {
            Some(fqdn) => Self::with_resolver(paths, &config, &FixedFqdn::new(SystemResolver, fqdn)),
            None => Self::with_resolver(paths, &config, &SystemResolver),
        }
    }

    /// Build a context from an already parsed configuration.
    ///
    /// # Errors
    ///
    /// Returns the first startup error.
    pub fn with_resolver(
        paths: Paths,
        config: &CeoConfig,
        resolver: &dyn HostResolver,
    ) -> Result<Self, ServerError> {
        let fqdn = resolver.local_fqdn().map_err(ServerError::LocalHost)?;
        debug!(fqdn = %fqdn, "local host name");

        let keytab_path = config.daemon.keytab_path(&paths);
        let keytab = Keytab::from_file(&keytab_path).map_err(|source| ServerError::Keytab {
            path: keytab_path.clone(),
            source,
        })?;
        debug!(path = %keytab_path.display(), entries = keytab.len(), "loaded key table");

        let registry = Registry::load(&paths, resolver, &config.run_as, LoadMode::Daemon)?;
        info!(ops = registry.len(), "loaded operation registry");

        Ok(Self {
            service_principal: service_principal(&config.daemon.service, &fqdn),
            paths,
            transport: config.daemon.transport,
            port: config.daemon.port,
            fqdn,
            keytab: Arc::new(keytab),
            registry,
        })
    }

    /// Configured transport binding.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Listening port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// This machine's canonical name.
    #[must_use]
    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// Service principal clients must target.
    #[must_use]
    pub fn service_principal(&self) -> &str {
        &self.service_principal
    }

    /// The operation registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A dispatcher over this context's registry.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.registry, &self.paths.config_dir)
    }

    /// A fresh acceptor-role security context for one connection.
    #[must_use]
    pub fn new_acceptor(&self) -> SecurityContext {
        SecurityContext::new(
            Role::Acceptor,
            Box::new(PskAcceptor::new(
                Arc::clone(&self.keytab),
                self.service_principal.clone(),
            )),
        )
    }

    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`].
    pub fn bind(&self) -> Result<Listener, ServerError> {
        Listener::bind(self.transport, self.port).map_err(|source| ServerError::Bind {
            port: self.port,
            source,
        })
    }
}

/// Run the accept loop until interrupted or terminated.
///
/// Consumes the listener so forked workers can close their copy.
///
/// # Errors
///
/// Returns an error if signal setup, `accept` or `fork` fails.
#[allow(unsafe_code)]
pub fn run_master(ctx: &ServerContext, listener: Listener) -> Result<(), ServerError> {
    use nix::unistd::{ForkResult, fork};

    signals::install_master().map_err(|source| ServerError::Io {
        what: "sigaction",
        source,
    })?;
    info!(
        pid = std::process::id(),
        port = ctx.port,
        transport = %ctx.transport,
        "now accepting connections"
    );

    loop {
        if let Some(signal) = signals::termination_signal() {
            info!("shutting down ({})", signals::shutdown_reason(signal));
            return Ok(());
        }

        let (fd, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected
            ) =>
            {
                warn!(error = %e, "connection dropped before it was accepted");
                continue;
            },
            Err(source) => {
                return Err(ServerError::Io {
                    what: "accept",
                    source,
                });
            },
        };
        let peer = peer.ip().to_string();

        // SAFETY: the master never starts threads or a runtime, so the child
        // is a faithful single-threaded copy.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(listener);
                std::process::exit(worker::run_child(ctx, fd, &peer));
            },
            Ok(ForkResult::Parent { child }) => {
                debug!(pid = %child, peer = %peer, "forked worker");
                drop(fd);
            },
            Err(e) => {
                error!(error = %e, peer = %peer, "fork failed");
                return Err(ServerError::Io {
                    what: "fork",
                    source: e.into(),
                });
            },
        }
    }
}
