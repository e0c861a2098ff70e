//! Client driver: one authenticated request per connection.
//!
//! Looks the operation up in the local copy of the registry, connects to the
//! daemon on its owning host, authenticates as the initiator, sends the
//! request and waits for exactly one response of the same type.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{CeoConfig, ConfigError, Paths};
use crate::protocol::{self, Message, MessageTransport, ProtocolError, TransportKind};
use crate::registry::{LoadMode, Operation, Registry, RegistryError};
use crate::resolve::{HostResolver, SystemResolver};
use crate::security::handshake::initiate;
use crate::security::psk::service_principal;
use crate::security::{
    Keytab, KeytabError, MAX_PLAINTEXT_SIZE, PskInitiator, Role, SecurityContext,
};

/// Client failures. All are fatal.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration file error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Initiator key table error.
    #[error("cannot load client credentials: {0}")]
    Keytab(#[from] KeytabError),

    /// No operation has this name.
    #[error("no such operation: {name}")]
    UnknownOperation {
        /// Requested name.
        name: String,
    },

    /// The request payload is empty.
    #[error("no data to send")]
    EmptyRequest,

    /// The request would not fit in one message once wrapped.
    #[error("request of {size} bytes exceeds {max} bytes", max = MAX_PLAINTEXT_SIZE)]
    RequestTooLarge {
        /// Request length.
        size: usize,
    },

    /// Connection, handshake or exchange failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client configuration resolved at startup.
#[derive(Debug)]
pub struct Client {
    registry: Registry,
    keytab: Arc<Keytab>,
    principal: Option<String>,
    service: String,
    transport: TransportKind,
    port: u16,
}

impl Client {
    /// Load configuration, credentials and registry using system resolution.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error.
    pub fn load(paths: &Paths) -> Result<Self, ClientError> {
        let config = CeoConfig::load(paths)?;
        Self::with_resolver(paths, &config, &SystemResolver)
    }

    /// Build a client from an already parsed configuration.
    ///
    /// The registry is loaded in [`LoadMode::Client`]: a caller on the
    /// owning host needs neither execute permission on the operation nor
    /// its run-as user.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error.
    pub fn with_resolver(
        paths: &Paths,
        config: &CeoConfig,
        resolver: &dyn HostResolver,
    ) -> Result<Self, ClientError> {
        let keytab = Keytab::from_file(config.client.keytab_path(paths))?;
        let registry = Registry::load(paths, resolver, &config.run_as, LoadMode::Client)?;
        Ok(Self {
            registry,
            keytab: Arc::new(keytab),
            principal: config.client.principal.clone(),
            service: config.daemon.service.clone(),
            transport: config.daemon.transport,
            port: config.daemon.port,
        })
    }

    /// The loaded registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Look up an operation by name.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownOperation`] if no operation has this
    /// name.
    pub fn operation(&self, name: &str) -> Result<&Operation, ClientError> {
        self.registry
            .get_by_name(name)
            .ok_or_else(|| ClientError::UnknownOperation {
                name: name.to_string(),
            })
    }

    /// A fresh initiator context targeting `op`'s owning host.
    ///
    /// # Errors
    ///
    /// Fails if the key table has no usable credential.
    pub fn new_initiator(&self, op: &Operation) -> Result<SecurityContext, ClientError> {
        let target = service_principal(&self.service, &op.host);
        let mechanism = PskInitiator::from_keytab(&self.keytab, self.principal.as_deref(), target)
            .map_err(ProtocolError::from)?;
        Ok(SecurityContext::new(Role::Initiator, Box::new(mechanism)))
    }

    /// Run `name` with `request` and return the response payload.
    ///
    /// # Errors
    ///
    /// Returns the first fatal condition.
    pub async fn call(&self, name: &str, request: &[u8]) -> Result<Vec<u8>, ClientError> {
        let op = self.operation(name)?;
        if request.is_empty() {
            return Err(ClientError::EmptyRequest);
        }
        if request.len() > MAX_PLAINTEXT_SIZE {
            return Err(ClientError::RequestTooLarge {
                size: request.len(),
            });
        }

        let addr = SocketAddr::new(op.addr, self.port);
        debug!(op = %op.name, host = %op.host, %addr, "connecting");
        let mut transport = protocol::connect(self.transport, addr).await?;
        let mut security = self.new_initiator(op)?;

        let response = exchange(transport.as_mut(), &mut security, op.msg_type, request).await?;
        transport.close().await?;
        Ok(response)
    }
}

/// Authenticate, send one request and receive its response.
///
/// # Errors
///
/// Fails on any handshake or transport error, a peer close before the
/// response, or a response tagged with another type.
pub async fn exchange<T>(
    transport: &mut T,
    security: &mut SecurityContext,
    msg_type: u32,
    request: &[u8],
) -> Result<Vec<u8>, ProtocolError>
where
    T: MessageTransport + ?Sized,
{
    initiate(transport, security).await?;

    let wrapped = security.wrap(request)?;
    transport.send(Message::new(msg_type, wrapped)).await?;

    let reply = transport
        .recv()
        .await?
        .ok_or(ProtocolError::ConnectionClosed {
            during: "before response",
        })?;
    if reply.msg_type != msg_type {
        return Err(ProtocolError::TypeMismatch {
            expected: msg_type,
            got: reply.msg_type,
        });
    }
    Ok(security.unwrap(&reply.payload)?)
}
