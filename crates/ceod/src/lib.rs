//! ceod - privileged account-administration RPC daemon and client library.
//!
//! A client names an operation; the daemon on the operation's owning host
//! authenticates the caller, decrypts the request and pipes it into a local
//! `op-<name>` executable whose output becomes the response.
//!
//! # Modules
//!
//! - [`protocol`]: message framing and the stream/message transport bindings
//! - [`security`]: mutual-authentication handshake and per-message
//!   protection
//! - [`registry`]: the operation table loaded from `ops.d`
//! - [`dispatch`]: running local operations as subprocesses
//! - [`server`]: the accepting master and per-connection workers
//! - [`client`]: the single-request client driver
//! - [`config`], [`resolve`]: startup configuration and host resolution

pub mod client;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod resolve;
pub mod security;
pub mod server;
