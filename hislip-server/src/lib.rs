//! # HiSLIP Server Library
//!
//! This crate provides the session and protocol engine of a HiSLIP server:
//! it accepts controller connections, performs the `Initialize`/`AsyncInitialize`
//! handshake, keeps track of concurrently open instrument sessions and routes
//! message payloads to the handler registered for the requested sub-address.
//!
//! ## Architecture
//!
//! - **[`Subaddress`] Trait**: Implemented by instrument backends. One handler is
//!   registered per sub-address (e.g. `hislip0`) and receives the payloads of its sessions.
//! - **[`registry::Registry`]**: Maps sub-address names to handlers.
//! - **[`session::SessionTable`]**: Bounded pool of open sessions shared by all connections.
//! - **[`connection::Connection`]**: The per-connection protocol state machine.
//! - **[`server::Server`]**: Owns configuration, registry and session table and
//!   runs one [`connection::Connection`] per accepted socket.
//!
//! ## How It Works
//!
//! 1. Handlers are registered on a [`server::Server`] before it starts serving
//! 2. The server accepts TCP connections and spawns one task per connection
//! 3. A connection starting with `Initialize` becomes the synchronous channel of a
//!    new session, one starting with `AsyncInitialize` joins an existing session
//!    as its asynchronous channel
//! 4. `Data`/`DataEnd` payloads on the synchronous channel are passed to
//!    [`Subaddress::handle_sync`], the response is sent back as `DataEnd`
//! 5. The session is released as soon as one of its channels closes
//!
//! ## Basic Usage
//!
//! ```ignore
//! use hislip_server::{HandlerError, Subaddress, server::Builder};
//!
//! struct Identity;
//!
//! impl Subaddress for Identity {
//!     fn handle_sync(&self, payload: &[u8], end: bool) -> Result<Vec<u8>, HandlerError> {
//!         if end && payload.starts_with(b"*IDN?") {
//!             Ok(b"ACME,Model 1,0,1.0\n".to_vec())
//!         } else {
//!             Ok(Vec::new())
//!         }
//!     }
//!
//!     fn handle_async(&self, _control_code: u8, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! let mut server = Builder::new().max_sessions(16).build();
//! server.register_subaddress("hislip0", Identity)?;
//! server.listen("127.0.0.1:4880").await?;
//! ```
//!
//! ## Error Handling
//!
//! Malformed headers are logged and skipped. Protocol violations (unknown
//! sub-address, unsupported version, exhausted session table, oversized
//! payloads) are answered with `FatalError` or `Error` before the connection is
//! closed. Handler failures are reported to the client as `Error` messages and
//! do not close the connection.
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Enable logging to see:
//! - Client connections and disconnections
//! - Sessions being opened and released
//! - Protocol messages being processed
//!
//! ## Thread Model
//!
//! Every connection is served by its own tokio task. The session table is the only
//! mutable state shared between connections; the registry is read-only while serving.
pub mod connection;
pub mod registry;
pub mod server;
pub mod session;

use std::{error::Error, fmt::Display};

/// Trait that instrument backends implement to serve a sub-address.
///
/// Implementations are shared between all sessions bound to the sub-address and
/// may be called from several connections at the same time.
pub trait Subaddress: Send + Sync {
    /// Handle a payload received on the synchronous channel.
    ///
    /// # Arguments
    ///
    /// * `payload` - The payload of a `Data` or `DataEnd` message
    /// * `end` - `true` for `DataEnd`, i.e. the payload completes a command
    ///
    /// # Returns
    ///
    /// The response to send back to the client. An empty response sends nothing.
    /// Errors are reported to the client with an `Error` message.
    fn handle_sync(&self, payload: &[u8], end: bool) -> Result<Vec<u8>, HandlerError>;

    /// Handle an out-of-band request received on the asynchronous channel
    /// (`AsyncRemoteLocalControl` or `AsyncStatusQuery`).
    ///
    /// # Arguments
    ///
    /// * `control_code` - The control code of the request
    /// * `payload` - The payload of the request
    ///
    /// # Returns
    ///
    /// The payload of the matching response message.
    fn handle_async(&self, control_code: u8, payload: &[u8]) -> Result<Vec<u8>, HandlerError>;
}

/// Failure of a [`Subaddress`] handler. The text is sent to the client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> HandlerError {
        HandlerError(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError(value)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError(value.to_string())
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for HandlerError {}
