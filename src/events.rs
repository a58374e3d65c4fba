//! Observability hooks for the connection lifecycle.
//!
//! Every method has a no-op default, so implementors only override what
//! they care about. Errors always flow through [`ServerEvents::server_error`];
//! nothing is silently swallowed.

use std::net::SocketAddr;

use crate::{connection::ConnectionId, error::Error};

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the connection or never sent another request.
    ClientClosed,
    /// The request carried `Connection: close` or was HTTP/1.0.
    ConnectionClose,
    /// The keep-alive request limit was reached.
    KeepAliveExhausted,
    /// The first-request read timed out.
    Timeout,
    /// Server shutdown or worker cancellation.
    Shutdown,
    /// An unrecoverable protocol or I/O failure.
    Error,
}

pub trait ServerEvents: Send + Sync {
    fn client_connected(&self, _id: ConnectionId, _peer: Option<SocketAddr>) {}

    fn client_disconnected(&self, _id: ConnectionId, _reason: DisconnectReason) {}

    fn read_request_timed_out(&self, _id: ConnectionId) {}

    fn server_error(&self, error: &Error) {
        log::error!("server error: {error}");
    }
}

/// The default hook set: lifecycle events are dropped, errors are logged.
impl ServerEvents for () {}
