//! Transport Contract
//!
//! The session never touches sockets. Everything below the datagram level
//! goes through [`Transport`], which concrete backends implement
//! (see `loopback` and `websocket`).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-assigned connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    /// Id a client uses for its link to the server.
    pub const SERVER: ClientId = ClientId(0);
    /// Sentinel for the host's own local client.
    pub const HOST: ClientId = ClientId(u32::MAX - 1);
    /// Sentinel for "no client".
    pub const INVALID: ClientId = ClientId(u32::MAX);

    /// Raw numeric value.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ClientId::HOST => write!(f, "host"),
            ClientId::INVALID => write!(f, "invalid"),
            ClientId(id) => write!(f, "{}", id),
        }
    }
}

/// Transport channel identifier.
pub type ChannelId = u8;

/// Delivery guarantee of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Guaranteed, unordered.
    Reliable,
    /// Guaranteed and ordered.
    ReliableSequenced,
    /// Fire and forget.
    Unreliable,
    /// Only the newest datagram matters.
    StateUpdate,
}

/// Event returned by [`Transport::poll_receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A new endpoint is reachable.
    Connect {
        /// Endpoint id.
        client: ClientId,
    },
    /// A datagram arrived.
    Data {
        /// Sender id.
        client: ClientId,
        /// Channel it arrived on.
        channel: ChannelId,
        /// Raw datagram.
        payload: Vec<u8>,
    },
    /// An endpoint went away.
    Disconnect {
        /// Endpoint id.
        client: ClientId,
    },
    /// Queue is empty.
    Nothing,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint is not known to the transport.
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(ClientId),

    /// Channel was never registered.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// Too many channels for the wire channel byte.
    #[error("channel table full")]
    ChannelLimit,

    /// Transport is not started or already shut down.
    #[error("transport not running")]
    NotRunning,

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Datagram transport used by the session.
///
/// Every call must return without blocking: the session drives the
/// transport from inside a fixed-rate simulation step.
pub trait Transport {
    /// Begin connecting to a server. Completion is reported by a
    /// [`NetEvent::Connect`] carrying [`Transport::server_client_id`].
    fn connect(&mut self, address: &str, port: u16) -> Result<(), TransportError>;

    /// Start accepting connections.
    fn register_server_listen_socket(&mut self) -> Result<(), TransportError>;

    /// Register a channel and return its id.
    fn add_channel(&mut self, kind: ChannelKind) -> Result<ChannelId, TransportError>;

    /// Take the next pending event.
    fn poll_receive(&mut self) -> Result<NetEvent, TransportError>;

    /// Queue a datagram for `client` on `channel`.
    fn queue_message(
        &mut self,
        client: ClientId,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Flush everything queued for `client`.
    fn send_queue(&mut self, client: ClientId) -> Result<(), TransportError>;

    /// Drop a client connection (server side).
    fn disconnect_client(&mut self, client: ClientId);

    /// Drop the connection to the server (client side).
    fn disconnect_from_server(&mut self);

    /// Release every resource.
    fn shutdown(&mut self);

    /// Millisecond timestamp exchanged in time sync messages.
    fn network_timestamp(&self) -> i32;

    /// One-way delay estimate for a timestamp produced by `client`.
    fn remote_delay(&self, client: ClientId, remote_timestamp: i32) -> Duration;

    /// Id under which a client sees its server.
    fn server_client_id(&self) -> ClientId {
        ClientId::SERVER
    }

    /// Sentinel used for the host's local client.
    fn host_dummy_id(&self) -> ClientId {
        ClientId::HOST
    }

    /// Sentinel meaning "no client".
    fn invalid_dummy_id(&self) -> ClientId {
        ClientId::INVALID
    }

    /// Delivery kind of the internal handshake channel.
    fn internal_channel_kind(&self) -> ChannelKind {
        ChannelKind::ReliableSequenced
    }
}

/// Delay between a remote millisecond stamp and a local one.
pub(crate) fn stamp_delay(local: i32, remote: i32) -> Duration {
    let diff = local.wrapping_sub(remote);
    if diff <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(diff as u64)
    }
}
