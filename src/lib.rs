//! # Netsync
//!
//! Session layer for real-time multiplayer games: connection admission,
//! optional key exchange, a fixed-rate tick pump and tag-based message
//! dispatch over a pluggable datagram transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         NETSYNC                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Transport-agnostic primitives             │
//! │  ├── bits.rs     - Bit-packed message codec                  │
//! │  └── hash.rs     - Domain-separated SHA-256                  │
//! │                                                              │
//! │  network/        - Session layer                             │
//! │  ├── session.rs  - Lifecycle, roster, outbound helpers       │
//! │  ├── admission.rs- Connection request / approval flow        │
//! │  ├── dispatch.rs - Tag routing and role checks               │
//! │  ├── pump.rs     - Send / receive / event phases             │
//! │  ├── message.rs  - Built-in message payloads                 │
//! │  ├── channel.rs  - Channel table                             │
//! │  ├── crypto.rs   - x25519 handshake, ed25519 signing         │
//! │  ├── auth.rs     - Approval authorities (incl. JWT)          │
//! │  ├── config.rs   - NetworkConfig and config hash             │
//! │  ├── world.rs    - Replication seam                          │
//! │  ├── transport.rs- Transport contract                        │
//! │  ├── websocket.rs- Default WebSocket backend                 │
//! │  └── loopback.rs - In-process backend                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! A [`Session`] is single-threaded: every state change happens inside
//! [`Session::tick`] or a `&mut self` call. Transports may use background
//! tasks, but hand results to the session only through
//! [`Transport::poll_receive`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;

// Re-export commonly used types
pub use core::bits::{BitReader, BitWriter, CodecError};
pub use network::config::NetworkConfig;
pub use network::session::{ClientState, HostOptions, Role, Session, SessionError, SessionEvent};
pub use network::transport::{ChannelKind, ClientId, NetEvent, Transport, TransportError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
