//! Network Layer
//!
//! Session layer over a pluggable datagram transport. Everything here is
//! driven from [`Session::tick`]; socket I/O lives behind [`Transport`].

pub mod admission;
pub mod auth;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod loopback;
pub mod message;
pub mod pump;
pub mod session;
pub mod transport;
pub mod websocket;
pub mod world;

pub use auth::{
    AllowAll, ApprovalAuthority, ApprovalParams, AuthConfig, AuthError, Decision, DeferAll,
    DenyAll, TokenApproval, TokenClaims, TokenKey, TokenVerifier,
};
pub use channel::{Channel, ChannelConfig, ChannelRegistry};
pub use config::{ConfigError, NetworkConfig, PrefabConfig, TransportKind};
pub use crypto::{ClientHandshake, HandshakeError, SessionKey};
pub use dispatch::{CustomMessageSink, DiscardCustom};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use message::{MessageKind, Receiver, CUSTOM_TAG_START};
pub use pump::TickPump;
pub use session::{
    ClientState, HostOptions, PendingClient, PendingStage, RemoteClient, Role, Session,
    SessionError, SessionEvent, SessionStats,
};
pub use transport::{ChannelId, ChannelKind, ClientId, NetEvent, Transport, TransportError};
pub use websocket::WebSocketTransport;
pub use world::{NetworkId, NullWorld, SpawnRequest, SpawnedObject, World};
