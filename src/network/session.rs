//! Session
//!
//! One [`Session`] owns everything a running server, client or host needs:
//! the transport, the channel table, admitted and pending clients, the
//! handshake state and the tick pump. Nothing is global; all mutation goes
//! through `&mut self` from the embedding loop.
//!
//! Lifecycle: `Session::new` → `start_server` / `start_client` / `start_host`
//! → repeated [`Session::tick`] → `stop` (also run on drop). Every start
//! resets the session to an empty state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::bits::CodecError;

use super::auth::{ApprovalAuthority, ApprovalParams, DeferAll};
use super::channel::{ChannelRegistry, DEFAULT_MESSAGE_CHANNEL, INTERNAL_CHANNEL};
use super::config::{ConfigError, NetworkConfig, TransportKind};
use super::crypto::{ClientHandshake, HandshakeError, SessionKey};
use super::dispatch::{handler_table, CustomMessageSink, DiscardCustom, HandlerTable};
use super::message::{frame, frame_kind, ChangeOwner, MessageKind, CUSTOM_TAG_START};
use super::pump::TickPump;
use super::transport::{ChannelId, ClientId, Transport, TransportError};
use super::websocket::WebSocketTransport;
use super::world::{NetworkId, NullWorld, SpawnRequest, World};

/// What this session is running as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts clients.
    Server,
    /// Connected to a server.
    Client,
    /// Server with a local client.
    Host,
}

impl Role {
    /// Runs server logic.
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server | Role::Host)
    }

    /// Runs client logic.
    pub fn is_client(self) -> bool {
        matches!(self, Role::Client | Role::Host)
    }
}

/// Local view of the link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No link.
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Request sent, waiting for approval.
    PendingApproval,
    /// Approved.
    Connected,
}

/// An admitted client.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    /// Transport id.
    pub id: ClientId,
    /// Key from the handshake, when encryption is on.
    pub key: Option<SessionKey>,
    /// Player object, owned by the world.
    pub player_object: Option<NetworkId>,
    /// Objects this client owns.
    pub owned_objects: Vec<NetworkId>,
}

impl RemoteClient {
    pub(crate) fn new(id: ClientId) -> Self {
        Self {
            id,
            key: None,
            player_object: None,
            owned_objects: Vec::new(),
        }
    }
}

/// Progress of a pending client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStage {
    /// Transport-connected, no request yet.
    AwaitingRequest,
    /// Request received, authority deferred.
    AwaitingDecision,
}

/// A transport-connected client that is not admitted yet.
#[derive(Debug, Clone)]
pub struct PendingClient {
    /// Transport id.
    pub id: ClientId,
    /// Logical time of the connect event.
    pub connected_at: Duration,
    /// Request progress.
    pub stage: PendingStage,
    /// Client key share, dropped once consumed.
    pub(crate) public_share: Option<Vec<u8>>,
    /// Approval payload from the request.
    pub payload: Vec<u8>,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `start_server` / `start_host` succeeded.
    ServerStarted,
    /// A client was admitted (server side).
    ClientConnected(ClientId),
    /// An admitted client left (server side).
    ClientDisconnected(ClientId),
    /// This client was approved under the given id.
    ConnectedToServer(ClientId),
    /// This client lost its server.
    DisconnectedFromServer,
}

/// Counters for dropped traffic and pump activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Non-request messages from pending clients.
    pub dropped_unadmitted: u64,
    /// Messages from unknown senders or with unassigned tags.
    pub dropped_unknown: u64,
    /// Messages that failed to decode.
    pub dropped_malformed: u64,
    /// Messages the local role does not handle.
    pub dropped_wrong_role: u64,
    /// Server event ticks run.
    pub event_ticks: u64,
    /// Time sync broadcasts sent.
    pub time_syncs_sent: u64,
    /// Errors returned by the transport while polling.
    pub receive_errors: u64,
}

/// Options for [`Session::start_host`].
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Spawn parameters of the host's own player object.
    pub player: ApprovalParams,
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `start_*` on a running session.
    #[error("session already running")]
    AlreadyRunning,

    /// Operation needs a running session.
    #[error("session not running")]
    NotRunning,

    /// Operation needs the server role.
    #[error("operation requires the server role")]
    NotServer,

    /// Operation needs the client role.
    #[error("operation requires the client role")]
    NotClient,

    /// No transport injected and the configured kind cannot be built.
    #[error("transport {0:?} could not be resolved")]
    TransportUnresolved(TransportKind),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed datagram.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Key exchange failure.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Configuration failure.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Channel name not registered.
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    /// Client is not admitted.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    /// Client is not waiting for a decision.
    #[error("client {0} is not pending")]
    NotPending(ClientId),

    /// Scene name not registered.
    #[error("unknown scene '{0}'")]
    UnknownScene(String),

    /// Scene switching is turned off.
    #[error("scene switching disabled")]
    SceneSwitchingDisabled,

    /// Tag below the custom range.
    #[error("tag {0} is reserved for internal messages")]
    ReservedTag(u32),
}

/// A server, client or host session.
pub struct Session {
    pub(crate) instance: Uuid,
    pub(crate) config: NetworkConfig,
    pub(crate) config_hash: u64,
    pub(crate) role: Option<Role>,

    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) transport_built: bool,
    pub(crate) approval: Box<dyn ApprovalAuthority>,
    pub(crate) approval_injected: bool,
    pub(crate) custom: Box<dyn CustomMessageSink>,
    pub(crate) world: Box<dyn World>,
    pub(crate) handlers: HandlerTable,

    pub(crate) channels: ChannelRegistry,
    pub(crate) clients: BTreeMap<ClientId, RemoteClient>,
    pub(crate) pending: BTreeMap<ClientId, PendingClient>,

    pub(crate) local_id: ClientId,
    pub(crate) state: ClientState,
    pub(crate) handshake: Option<ClientHandshake>,
    pub(crate) server_key: Option<SessionKey>,
    pub(crate) peers: BTreeSet<ClientId>,
    pub(crate) current_scene: Option<u32>,
    pub(crate) signing_key: Option<SigningKey>,
    pub(crate) verifying_key: Option<VerifyingKey>,

    pub(crate) loopback: VecDeque<(ChannelId, Vec<u8>)>,
    pub(crate) pump: TickPump,
    pub(crate) network_time: Duration,
    pub(crate) stats: SessionStats,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Create a stopped session.
    pub fn new(config: NetworkConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let pump = TickPump::from_config(&config);
        Self {
            instance: Uuid::new_v4(),
            config,
            config_hash: 0,
            role: None,
            transport: None,
            transport_built: false,
            approval: Box::new(DeferAll),
            approval_injected: false,
            custom: Box::new(DiscardCustom),
            world: Box::new(NullWorld::default()),
            handlers: handler_table(),
            channels: ChannelRegistry::default(),
            clients: BTreeMap::new(),
            pending: BTreeMap::new(),
            local_id: ClientId::INVALID,
            state: ClientState::Disconnected,
            handshake: None,
            server_key: None,
            peers: BTreeSet::new(),
            current_scene: None,
            signing_key: None,
            verifying_key: None,
            loopback: VecDeque::new(),
            pump,
            network_time: Duration::ZERO,
            stats: SessionStats::default(),
            events,
        }
    }

    /// Use this transport instead of building one from the config.
    pub fn with_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Box::new(transport));
        self.transport_built = false;
        self
    }

    /// Register the admission authority.
    pub fn with_approval<A: ApprovalAuthority + 'static>(mut self, authority: A) -> Self {
        self.approval = Box::new(authority);
        self.approval_injected = true;
        self
    }

    /// Register the receiver of custom messages.
    pub fn with_custom_messages<S: CustomMessageSink + 'static>(mut self, sink: S) -> Self {
        self.custom = Box::new(sink);
        self
    }

    /// Register the spawning collaborator.
    pub fn with_world<W: World + 'static>(mut self, world: W) -> Self {
        self.world = Box::new(world);
        self
    }

    /// Receive lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    /// Start accepting clients.
    #[instrument(skip(self), fields(session = %self.instance))]
    pub fn start_server(&mut self) -> Result<(), SessionError> {
        self.prepare()?;
        if let Err(e) = self.open_server(Role::Server) {
            self.abort_start();
            return Err(e);
        }
        info!("Server started on port {}", self.config.connect_port);
        self.emit(SessionEvent::ServerStarted);
        Ok(())
    }

    /// Start as a server with a local client.
    #[instrument(skip(self, options), fields(session = %self.instance))]
    pub fn start_host(&mut self, options: HostOptions) -> Result<(), SessionError> {
        self.prepare()?;
        if let Err(e) = self.open_server(Role::Host) {
            self.abort_start();
            return Err(e);
        }

        let host = ClientId::HOST;
        let mut record = RemoteClient::new(host);
        if self.config.handle_object_spawning {
            if let Some(id) = self.spawn_player(host, &options.player) {
                record.player_object = Some(id);
                record.owned_objects.push(id);
            }
        }
        self.clients.insert(host, record);
        self.local_id = host;
        self.state = ClientState::Connected;

        info!("Host started on port {}", self.config.connect_port);
        self.emit(SessionEvent::ServerStarted);
        self.emit(SessionEvent::ClientConnected(host));
        Ok(())
    }

    /// Connect to the configured server.
    #[instrument(skip(self), fields(session = %self.instance))]
    pub fn start_client(&mut self) -> Result<(), SessionError> {
        self.prepare()?;
        if let Err(e) = self.open_client() {
            self.abort_start();
            return Err(e);
        }
        info!(
            "Client connecting to {}:{}",
            self.config.connect_address, self.config.connect_port
        );
        Ok(())
    }

    /// Reset state, resolve the transport and load keys.
    fn prepare(&mut self) -> Result<(), SessionError> {
        if self.role.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        self.reset();
        self.config.sanitize();
        self.config_hash = self.config.config_hash()?;
        self.pump = TickPump::from_config(&self.config);
        debug!("Config hash {}", hex::encode(self.config_hash.to_le_bytes()));

        if self.transport.is_none() {
            self.transport = Some(self.build_transport()?);
            self.transport_built = true;
        }

        if self.config.connection_approval && !self.approval_injected {
            warn!("Connection approval enabled without an authority: pending clients will time out");
        }
        Ok(())
    }

    fn build_transport(&self) -> Result<Box<dyn Transport>, SessionError> {
        match self.config.transport {
            TransportKind::WebSocket => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => Ok(Box::new(WebSocketTransport::new(
                    runtime,
                    self.config.bind_address.clone(),
                    self.config.connect_port,
                ))),
                Err(_) => {
                    warn!("WebSocket transport needs a tokio runtime");
                    Err(SessionError::TransportUnresolved(TransportKind::WebSocket))
                }
            },
            TransportKind::Custom => Err(SessionError::TransportUnresolved(TransportKind::Custom)),
        }
    }

    fn open_server(&mut self, role: Role) -> Result<(), SessionError> {
        if self.config.signing_enabled() {
            self.signing_key = match self.config.signing_key()? {
                Some(key) => Some(key),
                None => {
                    let key = SigningKey::generate(&mut OsRng);
                    warn!(
                        "Key exchange signing enabled without a server key, using ephemeral key {}",
                        hex::encode(key.verifying_key().to_bytes())
                    );
                    Some(key)
                }
            };
        }
        if self.config.enable_scene_switching {
            self.current_scene = self.config.scene_index(&self.config.active_scene);
        }

        let user_channels = self.config.channels.clone();
        let transport = self.transport_mut()?;
        let channels = ChannelRegistry::register(transport.as_mut(), &user_channels)?;
        transport.register_server_listen_socket()?;
        self.channels = channels;
        self.role = Some(role);
        Ok(())
    }

    fn open_client(&mut self) -> Result<(), SessionError> {
        if self.config.signing_enabled() {
            self.verifying_key = self.config.verifying_key()?;
            if self.verifying_key.is_none() {
                warn!("Key exchange signing enabled without a trusted server key: approval will fail");
            }
        }

        let address = self.config.connect_address.clone();
        let port = self.config.connect_port;
        let user_channels = self.config.channels.clone();
        let transport = self.transport_mut()?;
        let channels = ChannelRegistry::register(transport.as_mut(), &user_channels)?;
        self.channels = channels;
        self.role = Some(Role::Client);
        self.state = ClientState::Connecting;
        self.transport_mut()?.connect(&address, port)?;
        Ok(())
    }

    fn abort_start(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown();
        }
        if self.transport_built {
            self.transport = None;
            self.transport_built = false;
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.role = None;
        self.channels.clear();
        self.clients.clear();
        self.pending.clear();
        self.local_id = ClientId::INVALID;
        self.state = ClientState::Disconnected;
        self.handshake = None;
        self.server_key = None;
        self.peers.clear();
        self.current_scene = None;
        self.signing_key = None;
        self.verifying_key = None;
        self.loopback.clear();
        self.network_time = Duration::ZERO;
        self.stats = SessionStats::default();
    }

    /// Disconnect everyone, shut the transport down and clear all state.
    ///
    /// Safe to call at any point, including on a stopped session.
    #[instrument(skip(self), fields(session = %self.instance))]
    pub fn stop(&mut self) {
        let Some(role) = self.role else {
            return;
        };

        if let Some(transport) = self.transport.as_mut() {
            if role.is_server() {
                let host = transport.host_dummy_id();
                let invalid = transport.invalid_dummy_id();
                let ids: BTreeSet<ClientId> = self
                    .clients
                    .keys()
                    .chain(self.pending.keys())
                    .copied()
                    .filter(|id| *id != host && *id != invalid)
                    .collect();
                for id in ids {
                    transport.disconnect_client(id);
                }
            } else if self.state != ClientState::Disconnected {
                transport.disconnect_from_server();
            }
            transport.shutdown();
        }
        if self.transport_built {
            self.transport = None;
            self.transport_built = false;
        }

        if role.is_server() {
            let known: Vec<ClientId> = self.clients.keys().chain(self.pending.keys()).copied().collect();
            for id in known {
                self.approval.on_disconnect(id);
            }
        }

        let was_linked = role == Role::Client && self.state != ClientState::Disconnected;
        self.reset();
        info!("Session stopped");
        if was_linked {
            self.emit(SessionEvent::DisconnectedFromServer);
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Unique id of this session instance, used in logs.
    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    /// Current role, `None` when stopped.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Started and not stopped.
    pub fn is_running(&self) -> bool {
        self.role.is_some()
    }

    /// Runs server logic.
    pub fn is_server(&self) -> bool {
        self.role.is_some_and(Role::is_server)
    }

    /// Runs client logic.
    pub fn is_client(&self) -> bool {
        self.role.is_some_and(Role::is_client)
    }

    /// Link state of the local client.
    pub fn client_state(&self) -> ClientState {
        self.state
    }

    /// Id the server assigned to this client.
    pub fn local_client_id(&self) -> ClientId {
        self.local_id
    }

    /// Logical network time.
    pub fn network_time(&self) -> Duration {
        self.network_time
    }

    /// Active configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Fingerprint sent in connection requests.
    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    /// Registered channels.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Admitted client record.
    pub fn client(&self, id: ClientId) -> Option<&RemoteClient> {
        self.clients.get(&id)
    }

    /// Admitted client ids.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Pending client record.
    pub fn pending_client(&self, id: ClientId) -> Option<&PendingClient> {
        self.pending.get(&id)
    }

    /// Pending client ids.
    pub fn pending_ids(&self) -> Vec<ClientId> {
        self.pending.keys().copied().collect()
    }

    /// Other clients known to this client.
    pub fn peers(&self) -> Vec<ClientId> {
        self.peers.iter().copied().collect()
    }

    /// Key shared with the server (client side).
    pub fn server_key(&self) -> Option<&SessionKey> {
        self.server_key.as_ref()
    }

    /// Active scene index.
    pub fn current_scene(&self) -> Option<u32> {
        self.current_scene
    }

    /// Traffic counters.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    pub(crate) fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>, SessionError> {
        self.transport.as_mut().ok_or(SessionError::NotRunning)
    }

    /// Queue a datagram. Datagrams for the host's own client go to the
    /// loopback queue and are read back at the next receive phase.
    pub(crate) fn queue(
        &mut self,
        to: ClientId,
        channel: &str,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        let channel_id = self
            .channels
            .id(channel)
            .ok_or_else(|| SessionError::UnknownChannel(channel.to_string()))?;

        #[cfg(feature = "debug-tracing")]
        tracing::trace!("-> {} [{}] {}", to, channel, hex::encode(bytes));

        if to == ClientId::HOST && self.role == Some(Role::Host) {
            self.loopback.push_back((channel_id, bytes.to_vec()));
            return Ok(());
        }
        self.transport_mut()?.queue_message(to, channel_id, bytes)?;
        Ok(())
    }

    /// Queue to every admitted client except `except`; failures are logged.
    pub(crate) fn queue_all(&mut self, channel: &str, bytes: &[u8], except: Option<ClientId>) {
        let targets: Vec<ClientId> = self
            .clients
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for id in targets {
            if let Err(e) = self.queue(id, channel, bytes) {
                warn!("Failed to queue for client {}: {}", id, e);
            }
        }
    }

    pub(crate) fn spawn_player(&mut self, owner: ClientId, params: &ApprovalParams) -> Option<NetworkId> {
        let Some(prefab) = params.prefab.or_else(|| self.config.player_prefab()) else {
            warn!("No player prefab, client {} spawns without a player object", owner);
            return None;
        };
        let id = self.world.create_spawned_object(SpawnRequest {
            prefab,
            owner,
            is_player: true,
            position: params.position,
            rotation: params.rotation,
            payload: Vec::new(),
        });
        debug!("Spawned player object {} for client {}", id, owner);
        Some(id)
    }

    /// Send a custom envelope message on `channel`. Clients always send to
    /// the server.
    pub fn send_custom_message(
        &mut self,
        to: ClientId,
        channel: &str,
        body: &[u8],
    ) -> Result<(), SessionError> {
        self.send_custom_message_to(&[to], channel, body)
    }

    /// Send one custom envelope message to several admitted clients.
    ///
    /// Every id is checked before anything is queued.
    pub fn send_custom_message_to(
        &mut self,
        targets: &[ClientId],
        channel: &str,
        body: &[u8],
    ) -> Result<(), SessionError> {
        let role = self.role.ok_or(SessionError::NotRunning)?;
        if self.channels.id(channel).is_none() {
            return Err(SessionError::UnknownChannel(channel.to_string()));
        }
        let targets = if role == Role::Client {
            vec![self.transport_mut()?.server_client_id()]
        } else {
            if let Some(unknown) = targets.iter().find(|id| !self.clients.contains_key(*id)) {
                return Err(SessionError::UnknownClient(*unknown));
            }
            targets.to_vec()
        };

        let mut writer = frame_kind(MessageKind::CustomMessage);
        writer.write_raw(body);
        for id in targets {
            self.queue(id, channel, writer.as_bytes())?;
        }
        Ok(())
    }

    /// Send a custom envelope message to every admitted client.
    pub fn broadcast_custom_message(&mut self, channel: &str, body: &[u8]) -> Result<(), SessionError> {
        if !self.is_server() {
            return Err(SessionError::NotServer);
        }
        if self.channels.id(channel).is_none() {
            return Err(SessionError::UnknownChannel(channel.to_string()));
        }
        let mut writer = frame_kind(MessageKind::CustomMessage);
        writer.write_raw(body);
        self.queue_all(channel, writer.as_bytes(), None);
        Ok(())
    }

    /// Send an application message with a tag of 32 or above.
    pub fn send_user_message(
        &mut self,
        to: ClientId,
        tag: u32,
        channel: &str,
        body: &[u8],
    ) -> Result<(), SessionError> {
        if tag < CUSTOM_TAG_START {
            return Err(SessionError::ReservedTag(tag));
        }
        let role = self.role.ok_or(SessionError::NotRunning)?;
        let target = if role == Role::Client {
            self.transport_mut()?.server_client_id()
        } else {
            to
        };
        let mut writer = frame(tag);
        writer.write_raw(body);
        self.queue(target, channel, writer.as_bytes())
    }

    /// Switch every client to a registered scene.
    pub fn switch_scene(&mut self, name: &str) -> Result<(), SessionError> {
        if !self.is_server() {
            return Err(SessionError::NotServer);
        }
        if !self.config.enable_scene_switching {
            return Err(SessionError::SceneSwitchingDisabled);
        }
        let index = self
            .config
            .scene_index(name)
            .ok_or_else(|| SessionError::UnknownScene(name.to_string()))?;

        self.current_scene = Some(index);
        self.config.active_scene = name.to_string();
        self.world.switch_scene(index);

        let mut writer = frame_kind(MessageKind::SwitchScene);
        writer.write_var_u32(index);
        self.queue_all(INTERNAL_CHANNEL, writer.as_bytes(), Some(ClientId::HOST));
        info!("Switched to scene '{}' ({})", name, index);
        Ok(())
    }

    /// Move an object to a new owner and tell every client.
    pub fn change_owner(&mut self, object: NetworkId, owner: ClientId) -> Result<(), SessionError> {
        if !self.is_server() {
            return Err(SessionError::NotServer);
        }
        if !self.clients.contains_key(&owner) {
            return Err(SessionError::UnknownClient(owner));
        }
        for client in self.clients.values_mut() {
            client.owned_objects.retain(|id| *id != object);
        }
        if let Some(client) = self.clients.get_mut(&owner) {
            client.owned_objects.push(object);
        }
        self.world.change_owner(object, owner);

        let mut writer = frame_kind(MessageKind::ChangeOwner);
        ChangeOwner { object, owner }.encode(&mut writer);
        self.queue_all(DEFAULT_MESSAGE_CHANNEL, writer.as_bytes(), Some(ClientId::HOST));
        debug!("Object {} now owned by {}", object, owner);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance", &self.instance)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("clients", &self.clients.len())
            .field("pending", &self.pending.len())
            .field("network_time", &self.network_time)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::loopback::LoopbackHub;

    fn custom_config() -> NetworkConfig {
        NetworkConfig {
            transport: TransportKind::Custom,
            ..Default::default()
        }
    }

    #[test]
    fn test_custom_transport_must_be_injected() {
        let mut session = Session::new(custom_config());
        assert!(matches!(
            session.start_server(),
            Err(SessionError::TransportUnresolved(TransportKind::Custom))
        ));
        assert!(!session.is_running());
    }

    #[test]
    fn test_websocket_without_runtime_is_unresolved() {
        let mut session = Session::new(NetworkConfig::default());
        assert!(matches!(
            session.start_server(),
            Err(SessionError::TransportUnresolved(TransportKind::WebSocket))
        ));
    }

    #[test]
    fn test_double_start_rejected() {
        let hub = LoopbackHub::new();
        let mut session = Session::new(custom_config()).with_transport(hub.endpoint());
        session.start_server().unwrap();
        assert!(matches!(session.start_server(), Err(SessionError::AlreadyRunning)));
        assert_eq!(session.role(), Some(Role::Server));
    }

    #[test]
    fn test_restart_resets_state() {
        let hub = LoopbackHub::new();
        let mut session = Session::new(custom_config()).with_transport(hub.endpoint());
        session.start_host(HostOptions::default()).unwrap();
        assert_eq!(session.client_ids(), vec![ClientId::HOST]);

        session.stop();
        assert!(session.client_ids().is_empty());
        assert!(session.channels().is_empty());

        session.start_server().unwrap();
        assert!(session.client_ids().is_empty());
        assert!(!session.channels().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let hub = LoopbackHub::new();
        let mut session = Session::new(custom_config()).with_transport(hub.endpoint());
        session.start_server().unwrap();
        session.stop();
        session.stop();
        assert!(!session.is_running());
    }

    #[test]
    fn test_reserved_tags_rejected_for_user_messages() {
        let hub = LoopbackHub::new();
        let mut session = Session::new(custom_config()).with_transport(hub.endpoint());
        session.start_server().unwrap();
        assert!(matches!(
            session.send_user_message(ClientId(1), 5, DEFAULT_MESSAGE_CHANNEL, b"x"),
            Err(SessionError::ReservedTag(5))
        ));
    }

    #[test]
    fn test_server_only_operations() {
        let mut session = Session::new(custom_config());
        assert!(matches!(session.switch_scene("a"), Err(SessionError::NotServer)));
        assert!(matches!(
            session.broadcast_custom_message(DEFAULT_MESSAGE_CHANNEL, b""),
            Err(SessionError::NotServer)
        ));
        assert!(matches!(
            session.send_custom_message(ClientId(1), DEFAULT_MESSAGE_CHANNEL, b""),
            Err(SessionError::NotRunning)
        ));
    }

    #[test]
    fn test_custom_message_checks_channel_and_targets() {
        let hub = LoopbackHub::new();
        let mut session = Session::new(custom_config()).with_transport(hub.endpoint());
        session.start_host(HostOptions::default()).unwrap();

        assert!(matches!(
            session.broadcast_custom_message("nowhere", b""),
            Err(SessionError::UnknownChannel(_))
        ));
        assert!(matches!(
            session.send_custom_message_to(&[ClientId::HOST, ClientId(9)], DEFAULT_MESSAGE_CHANNEL, b""),
            Err(SessionError::UnknownClient(ClientId(9)))
        ));
        // Nothing was queued for the valid target either.
        assert!(session.loopback.is_empty());

        session
            .send_custom_message_to(&[ClientId::HOST], DEFAULT_MESSAGE_CHANNEL, b"self")
            .unwrap();
        assert_eq!(session.loopback.len(), 1);
    }

    #[tokio::test]
    async fn test_events_on_host_start() {
        let hub = LoopbackHub::new();
        let mut session = Session::new(custom_config()).with_transport(hub.endpoint());
        let mut events = session.subscribe_events();
        session.start_host(HostOptions::default()).unwrap();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::ServerStarted);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ClientConnected(ClientId::HOST)
        );
    }
}
