//! Connection Lifecycle
//!
//! Per remote endpoint:
//!
//! ```text
//! Disconnected ─► Connecting ─► PendingApproval ─► Connected ─► Disconnected
//!                      │               │
//!                      └── timeout / deny / config mismatch ──► Disconnected
//! ```
//!
//! Server side, an id lives in exactly one of `pending` and `clients`, or in
//! neither. Client side, the session walks its own [`ClientState`].

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, warn};

use crate::core::bits::BitReader;

use super::auth::{ApprovalParams, Decision};
use super::channel::INTERNAL_CHANNEL;
use super::crypto::{server_respond, ClientHandshake};
use super::message::{
    encode_client, frame_kind, AddObject, ApprovalLayout, ConnectionApproved, ConnectionRequest,
    MessageKind,
};
use super::session::{
    ClientState, PendingClient, PendingStage, RemoteClient, Session, SessionError, SessionEvent,
};
use super::transport::ClientId;
use super::world::SpawnedObject;

impl Session {
    fn approval_layout(&self) -> ApprovalLayout {
        ApprovalLayout {
            scene_switching: self.config.enable_scene_switching,
            encryption: self.config.enable_encryption,
            signing: self.config.signing_enabled(),
            spawning: self.config.handle_object_spawning,
        }
    }

    /// Transport reported a new endpoint.
    pub(crate) fn on_transport_connect(&mut self, id: ClientId) {
        if self.is_server() {
            if self.pending.contains_key(&id) || self.clients.contains_key(&id) {
                warn!("Duplicate connect event for {}", id);
                return;
            }
            debug!("Client {} connected, awaiting request", id);
            self.pending.insert(
                id,
                PendingClient {
                    id,
                    connected_at: self.network_time,
                    stage: PendingStage::AwaitingRequest,
                    public_share: None,
                    payload: Vec::new(),
                },
            );
            return;
        }

        if let Err(e) = self.send_connection_request(id) {
            warn!("Connection request failed: {}", e);
            self.stop();
        }
    }

    fn send_connection_request(&mut self, server: ClientId) -> Result<(), SessionError> {
        let public_share = if self.config.enable_encryption {
            let handshake = ClientHandshake::new();
            let share = handshake.public_share().to_vec();
            self.handshake = Some(handshake);
            Some(share)
        } else {
            None
        };
        let payload = self
            .config
            .connection_approval
            .then(|| self.config.connection_data.clone());

        let request = ConnectionRequest {
            config_hash: self.config_hash,
            public_share,
            payload,
        };
        let mut writer = frame_kind(MessageKind::ConnectionRequest);
        request.encode(&mut writer);

        self.queue(server, INTERNAL_CHANNEL, writer.as_bytes())?;
        self.transport_mut()?.send_queue(server)?;
        self.state = ClientState::PendingApproval;
        debug!("Connection request sent to {}", server);
        Ok(())
    }

    pub(crate) fn on_connection_request(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<(), SessionError> {
        let Some(stage) = self.pending.get(&sender).map(|p| p.stage) else {
            debug!("Ignoring connection request from admitted client {}", sender);
            return Ok(());
        };
        if stage != PendingStage::AwaitingRequest {
            debug!("Duplicate connection request from {}", sender);
            return Ok(());
        }

        let hash = ConnectionRequest::read_hash(reader)?;
        if hash != self.config_hash {
            warn!(
                "Client {} config hash {} does not match {}, disconnecting",
                sender,
                hex::encode(hash.to_le_bytes()),
                hex::encode(self.config_hash.to_le_bytes())
            );
            self.reject(sender);
            return Ok(());
        }
        let request = ConnectionRequest::read_tail(
            hash,
            reader,
            self.config.enable_encryption,
            self.config.connection_approval,
        )?;

        if !self.config.connection_approval {
            if let Some(pending) = self.pending.get_mut(&sender) {
                pending.public_share = request.public_share;
            }
            return self.admit(sender, ApprovalParams::default());
        }

        let payload = request.payload.unwrap_or_default();
        if let Some(pending) = self.pending.get_mut(&sender) {
            pending.stage = PendingStage::AwaitingDecision;
            pending.public_share = request.public_share;
            pending.payload = payload.clone();
        }

        match self.approval.decide(sender, &payload) {
            Decision::Approve(params) => self.admit(sender, params),
            Decision::Deny => {
                info!("Client {} denied", sender);
                self.reject(sender);
                Ok(())
            }
            Decision::Defer => {
                debug!("Decision for {} deferred", sender);
                Ok(())
            }
        }
    }

    /// Admit a client whose decision was deferred.
    pub fn approve(&mut self, id: ClientId, params: ApprovalParams) -> Result<(), SessionError> {
        if !self.is_server() {
            return Err(SessionError::NotServer);
        }
        match self.pending.get(&id) {
            Some(p) if p.stage == PendingStage::AwaitingDecision => self.admit(id, params),
            _ => Err(SessionError::NotPending(id)),
        }
    }

    /// Refuse a pending client.
    pub fn deny(&mut self, id: ClientId) -> Result<(), SessionError> {
        if !self.is_server() {
            return Err(SessionError::NotServer);
        }
        if !self.pending.contains_key(&id) {
            return Err(SessionError::NotPending(id));
        }
        self.reject(id);
        Ok(())
    }

    /// Drop a pending client and disconnect it.
    pub(crate) fn reject(&mut self, id: ClientId) {
        if self.pending.remove(&id).is_none() {
            return;
        }
        self.approval.on_disconnect(id);
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect_client(id);
        }
        info!("Client {} rejected", id);
    }

    /// Promote a pending client to connected.
    #[instrument(skip(self, params))]
    pub(crate) fn admit(&mut self, id: ClientId, params: ApprovalParams) -> Result<(), SessionError> {
        let pending = self.pending.remove(&id).ok_or(SessionError::NotPending(id))?;
        let mut record = RemoteClient::new(id);

        let mut server_share = None;
        let mut signature = None;
        if self.config.enable_encryption {
            let share = pending.public_share.unwrap_or_default();
            let signer = if self.config.signing_enabled() {
                self.signing_key.as_ref()
            } else {
                None
            };
            match server_respond(&share, signer) {
                Ok(response) => {
                    debug!("Client {} key {}", id, response.key.fingerprint());
                    record.key = Some(response.key);
                    server_share = Some(response.public_share.to_vec());
                    signature = response.signature;
                }
                Err(e) => {
                    warn!("Key exchange with {} failed: {}", id, e);
                    if let Some(transport) = self.transport.as_mut() {
                        transport.disconnect_client(id);
                    }
                    return Err(e.into());
                }
            }
        }

        let mut player: Option<SpawnedObject> = None;
        if self.config.handle_object_spawning {
            if let Some(object) = self.spawn_player(id, &params) {
                record.player_object = Some(object);
                record.owned_objects.push(object);
                player = Some(
                    self.world
                        .spawned_objects()
                        .into_iter()
                        .find(|o| o.id == object)
                        .unwrap_or(SpawnedObject {
                            id: object,
                            owner: id,
                            prefab: params.prefab.or(self.config.player_prefab()).unwrap_or(0),
                            is_player: true,
                            active: true,
                            scene_object: false,
                            position: params.position,
                            rotation: params.rotation,
                            variables: Vec::new(),
                        }),
                );
            }
        }

        let peers: Vec<ClientId> = self.clients.keys().copied().collect();
        self.clients.insert(id, record);

        let timestamp = self.transport_mut()?.network_timestamp();
        let approved = ConnectionApproved {
            client_id: id,
            scene_index: self
                .config
                .enable_scene_switching
                .then(|| self.current_scene.unwrap_or(0)),
            server_share,
            signature,
            time: self.network_time.as_secs_f32(),
            timestamp,
            peers: peers.clone(),
            objects: self
                .config
                .handle_object_spawning
                .then(|| self.world.spawned_objects()),
        };
        let mut writer = frame_kind(MessageKind::ConnectionApproved);
        approved.encode(&mut writer);
        self.queue(id, INTERNAL_CHANNEL, writer.as_bytes())?;

        let notice = match player {
            Some(object) => AddObject::Spawned(object),
            None => AddObject::Joined(id),
        };
        let mut writer = frame_kind(MessageKind::AddObject);
        notice.encode(&mut writer, self.config.handle_object_spawning);
        for peer in peers {
            if let Err(e) = self.queue(peer, INTERNAL_CHANNEL, writer.as_bytes()) {
                warn!("Failed to notify {} of {}: {}", peer, id, e);
            }
        }

        info!("Client {} approved", id);
        self.emit(SessionEvent::ClientConnected(id));
        Ok(())
    }

    pub(crate) fn on_connection_approved(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<(), SessionError> {
        if self.state != ClientState::PendingApproval {
            debug!("Unexpected approval in state {:?}", self.state);
            return Ok(());
        }
        let approved = ConnectionApproved::decode(reader, self.approval_layout())?;

        if self.config.enable_encryption {
            let verifier = self
                .config
                .signing_enabled()
                .then_some(self.verifying_key.as_ref());
            let share = approved.server_share.as_deref().unwrap_or_default();
            let result = match self.handshake.take() {
                Some(handshake) => handshake
                    .finish(share, approved.signature.as_deref(), verifier)
                    .map_err(SessionError::from),
                None => Err(SessionError::NotClient),
            };
            match result {
                Ok(key) => {
                    debug!("Server key {}", key.fingerprint());
                    self.server_key = Some(key);
                }
                Err(e) => {
                    warn!("Rejecting approval from server: {}", e);
                    self.stop();
                    return Ok(());
                }
            }
        }

        self.local_id = approved.client_id;
        self.state = ClientState::Connected;
        self.peers = approved
            .peers
            .iter()
            .copied()
            .filter(|p| *p != approved.client_id)
            .collect::<BTreeSet<_>>();

        if let Some(index) = approved.scene_index {
            self.current_scene = Some(index);
            self.world.switch_scene(index);
        }
        for object in approved.objects.iter().flatten() {
            self.world.replicate_object(object);
        }

        let delay = self
            .transport
            .as_ref()
            .map(|t| t.remote_delay(sender, approved.timestamp))
            .unwrap_or_default();
        let time = std::time::Duration::try_from_secs_f32(approved.time).unwrap_or_default() + delay;
        self.network_time = time;
        self.pump.rebase(time);

        info!(
            "Connected as client {} with {} peers",
            approved.client_id,
            self.peers.len()
        );
        self.emit(SessionEvent::ConnectedToServer(approved.client_id));
        Ok(())
    }

    /// Transport reported an endpoint gone.
    pub(crate) fn on_transport_disconnect(&mut self, id: ClientId) {
        if self.is_server() {
            self.cleanup_client(id);
            return;
        }
        info!("Lost connection to server");
        // The link is already gone.
        self.state = ClientState::Disconnected;
        self.stop();
        self.emit(SessionEvent::DisconnectedFromServer);
    }

    /// Forget `id` everywhere. Returns whether anything was removed.
    ///
    /// Only admitted clients trigger the ClientDisconnect broadcast, so
    /// repeated calls never notify twice.
    pub(crate) fn cleanup_client(&mut self, id: ClientId) -> bool {
        let was_pending = self.pending.remove(&id).is_some();
        let was_admitted = self.clients.remove(&id).is_some();
        if was_pending || was_admitted {
            self.approval.on_disconnect(id);
        }
        if !was_admitted {
            if was_pending {
                debug!("Pending client {} left", id);
            }
            return was_pending;
        }

        if self.config.handle_object_spawning {
            self.world.destroy_objects_owned_by(id);
        }

        let mut writer = frame_kind(MessageKind::ClientDisconnect);
        encode_client(&mut writer, id);
        self.queue_all(INTERNAL_CHANNEL, writer.as_bytes(), None);

        info!("Client {} disconnected", id);
        self.emit(SessionEvent::ClientDisconnected(id));
        true
    }

    /// Kick a client (server side). Unknown ids are a no-op.
    pub fn disconnect_client(&mut self, id: ClientId) -> Result<(), SessionError> {
        if !self.is_server() {
            return Err(SessionError::NotServer);
        }
        if self.cleanup_client(id) && id != ClientId::HOST && id != ClientId::INVALID {
            if let Some(transport) = self.transport.as_mut() {
                transport.disconnect_client(id);
            }
        }
        Ok(())
    }

    /// Reject every pending client whose approval window has elapsed.
    pub(crate) fn sweep_deadlines(&mut self) {
        let timeout = self.config.approval_timeout();
        let now = self.network_time;
        let expired: Vec<ClientId> = self
            .pending
            .values()
            .filter(|p| now.saturating_sub(p.connected_at) >= timeout)
            .map(|p| p.id)
            .collect();
        for id in expired {
            warn!("Client {} approval timed out", id);
            self.reject(id);
        }
    }
}
