//! Message Dispatch
//!
//! Every inbound datagram passes through [`Session::handle_data`]:
//!
//! ```text
//! header ─► admission boundary ─► tag >= 32 ─► CustomMessageSink
//!                                 tag <  32 ─► role table ─► handler
//! ```
//!
//! The handler table is built once from [`MessageKind::ALL`] through an
//! exhaustive match, so adding a kind without a handler does not compile.

use tracing::{debug, warn};

use crate::core::bits::{read_header, BitReader};

use super::message::{
    decode_client, AddObject, ChangeOwner, MessageKind, TimeSync, CUSTOM_TAG_START,
};
use super::session::{Role, Session, SessionError};
use super::transport::{ChannelId, ClientId};

/// Receiver of application messages (tags >= 32 and custom envelopes).
pub trait CustomMessageSink {
    /// A message arrived from `sender`.
    fn on_message(&mut self, sender: ClientId, tag: u32, body: &[u8]);
}

impl<F> CustomMessageSink for F
where
    F: FnMut(ClientId, u32, &[u8]),
{
    fn on_message(&mut self, sender: ClientId, tag: u32, body: &[u8]) {
        self(sender, tag, body)
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardCustom;

impl CustomMessageSink for DiscardCustom {
    fn on_message(&mut self, sender: ClientId, tag: u32, body: &[u8]) {
        debug!(
            "No custom message sink, dropping tag {} from {} ({} bytes)",
            tag,
            sender,
            body.len()
        );
    }
}

/// Handler for one internal kind.
pub(crate) type Handler = fn(&mut Session, ClientId, &mut BitReader<'_>) -> Result<(), SessionError>;

/// Handlers indexed by tag.
pub(crate) type HandlerTable = [Handler; MessageKind::ALL.len()];

/// Build and check the handler table.
pub(crate) fn handler_table() -> HandlerTable {
    let table = MessageKind::ALL.map(handler_for);
    debug_assert!(MessageKind::ALL
        .iter()
        .enumerate()
        .all(|(i, kind)| kind.tag() as usize == i));
    table
}

fn handler_for(kind: MessageKind) -> Handler {
    match kind {
        MessageKind::ConnectionRequest => Session::on_connection_request,
        MessageKind::ConnectionApproved => Session::on_connection_approved,
        MessageKind::AddObject => Session::on_add_object,
        MessageKind::ClientDisconnect => Session::on_client_disconnect,
        MessageKind::SwitchScene => Session::on_switch_scene,
        MessageKind::ChangeOwner => Session::on_change_owner,
        MessageKind::TimeSync => Session::on_time_sync,
        MessageKind::CustomMessage => Session::on_custom_envelope,
        MessageKind::DestroyObject => Session::on_destroy_object,
        MessageKind::SpawnPoolObject => Session::on_spawn_pool_object,
        MessageKind::DestroyPoolObject => Session::on_destroy_pool_object,
        MessageKind::AddObjects => Session::on_add_objects,
        MessageKind::NetworkedVarDelta => Session::on_var_delta,
        MessageKind::NetworkedVarUpdate => Session::on_var_update,
        MessageKind::ServerRpc => Session::on_server_rpc,
        MessageKind::ClientRpc => Session::on_client_rpc,
    }
}

impl Session {
    /// Route one inbound datagram.
    pub(crate) fn handle_data(&mut self, sender: ClientId, channel: ChannelId, payload: &[u8]) {
        #[cfg(feature = "debug-tracing")]
        tracing::trace!(
            "<- {} [{}] {}",
            sender,
            self.channels.name(channel).unwrap_or("?"),
            hex::encode(payload)
        );
        #[cfg(not(feature = "debug-tracing"))]
        let _ = channel;

        let mut reader = BitReader::new(payload);
        let tag = match read_header(&mut reader) {
            Ok(tag) => tag,
            Err(e) => {
                debug!("Bad header from {}: {}", sender, e);
                self.stats.dropped_malformed += 1;
                return;
            }
        };

        if !self.admits(sender, tag) {
            return;
        }

        if tag >= CUSTOM_TAG_START {
            self.custom.on_message(sender, tag, reader.rest());
            return;
        }

        let Some(kind) = MessageKind::from_tag(tag) else {
            debug!("Unassigned internal tag {} from {}", tag, sender);
            self.stats.dropped_unknown += 1;
            return;
        };

        if !kind.accepted_by(self.is_server(), self.is_client()) {
            debug!("{:?} from {} not handled by this role", kind, sender);
            self.stats.dropped_wrong_role += 1;
            return;
        }

        let handler = self.handlers[kind.tag() as usize];
        if let Err(e) = handler(self, sender, &mut reader) {
            warn!("Dropping {:?} from {}: {}", kind, sender, e);
            self.stats.dropped_malformed += 1;
        }
    }

    /// Admission boundary: pending ids may only send a connection request,
    /// unknown ids nothing at all.
    fn admits(&mut self, sender: ClientId, tag: u32) -> bool {
        if self.is_server() {
            if self.pending.contains_key(&sender) {
                if tag == MessageKind::ConnectionRequest.tag() {
                    return true;
                }
                warn!("Dropping tag {} from pending client {}", tag, sender);
                self.stats.dropped_unadmitted += 1;
                return false;
            }
            if self.clients.contains_key(&sender) {
                return true;
            }
        }
        if self.role == Some(Role::Client) {
            let server = self
                .transport
                .as_ref()
                .map(|t| t.server_client_id())
                .unwrap_or(ClientId::SERVER);
            if sender == server {
                return true;
            }
        }
        debug!("Dropping tag {} from unknown sender {}", tag, sender);
        self.stats.dropped_unknown += 1;
        false
    }

    // -------------------------------------------------------------------------
    // Client-side session messages
    // -------------------------------------------------------------------------

    fn on_add_object(&mut self, _sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        let message = AddObject::decode(reader, self.config.handle_object_spawning)?;
        let joined = message.client();
        if joined != self.local_id {
            self.peers.insert(joined);
        }
        if let AddObject::Spawned(object) = &message {
            if !self.is_server() {
                self.world.replicate_object(object);
            }
        }
        debug!("Client {} joined", joined);
        Ok(())
    }

    fn on_client_disconnect(
        &mut self,
        _sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<(), SessionError> {
        let departed = decode_client(reader)?;
        self.peers.remove(&departed);
        if !self.is_server() && self.config.handle_object_spawning {
            self.world.destroy_objects_owned_by(departed);
        }
        debug!("Client {} left", departed);
        Ok(())
    }

    fn on_switch_scene(&mut self, _sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        let index = reader.read_var_u32()?;
        self.current_scene = Some(index);
        if !self.is_server() {
            self.world.switch_scene(index);
        }
        Ok(())
    }

    fn on_change_owner(&mut self, _sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        let change = ChangeOwner::decode(reader)?;
        if !self.is_server() {
            self.world.change_owner(change.object, change.owner);
        }
        Ok(())
    }

    fn on_time_sync(&mut self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        let sync = TimeSync::decode(reader)?;
        if self.is_server() {
            return Ok(());
        }
        let delay = self
            .transport
            .as_ref()
            .map(|t| t.remote_delay(sender, sync.timestamp))
            .unwrap_or_default();
        let time = std::time::Duration::try_from_secs_f32(sync.time).unwrap_or_default() + delay;
        self.network_time = time;
        self.pump.rebase(time);
        debug!("Time synced to {:?}", time);
        Ok(())
    }

    fn on_custom_envelope(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<(), SessionError> {
        self.custom
            .on_message(sender, MessageKind::CustomMessage.tag(), reader.rest());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Replication traffic, forwarded to the world
    // -------------------------------------------------------------------------

    fn forward(&mut self, kind: MessageKind, sender: ClientId, reader: &BitReader<'_>) {
        self.world.on_replication(sender, kind, reader.rest());
    }

    fn on_destroy_object(&mut self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        self.forward(MessageKind::DestroyObject, sender, reader);
        Ok(())
    }

    fn on_spawn_pool_object(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<(), SessionError> {
        self.forward(MessageKind::SpawnPoolObject, sender, reader);
        Ok(())
    }

    fn on_destroy_pool_object(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<(), SessionError> {
        self.forward(MessageKind::DestroyPoolObject, sender, reader);
        Ok(())
    }

    fn on_add_objects(&mut self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        self.forward(MessageKind::AddObjects, sender, reader);
        Ok(())
    }

    fn on_var_delta(&mut self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        self.forward(MessageKind::NetworkedVarDelta, sender, reader);
        Ok(())
    }

    fn on_var_update(&mut self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        self.forward(MessageKind::NetworkedVarUpdate, sender, reader);
        Ok(())
    }

    fn on_server_rpc(&mut self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        self.forward(MessageKind::ServerRpc, sender, reader);
        Ok(())
    }

    fn on_client_rpc(&mut self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<(), SessionError> {
        self.forward(MessageKind::ClientRpc, sender, reader);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::core::bits::BitWriter;
    use crate::network::config::{NetworkConfig, TransportKind};
    use crate::network::loopback::LoopbackHub;
    use crate::network::message::{frame, frame_kind};
    use crate::network::session::PendingClient;
    use crate::network::session::{PendingStage, RemoteClient};
    use crate::network::world::{NullWorld, SpawnedObject, World};

    #[derive(Default)]
    struct Recorded {
        replication: Vec<(ClientId, MessageKind, Vec<u8>)>,
    }

    struct RecordingWorld(Rc<RefCell<Recorded>>);

    impl World for RecordingWorld {
        fn create_spawned_object(&mut self, request: crate::network::world::SpawnRequest) -> crate::network::world::NetworkId {
            NullWorld::default().create_spawned_object(request)
        }

        fn spawned_objects(&self) -> Vec<SpawnedObject> {
            Vec::new()
        }

        fn on_replication(&mut self, sender: ClientId, kind: MessageKind, body: &[u8]) {
            self.0.borrow_mut().replication.push((sender, kind, body.to_vec()));
        }
    }

    fn server_session(world: Rc<RefCell<Recorded>>, custom: Rc<RefCell<Vec<(ClientId, u32, Vec<u8>)>>>) -> Session {
        let hub = LoopbackHub::new();
        let config = NetworkConfig {
            transport: TransportKind::Custom,
            ..Default::default()
        };
        let mut session = Session::new(config)
            .with_transport(hub.endpoint())
            .with_world(RecordingWorld(world))
            .with_custom_messages(move |sender: ClientId, tag: u32, body: &[u8]| {
                custom.borrow_mut().push((sender, tag, body.to_vec()));
            });
        session.start_server().unwrap();
        session
    }

    fn datagram(tag: u32, body: &[u8]) -> Vec<u8> {
        let mut writer = frame(tag);
        writer.write_raw(body);
        writer.into_bytes()
    }

    #[test]
    fn test_handler_table_complete() {
        let table = handler_table();
        assert_eq!(table.len(), MessageKind::ALL.len());
    }

    #[test]
    fn test_pending_sender_only_reaches_request_handler() {
        let world = Rc::new(RefCell::new(Recorded::default()));
        let custom = Rc::new(RefCell::new(Vec::new()));
        let mut session = server_session(world.clone(), custom.clone());

        let id = ClientId(7);
        session.pending.insert(
            id,
            PendingClient {
                id,
                connected_at: session.network_time,
                stage: PendingStage::AwaitingRequest,
                public_share: None,
                payload: Vec::new(),
            },
        );

        session.handle_data(id, 0, &datagram(MessageKind::ServerRpc.tag(), b"rpc"));
        session.handle_data(id, 0, &datagram(40, b"custom"));

        assert!(world.borrow().replication.is_empty());
        assert!(custom.borrow().is_empty());
        assert_eq!(session.stats().dropped_unadmitted, 2);
    }

    #[test]
    fn test_admitted_sender_routed_by_role() {
        let world = Rc::new(RefCell::new(Recorded::default()));
        let custom = Rc::new(RefCell::new(Vec::new()));
        let mut session = server_session(world.clone(), custom.clone());

        let id = ClientId(3);
        session.clients.insert(id, RemoteClient::new(id));

        session.handle_data(id, 0, &datagram(MessageKind::ServerRpc.tag(), b"rpc"));
        // Client-only kind on a pure server.
        session.handle_data(id, 0, &datagram(MessageKind::ClientRpc.tag(), b"nope"));
        session.handle_data(id, 0, &datagram(33, b"hello"));

        let envelope = {
            let mut writer = frame_kind(MessageKind::CustomMessage);
            writer.write_raw(b"env");
            writer.into_bytes()
        };
        session.handle_data(id, 0, &envelope);

        assert_eq!(
            world.borrow().replication,
            vec![(id, MessageKind::ServerRpc, b"rpc".to_vec())]
        );
        assert_eq!(
            *custom.borrow(),
            vec![
                (id, 33, b"hello".to_vec()),
                (id, MessageKind::CustomMessage.tag(), b"env".to_vec()),
            ]
        );
        assert_eq!(session.stats().dropped_wrong_role, 1);
    }

    #[test]
    fn test_unknown_sender_and_tag_dropped() {
        let world = Rc::new(RefCell::new(Recorded::default()));
        let custom = Rc::new(RefCell::new(Vec::new()));
        let mut session = server_session(world, custom.clone());

        session.handle_data(ClientId(99), 0, &datagram(40, b"x"));
        let id = ClientId(3);
        session.clients.insert(id, RemoteClient::new(id));
        session.handle_data(id, 0, &datagram(20, b""));
        session.handle_data(id, 0, &[]);

        assert!(custom.borrow().is_empty());
        assert_eq!(session.stats().dropped_unknown, 2);
        assert_eq!(session.stats().dropped_malformed, 1);
    }

    #[test]
    fn test_truncated_body_counted_as_malformed() {
        let world = Rc::new(RefCell::new(Recorded::default()));
        let custom = Rc::new(RefCell::new(Vec::new()));
        let mut session = server_session(world, custom);

        let id = ClientId(4);
        session.pending.insert(
            id,
            PendingClient {
                id,
                connected_at: session.network_time,
                stage: PendingStage::AwaitingRequest,
                public_share: None,
                payload: Vec::new(),
            },
        );
        // Request header with a 2-byte body instead of a u64 hash.
        let mut writer = frame_kind(MessageKind::ConnectionRequest);
        writer.write_u16(1);
        session.handle_data(id, 0, &BitWriter::into_bytes(writer));

        assert_eq!(session.stats().dropped_malformed, 1);
        assert!(session.pending_client(id).is_some());
    }
}
