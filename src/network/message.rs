//! Internal Message Set
//!
//! Tags 0..32 are reserved for the session protocol; everything from 32 up
//! belongs to the application. Bodies here are the ones the session itself
//! reads or writes. Replication bodies (destroy, pooled objects, networked
//! variables, RPCs) stay opaque and are forwarded to the world.
//!
//! Optional fields are controlled by configuration flags both peers agree
//! on through the config hash, so they carry no presence bits. The join
//! notice is the exception: its player snapshot may be absent.

use crate::core::bits::{write_header, BitReader, BitWriter, CodecError};

use super::transport::ClientId;
use super::world::{NetworkId, SpawnedObject};

/// First tag available to applications.
pub const CUSTOM_TAG_START: u32 = 32;

/// Internal message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Client asks to be admitted.
    ConnectionRequest = 0,
    /// Server admits a client.
    ConnectionApproved = 1,
    /// A client joined / an object was spawned.
    AddObject = 2,
    /// A client left.
    ClientDisconnect = 3,
    /// An object was destroyed.
    DestroyObject = 4,
    /// Active scene changed.
    SwitchScene = 5,
    /// Pooled object spawned.
    SpawnPoolObject = 6,
    /// Pooled object despawned.
    DestroyPoolObject = 7,
    /// Object ownership moved.
    ChangeOwner = 8,
    /// Several objects spawned at once.
    AddObjects = 9,
    /// Server clock broadcast.
    TimeSync = 10,
    /// Networked variable delta.
    NetworkedVarDelta = 11,
    /// Networked variable full update.
    NetworkedVarUpdate = 12,
    /// Remote call executed on the server.
    ServerRpc = 13,
    /// Remote call executed on clients.
    ClientRpc = 14,
    /// Custom message envelope.
    CustomMessage = 15,
}

/// Which role processes a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receiver {
    /// Server (or host) only.
    Server,
    /// Client (or host) only.
    Client,
    /// Either side.
    Any,
}

impl MessageKind {
    /// Every internal kind, in tag order.
    pub const ALL: [MessageKind; 16] = [
        MessageKind::ConnectionRequest,
        MessageKind::ConnectionApproved,
        MessageKind::AddObject,
        MessageKind::ClientDisconnect,
        MessageKind::DestroyObject,
        MessageKind::SwitchScene,
        MessageKind::SpawnPoolObject,
        MessageKind::DestroyPoolObject,
        MessageKind::ChangeOwner,
        MessageKind::AddObjects,
        MessageKind::TimeSync,
        MessageKind::NetworkedVarDelta,
        MessageKind::NetworkedVarUpdate,
        MessageKind::ServerRpc,
        MessageKind::ClientRpc,
        MessageKind::CustomMessage,
    ];

    /// Wire tag.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Kind for an internal tag, if assigned.
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.get(usize::try_from(tag).ok()?).copied()
    }

    /// Role that processes this kind.
    pub fn receiver(self) -> Receiver {
        match self {
            MessageKind::ConnectionRequest | MessageKind::ServerRpc => Receiver::Server,
            MessageKind::NetworkedVarDelta
            | MessageKind::NetworkedVarUpdate
            | MessageKind::CustomMessage => Receiver::Any,
            _ => Receiver::Client,
        }
    }

    /// Whether a node with the given roles handles this kind.
    pub fn accepted_by(self, is_server: bool, is_client: bool) -> bool {
        match self.receiver() {
            Receiver::Server => is_server,
            Receiver::Client => is_client,
            Receiver::Any => is_server || is_client,
        }
    }
}

/// Start a datagram for `tag`.
pub fn frame(tag: u32) -> BitWriter {
    let mut writer = BitWriter::with_capacity(64);
    write_header(&mut writer, tag);
    writer
}

/// Start a datagram for an internal kind.
pub fn frame_kind(kind: MessageKind) -> BitWriter {
    frame(kind.tag())
}

/// Connection request body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Sender's config fingerprint.
    pub config_hash: u64,
    /// x25519 share, when encryption is on.
    pub public_share: Option<Vec<u8>>,
    /// Approval payload, when approval is on.
    pub payload: Option<Vec<u8>>,
}

impl ConnectionRequest {
    /// Append the body.
    pub fn encode(&self, writer: &mut BitWriter) {
        writer.write_u64(self.config_hash);
        if let Some(share) = &self.public_share {
            writer.write_bytes(share);
        }
        if let Some(payload) = &self.payload {
            writer.write_bytes(payload);
        }
    }

    /// Read only the config hash, so a mismatch can be rejected before the
    /// rest is interpreted.
    pub fn read_hash(reader: &mut BitReader<'_>) -> Result<u64, CodecError> {
        reader.read_u64()
    }

    /// Read the fields after the config hash.
    pub fn read_tail(
        config_hash: u64,
        reader: &mut BitReader<'_>,
        encryption: bool,
        approval: bool,
    ) -> Result<Self, CodecError> {
        let public_share = if encryption {
            Some(reader.read_bytes()?)
        } else {
            None
        };
        // Approval is a server-side choice, so an empty tail means no payload.
        let payload = if approval {
            Some(if reader.remaining_bits() >= 8 {
                reader.read_bytes()?
            } else {
                Vec::new()
            })
        } else {
            None
        };
        Ok(Self {
            config_hash,
            public_share,
            payload,
        })
    }
}

/// Flags that shape the approval body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApprovalLayout {
    /// Scene index present.
    pub scene_switching: bool,
    /// Server share present.
    pub encryption: bool,
    /// Signature present (after the share).
    pub signing: bool,
    /// Object snapshot present.
    pub spawning: bool,
}

/// Connection approved body.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionApproved {
    /// Id the server assigned to the receiver.
    pub client_id: ClientId,
    /// Active scene index.
    pub scene_index: Option<u32>,
    /// Server x25519 share.
    pub server_share: Option<Vec<u8>>,
    /// Signature over the share.
    pub signature: Option<Vec<u8>>,
    /// Server logical time in seconds.
    pub time: f32,
    /// Server transport timestamp.
    pub timestamp: i32,
    /// Other admitted clients.
    pub peers: Vec<ClientId>,
    /// Spawned objects.
    pub objects: Option<Vec<SpawnedObject>>,
}

impl ConnectionApproved {
    /// Append the body.
    pub fn encode(&self, writer: &mut BitWriter) {
        writer.write_var_u32(self.client_id.raw());
        if let Some(index) = self.scene_index {
            writer.write_var_u32(index);
        }
        if let Some(share) = &self.server_share {
            writer.write_bytes(share);
            if let Some(signature) = &self.signature {
                writer.write_bytes(signature);
            }
        }
        writer.write_f32(self.time);
        writer.write_i32(self.timestamp);
        writer.write_var_u32(self.peers.len() as u32);
        for peer in &self.peers {
            writer.write_var_u32(peer.raw());
        }
        if let Some(objects) = &self.objects {
            writer.write_var_u32(objects.len() as u32);
            for object in objects {
                encode_object(writer, object);
            }
        }
    }

    /// Read the body.
    pub fn decode(reader: &mut BitReader<'_>, layout: ApprovalLayout) -> Result<Self, CodecError> {
        let client_id = ClientId(reader.read_var_u32()?);
        let scene_index = if layout.scene_switching {
            Some(reader.read_var_u32()?)
        } else {
            None
        };
        let (server_share, signature) = if layout.encryption {
            let share = reader.read_bytes()?;
            let signature = if layout.signing {
                Some(reader.read_bytes()?)
            } else {
                None
            };
            (Some(share), signature)
        } else {
            (None, None)
        };
        let time = reader.read_f32()?;
        let timestamp = reader.read_i32()?;

        let peer_count = reader.read_var_u32()?;
        let mut peers = Vec::with_capacity(bounded(peer_count, reader));
        for _ in 0..peer_count {
            peers.push(ClientId(reader.read_var_u32()?));
        }

        let objects = if layout.spawning {
            let count = reader.read_var_u32()?;
            let mut objects = Vec::with_capacity(bounded(count, reader));
            for _ in 0..count {
                objects.push(decode_object(reader)?);
            }
            Some(objects)
        } else {
            None
        };

        Ok(Self {
            client_id,
            scene_index,
            server_share,
            signature,
            time,
            timestamp,
            peers,
            objects,
        })
    }
}

/// Capacity hint that a hostile count cannot inflate past the buffer size.
fn bounded(count: u32, reader: &BitReader<'_>) -> usize {
    (count as usize).min(reader.remaining_bits() / 8)
}

/// Write one object snapshot.
pub fn encode_object(writer: &mut BitWriter, object: &SpawnedObject) {
    writer.write_bool(object.is_player);
    writer.write_var_u64(object.id.0);
    writer.write_var_u32(object.owner.raw());
    writer.write_var_u32(object.prefab);
    writer.write_bool(object.active);
    writer.write_bool(object.scene_object);
    for v in object.position.iter().chain(object.rotation.iter()) {
        writer.write_f32(*v);
    }
    writer.write_bytes(&object.variables);
}

/// Read one object snapshot.
pub fn decode_object(reader: &mut BitReader<'_>) -> Result<SpawnedObject, CodecError> {
    let is_player = reader.read_bool()?;
    let id = NetworkId(reader.read_var_u64()?);
    let owner = ClientId(reader.read_var_u32()?);
    let prefab = reader.read_var_u32()?;
    let active = reader.read_bool()?;
    let scene_object = reader.read_bool()?;
    let mut position = [0.0f32; 3];
    for v in position.iter_mut() {
        *v = reader.read_f32()?;
    }
    let mut rotation = [0.0f32; 3];
    for v in rotation.iter_mut() {
        *v = reader.read_f32()?;
    }
    let variables = reader.read_bytes()?;
    Ok(SpawnedObject {
        id,
        owner,
        prefab,
        is_player,
        active,
        scene_object,
        position,
        rotation,
        variables,
    })
}

/// "Client joined" notification.
#[derive(Clone, Debug, PartialEq)]
pub enum AddObject {
    /// Spawning off: only the id.
    Joined(ClientId),
    /// Spawning on: the new player object.
    Spawned(SpawnedObject),
}

impl AddObject {
    /// Client this notification introduces.
    pub fn client(&self) -> ClientId {
        match self {
            AddObject::Joined(id) => *id,
            AddObject::Spawned(object) => object.owner,
        }
    }

    /// Append the body.
    ///
    /// With spawning on, a leading bit says whether a snapshot follows, since
    /// a client admitted without a player prefab has no object to describe.
    pub fn encode(&self, writer: &mut BitWriter, spawning: bool) {
        match self {
            AddObject::Spawned(object) if spawning => {
                writer.write_bool(true);
                encode_object(writer, object);
            }
            _ => {
                if spawning {
                    writer.write_bool(false);
                }
                writer.write_var_u32(self.client().raw());
            }
        }
    }

    /// Read the body.
    pub fn decode(reader: &mut BitReader<'_>, spawning: bool) -> Result<Self, CodecError> {
        if spawning && reader.read_bool()? {
            Ok(AddObject::Spawned(decode_object(reader)?))
        } else {
            Ok(AddObject::Joined(ClientId(reader.read_var_u32()?)))
        }
    }
}

/// Write a single client id body (ClientDisconnect).
pub fn encode_client(writer: &mut BitWriter, id: ClientId) {
    writer.write_var_u32(id.raw());
}

/// Read a single client id body.
pub fn decode_client(reader: &mut BitReader<'_>) -> Result<ClientId, CodecError> {
    Ok(ClientId(reader.read_var_u32()?))
}

/// Time sync body.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeSync {
    /// Server logical time in seconds.
    pub time: f32,
    /// Server transport timestamp.
    pub timestamp: i32,
}

impl TimeSync {
    /// Append the body.
    pub fn encode(&self, writer: &mut BitWriter) {
        writer.write_f32(self.time);
        writer.write_i32(self.timestamp);
    }

    /// Read the body.
    pub fn decode(reader: &mut BitReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            time: reader.read_f32()?,
            timestamp: reader.read_i32()?,
        })
    }
}

/// Ownership change body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeOwner {
    /// Object.
    pub object: NetworkId,
    /// New owner.
    pub owner: ClientId,
}

impl ChangeOwner {
    /// Append the body.
    pub fn encode(&self, writer: &mut BitWriter) {
        writer.write_var_u64(self.object.0);
        writer.write_var_u32(self.owner.raw());
    }

    /// Read the body.
    pub fn decode(reader: &mut BitReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            object: NetworkId(reader.read_var_u64()?),
            owner: ClientId(reader.read_var_u32()?),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bits::read_header;

    fn sample_object() -> SpawnedObject {
        SpawnedObject {
            id: NetworkId(300),
            owner: ClientId(4),
            prefab: 2,
            is_player: true,
            active: true,
            scene_object: false,
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 90.0, 0.0],
            variables: vec![9, 8, 7],
        }
    }

    #[test]
    fn test_tags_are_dense_and_ordered() {
        for (i, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.tag() as usize, i);
            assert_eq!(MessageKind::from_tag(i as u32), Some(*kind));
        }
        assert_eq!(MessageKind::from_tag(16), None);
        assert_eq!(MessageKind::from_tag(CUSTOM_TAG_START), None);
    }

    #[test]
    fn test_role_table() {
        assert!(MessageKind::ConnectionRequest.accepted_by(true, false));
        assert!(!MessageKind::ConnectionRequest.accepted_by(false, true));
        assert!(MessageKind::ConnectionApproved.accepted_by(false, true));
        assert!(!MessageKind::ConnectionApproved.accepted_by(true, false));
        assert!(MessageKind::ServerRpc.accepted_by(true, false));
        assert!(MessageKind::ClientRpc.accepted_by(false, true));
        for kind in [
            MessageKind::NetworkedVarDelta,
            MessageKind::NetworkedVarUpdate,
            MessageKind::CustomMessage,
        ] {
            assert!(kind.accepted_by(true, false));
            assert!(kind.accepted_by(false, true));
        }
        // Host handles everything.
        assert!(MessageKind::ALL.iter().all(|k| k.accepted_by(true, true)));
    }

    #[test]
    fn test_frame_header_then_body() {
        let mut writer = frame_kind(MessageKind::TimeSync);
        TimeSync { time: 12.5, timestamp: -3 }.encode(&mut writer);
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(read_header(&mut reader).unwrap(), MessageKind::TimeSync.tag());
        let sync = TimeSync::decode(&mut reader).unwrap();
        assert_eq!(sync.time, 12.5);
        assert_eq!(sync.timestamp, -3);
    }

    #[test]
    fn test_request_without_payload_reads_empty() {
        let request = ConnectionRequest {
            config_hash: 77,
            public_share: None,
            payload: None,
        };
        let mut writer = BitWriter::new();
        request.encode(&mut writer);
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        let hash = ConnectionRequest::read_hash(&mut reader).unwrap();
        let parsed = ConnectionRequest::read_tail(hash, &mut reader, false, true).unwrap();
        assert_eq!(parsed.config_hash, 77);
        assert_eq!(parsed.payload, Some(Vec::new()));
    }

    #[test]
    fn test_approval_field_order_with_everything_enabled() {
        let approved = ConnectionApproved {
            client_id: ClientId(5),
            scene_index: Some(1),
            server_share: Some(vec![1; 32]),
            signature: Some(vec![2; 64]),
            time: 3.25,
            timestamp: 1000,
            peers: vec![ClientId(1), ClientId::HOST],
            objects: Some(vec![sample_object()]),
        };
        let layout = ApprovalLayout {
            scene_switching: true,
            encryption: true,
            signing: true,
            spawning: true,
        };
        let mut writer = BitWriter::new();
        approved.encode(&mut writer);
        let bytes = writer.into_bytes();

        // Client id comes first, then the scene index.
        let mut raw = BitReader::new(&bytes);
        assert_eq!(raw.read_var_u32().unwrap(), 5);
        assert_eq!(raw.read_var_u32().unwrap(), 1);

        let parsed = ConnectionApproved::decode(&mut BitReader::new(&bytes), layout).unwrap();
        assert_eq!(parsed, approved);
    }

    #[test]
    fn test_truncated_approval_is_an_error() {
        let approved = ConnectionApproved {
            client_id: ClientId(5),
            scene_index: None,
            server_share: None,
            signature: None,
            time: 0.0,
            timestamp: 0,
            peers: vec![ClientId(1), ClientId(2)],
            objects: None,
        };
        let mut writer = BitWriter::new();
        approved.encode(&mut writer);
        let bytes = writer.into_bytes();
        let cut = &bytes[..bytes.len() - 1];
        assert!(ConnectionApproved::decode(&mut BitReader::new(cut), ApprovalLayout::default()).is_err());
    }

    #[test]
    fn test_add_object_depends_on_spawning() {
        let mut writer = BitWriter::new();
        AddObject::Joined(ClientId(9)).encode(&mut writer, false);
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![9]);
        let parsed = AddObject::decode(&mut BitReader::new(&bytes), false).unwrap();
        assert_eq!(parsed, AddObject::Joined(ClientId(9)));

        let mut writer = BitWriter::new();
        AddObject::Spawned(sample_object()).encode(&mut writer, true);
        let bytes = writer.into_bytes();
        let parsed = AddObject::decode(&mut BitReader::new(&bytes), true).unwrap();
        assert_eq!(parsed, AddObject::Spawned(sample_object()));
    }

    #[test]
    fn test_join_without_object_while_spawning() {
        let mut writer = BitWriter::new();
        AddObject::Joined(ClientId(9)).encode(&mut writer, true);
        let bytes = writer.into_bytes();
        let parsed = AddObject::decode(&mut BitReader::new(&bytes), true).unwrap();
        assert_eq!(parsed, AddObject::Joined(ClientId(9)));
    }
}
