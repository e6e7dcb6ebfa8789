//! Spawning Collaborator
//!
//! The session does not own any world state. When object spawning is
//! enabled it asks a [`World`] to create player objects and to list what is
//! spawned, and forwards replication traffic to it on clients.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::message::MessageKind;
use super::transport::ClientId;

/// Network-wide object identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request to instantiate a prefab.
#[derive(Clone, Debug, PartialEq)]
pub struct SpawnRequest {
    /// Index into the configured prefab list.
    pub prefab: u32,
    /// Owning client.
    pub owner: ClientId,
    /// Player object of `owner`.
    pub is_player: bool,
    /// Opaque position payload.
    pub position: [f32; 3],
    /// Opaque Euler rotation payload.
    pub rotation: [f32; 3],
    /// Extra spawn data.
    pub payload: Vec<u8>,
}

/// Snapshot of one spawned object, as sent to joining clients.
#[derive(Clone, Debug, PartialEq)]
pub struct SpawnedObject {
    /// Object id.
    pub id: NetworkId,
    /// Owning client.
    pub owner: ClientId,
    /// Index into the configured prefab list.
    pub prefab: u32,
    /// Player object of `owner`.
    pub is_player: bool,
    /// Active in the world.
    pub active: bool,
    /// Placed in a scene rather than spawned at runtime.
    pub scene_object: bool,
    /// Opaque position payload.
    pub position: [f32; 3],
    /// Opaque Euler rotation payload.
    pub rotation: [f32; 3],
    /// Serialized networked variables.
    pub variables: Vec<u8>,
}

/// World/spawning collaborator.
///
/// Only the two spawning operations are required; replication hooks are
/// no-ops unless a world cares about them.
pub trait World {
    /// Instantiate a prefab and return its id.
    fn create_spawned_object(&mut self, request: SpawnRequest) -> NetworkId;

    /// Every spawned object, in a stable order.
    fn spawned_objects(&self) -> Vec<SpawnedObject>;

    /// Client side: an object announced by the server.
    fn replicate_object(&mut self, _object: &SpawnedObject) {}

    /// Remove everything `owner` owned.
    fn destroy_objects_owned_by(&mut self, _owner: ClientId) {}

    /// Ownership moved.
    fn change_owner(&mut self, _object: NetworkId, _owner: ClientId) {}

    /// Active scene changed.
    fn switch_scene(&mut self, _scene_index: u32) {}

    /// Replication message the session does not interpret itself.
    fn on_replication(&mut self, _sender: ClientId, _kind: MessageKind, _body: &[u8]) {}

    /// Server event tick.
    fn on_event_tick(&mut self, _now: Duration) {}
}

/// World that spawns nothing but still hands out unique ids.
#[derive(Debug, Default)]
pub struct NullWorld {
    next_id: u64,
}

impl World for NullWorld {
    fn create_spawned_object(&mut self, _request: SpawnRequest) -> NetworkId {
        self.next_id += 1;
        NetworkId(self.next_id)
    }

    fn spawned_objects(&self) -> Vec<SpawnedObject> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_world_ids_unique() {
        let mut world = NullWorld::default();
        let request = SpawnRequest {
            prefab: 0,
            owner: ClientId(1),
            is_player: true,
            position: [0.0; 3],
            rotation: [0.0; 3],
            payload: Vec::new(),
        };
        let a = world.create_spawned_object(request.clone());
        let b = world.create_spawned_object(request);
        assert_ne!(a, b);
        assert!(world.spawned_objects().is_empty());
    }
}
