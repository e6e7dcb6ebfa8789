//! Channel Registry
//!
//! Maps symbolic channel names to transport channel ids. Built-in channels
//! are registered first, then user channels, each group sorted by name, so
//! the same configuration always yields the same id table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::transport::{ChannelId, ChannelKind, Transport, TransportError};

/// Handshake and session-control traffic.
pub const INTERNAL_CHANNEL: &str = "NETSYNC_INTERNAL";
/// Default channel for replication and custom messages.
pub const DEFAULT_MESSAGE_CHANNEL: &str = "NETSYNC_DEFAULT_MESSAGE";
/// Transform updates.
pub const POSITION_UPDATE_CHANNEL: &str = "NETSYNC_POSITION_UPDATE";
/// Animation state.
pub const ANIMATION_UPDATE_CHANNEL: &str = "NETSYNC_ANIMATION_UPDATE";
/// Navigation agent state.
pub const NAV_AGENT_STATE_CHANNEL: &str = "NETSYNC_NAV_AGENT_STATE";
/// Navigation agent corrections.
pub const NAV_AGENT_CORRECTION_CHANNEL: &str = "NETSYNC_NAV_AGENT_CORRECTION";
/// Periodic time sync.
pub const TIME_SYNC_CHANNEL: &str = "NETSYNC_TIME_SYNC";

/// A channel as declared in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel name.
    pub name: String,
    /// Delivery guarantee.
    pub kind: ChannelKind,
}

impl ChannelConfig {
    /// Build a channel declaration.
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A registered channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    /// Unique channel name.
    pub name: String,
    /// Delivery guarantee.
    pub kind: ChannelKind,
    /// Transport-assigned id.
    pub id: ChannelId,
}

/// Built-in channels, sorted by name.
pub fn builtin_channels(internal_kind: ChannelKind) -> Vec<ChannelConfig> {
    let mut channels = vec![
        ChannelConfig::new(INTERNAL_CHANNEL, internal_kind),
        ChannelConfig::new(DEFAULT_MESSAGE_CHANNEL, ChannelKind::Reliable),
        ChannelConfig::new(POSITION_UPDATE_CHANNEL, ChannelKind::StateUpdate),
        ChannelConfig::new(ANIMATION_UPDATE_CHANNEL, ChannelKind::ReliableSequenced),
        ChannelConfig::new(NAV_AGENT_STATE_CHANNEL, ChannelKind::ReliableSequenced),
        ChannelConfig::new(NAV_AGENT_CORRECTION_CHANNEL, ChannelKind::StateUpdate),
        ChannelConfig::new(TIME_SYNC_CHANNEL, ChannelKind::Unreliable),
    ];
    channels.sort_by(|a, b| a.name.cmp(&b.name));
    channels
}

/// Registration order for a configuration: built-ins, then sorted user
/// channels with duplicates dropped.
pub fn registration_order(internal_kind: ChannelKind, user: &[ChannelConfig]) -> Vec<ChannelConfig> {
    let mut ordered = builtin_channels(internal_kind);

    let mut extra: Vec<&ChannelConfig> = user.iter().collect();
    extra.sort_by(|a, b| a.name.cmp(&b.name));

    for channel in extra {
        if ordered.iter().any(|c| c.name == channel.name) {
            warn!("Duplicate channel name '{}', skipping", channel.name);
            continue;
        }
        ordered.push(channel.clone());
    }
    ordered
}

/// Name ↔ id lookup for the running session.
#[derive(Debug, Default, Clone)]
pub struct ChannelRegistry {
    by_name: BTreeMap<String, Channel>,
    by_id: BTreeMap<ChannelId, String>,
}

impl ChannelRegistry {
    /// Register every channel with the transport, in deterministic order.
    pub fn register<T: Transport + ?Sized>(
        transport: &mut T,
        user: &[ChannelConfig],
    ) -> Result<Self, TransportError> {
        let mut registry = Self::default();
        for config in registration_order(transport.internal_channel_kind(), user) {
            let id = transport.add_channel(config.kind)?;
            debug!("Channel {} -> {} ({:?})", config.name, id, config.kind);
            registry.by_id.insert(id, config.name.clone());
            registry.by_name.insert(
                config.name.clone(),
                Channel {
                    name: config.name,
                    kind: config.kind,
                    id,
                },
            );
        }
        Ok(registry)
    }

    /// Id of a named channel.
    pub fn id(&self, name: &str) -> Option<ChannelId> {
        self.by_name.get(name).map(|c| c.id)
    }

    /// Full record of a named channel.
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.by_name.get(name)
    }

    /// Name registered under `id`.
    pub fn name(&self, id: ChannelId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Snapshot of the name → id table.
    pub fn table(&self) -> BTreeMap<String, ChannelId> {
        self.by_name
            .iter()
            .map(|(name, channel)| (name.clone(), channel.id))
            .collect()
    }

    /// Forget every channel.
    pub fn clear(&mut self) {
        self.by_name.clear();
        self.by_id.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
