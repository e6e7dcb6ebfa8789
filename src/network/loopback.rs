//! In-Memory Loopback Transport
//!
//! Connects any number of endpoints inside one process. Datagrams are
//! delivered to the peer's inbox when the sender flushes its queue, so a
//! test can pump several sessions step by step and observe exact ordering.
//!
//! The hub is single-threaded (`Rc<RefCell<_>>`), matching the session's
//! execution model.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::transport::{
    stamp_delay, ChannelId, ChannelKind, ClientId, NetEvent, Transport, TransportError,
};

/// Queued datagram: channel + bytes.
type Queued = (ChannelId, Vec<u8>);

/// One side of a link: peer endpoint index and the id the peer knows us by.
#[derive(Debug, Clone, Copy)]
struct Link {
    peer: usize,
    remote_view: ClientId,
}

#[derive(Debug, Default)]
struct EndpointState {
    inbox: VecDeque<NetEvent>,
    outbox: BTreeMap<ClientId, Vec<Queued>>,
    links: BTreeMap<ClientId, Link>,
    channels: Vec<ChannelKind>,
    disconnect_calls: Vec<ClientId>,
}

#[derive(Debug)]
struct HubState {
    endpoints: Vec<EndpointState>,
    listener: Option<usize>,
    next_client: u32,
    epoch: Instant,
}

impl HubState {
    fn unlink(&mut self, endpoint: usize, client: ClientId) -> bool {
        let Some(link) = self.endpoints[endpoint].links.remove(&client) else {
            return false;
        };
        self.endpoints[endpoint].outbox.remove(&client);

        let peer = &mut self.endpoints[link.peer];
        peer.links.remove(&link.remote_view);
        peer.outbox.remove(&link.remote_view);
        peer.inbox.push_back(NetEvent::Disconnect {
            client: link.remote_view,
        });
        true
    }
}

/// Shared in-memory network.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(HubState {
                endpoints: Vec::new(),
                listener: None,
                next_client: 1,
                epoch: Instant::now(),
            })),
        }
    }

    /// Attach a new endpoint to the hub.
    pub fn endpoint(&self) -> LoopbackTransport {
        let mut state = self.state.borrow_mut();
        state.endpoints.push(EndpointState::default());
        LoopbackTransport {
            state: self.state.clone(),
            index: state.endpoints.len() - 1,
        }
    }
}

/// Transport endpoint attached to a [`LoopbackHub`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    state: Rc<RefCell<HubState>>,
    index: usize,
}

impl LoopbackTransport {
    /// Every id passed to `disconnect_client` / `disconnect_from_server`.
    pub fn disconnect_calls(&self) -> Vec<ClientId> {
        self.state.borrow().endpoints[self.index].disconnect_calls.clone()
    }

    /// Ids this endpoint currently has a live link to.
    pub fn linked(&self) -> Vec<ClientId> {
        self.state.borrow().endpoints[self.index]
            .links
            .keys()
            .copied()
            .collect()
    }

    /// Events waiting in the inbox.
    pub fn pending_events(&self) -> usize {
        self.state.borrow().endpoints[self.index].inbox.len()
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self, address: &str, port: u16) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let server = state
            .listener
            .ok_or_else(|| TransportError::Backend(format!("nothing listening on {address}:{port}")))?;

        let client_id = ClientId(state.next_client);
        state.next_client += 1;

        let me = self.index;
        state.endpoints[me].links.insert(
            ClientId::SERVER,
            Link {
                peer: server,
                remote_view: client_id,
            },
        );
        state.endpoints[server].links.insert(
            client_id,
            Link {
                peer: me,
                remote_view: ClientId::SERVER,
            },
        );
        state.endpoints[me].inbox.push_back(NetEvent::Connect {
            client: ClientId::SERVER,
        });
        state.endpoints[server].inbox.push_back(NetEvent::Connect { client: client_id });

        debug!("Loopback endpoint {} linked as client {}", me, client_id);
        Ok(())
    }

    fn register_server_listen_socket(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if let Some(existing) = state.listener {
            if existing != self.index {
                return Err(TransportError::Backend("hub already has a listener".into()));
            }
        }
        state.listener = Some(self.index);
        Ok(())
    }

    fn add_channel(&mut self, kind: ChannelKind) -> Result<ChannelId, TransportError> {
        let mut state = self.state.borrow_mut();
        let channels = &mut state.endpoints[self.index].channels;
        let id = ChannelId::try_from(channels.len()).map_err(|_| TransportError::ChannelLimit)?;
        channels.push(kind);
        Ok(id)
    }

    fn poll_receive(&mut self) -> Result<NetEvent, TransportError> {
        let mut state = self.state.borrow_mut();
        Ok(state.endpoints[self.index]
            .inbox
            .pop_front()
            .unwrap_or(NetEvent::Nothing))
    }

    fn queue_message(
        &mut self,
        client: ClientId,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let endpoint = &mut state.endpoints[self.index];
        if usize::from(channel) >= endpoint.channels.len() {
            return Err(TransportError::UnknownChannel(channel));
        }
        if !endpoint.links.contains_key(&client) {
            return Err(TransportError::UnknownEndpoint(client));
        }
        endpoint
            .outbox
            .entry(client)
            .or_default()
            .push((channel, payload.to_vec()));
        Ok(())
    }

    fn send_queue(&mut self, client: ClientId) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let endpoint = &mut state.endpoints[self.index];
        let link = *endpoint
            .links
            .get(&client)
            .ok_or(TransportError::UnknownEndpoint(client))?;
        let queued = endpoint.outbox.remove(&client).unwrap_or_default();

        let peer = &mut state.endpoints[link.peer];
        for (channel, payload) in queued {
            peer.inbox.push_back(NetEvent::Data {
                client: link.remote_view,
                channel,
                payload,
            });
        }
        Ok(())
    }

    fn disconnect_client(&mut self, client: ClientId) {
        let mut state = self.state.borrow_mut();
        state.endpoints[self.index].disconnect_calls.push(client);
        state.unlink(self.index, client);
    }

    fn disconnect_from_server(&mut self) {
        let mut state = self.state.borrow_mut();
        state.endpoints[self.index]
            .disconnect_calls
            .push(ClientId::SERVER);
        state.unlink(self.index, ClientId::SERVER);
    }

    fn shutdown(&mut self) {
        let mut state = self.state.borrow_mut();
        let linked: Vec<ClientId> = state.endpoints[self.index].links.keys().copied().collect();
        for client in linked {
            state.unlink(self.index, client);
        }
        if state.listener == Some(self.index) {
            state.listener = None;
        }
        let endpoint = &mut state.endpoints[self.index];
        endpoint.inbox.clear();
        endpoint.outbox.clear();
        endpoint.channels.clear();
    }

    fn network_timestamp(&self) -> i32 {
        let elapsed = self.state.borrow().epoch.elapsed();
        (elapsed.as_millis() % i32::MAX as u128) as i32
    }

    fn remote_delay(&self, _client: ClientId, remote_timestamp: i32) -> Duration {
        stamp_delay(self.network_timestamp(), remote_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_pair() -> (LoopbackTransport, LoopbackTransport, ClientId) {
        let hub = LoopbackHub::new();
        let mut server = hub.endpoint();
        let mut client = hub.endpoint();
        server.register_server_listen_socket().unwrap();
        server.add_channel(ChannelKind::Reliable).unwrap();
        client.add_channel(ChannelKind::Reliable).unwrap();
        client.connect("127.0.0.1", 7777).unwrap();

        let id = match server.poll_receive().unwrap() {
            NetEvent::Connect { client } => client,
            other => panic!("expected connect, got {:?}", other),
        };
        assert_eq!(
            client.poll_receive().unwrap(),
            NetEvent::Connect { client: ClientId::SERVER }
        );
        (server, client, id)
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let hub = LoopbackHub::new();
        let mut client = hub.endpoint();
        assert!(client.connect("127.0.0.1", 1).is_err());
    }

    #[test]
    fn test_datagrams_held_until_flush() {
        let (mut server, mut client, id) = linked_pair();

        client.queue_message(ClientId::SERVER, 0, b"one").unwrap();
        client.queue_message(ClientId::SERVER, 0, b"two").unwrap();
        assert_eq!(server.poll_receive().unwrap(), NetEvent::Nothing);

        client.send_queue(ClientId::SERVER).unwrap();
        assert_eq!(
            server.poll_receive().unwrap(),
            NetEvent::Data { client: id, channel: 0, payload: b"one".to_vec() }
        );
        assert_eq!(
            server.poll_receive().unwrap(),
            NetEvent::Data { client: id, channel: 0, payload: b"two".to_vec() }
        );
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let (_server, mut client, _) = linked_pair();
        assert!(matches!(
            client.queue_message(ClientId::SERVER, 9, b"x"),
            Err(TransportError::UnknownChannel(9))
        ));
    }

    #[test]
    fn test_disconnect_client_notifies_peer_and_records_call() {
        let (mut server, mut client, id) = linked_pair();

        server.disconnect_client(id);
        assert_eq!(server.disconnect_calls(), vec![id]);
        assert!(server.linked().is_empty());
        assert_eq!(
            client.poll_receive().unwrap(),
            NetEvent::Disconnect { client: ClientId::SERVER }
        );
        // No event for the side that initiated it.
        assert_eq!(server.poll_receive().unwrap(), NetEvent::Nothing);
    }

    #[test]
    fn test_disconnect_from_server() {
        let (mut server, mut client, id) = linked_pair();
        client.disconnect_from_server();
        assert_eq!(server.poll_receive().unwrap(), NetEvent::Disconnect { client: id });
        assert!(client.send_queue(ClientId::SERVER).is_err());
    }
}
