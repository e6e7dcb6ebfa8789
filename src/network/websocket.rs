//! WebSocket Transport
//!
//! Default [`Transport`] backend. Socket work runs on a tokio runtime; each
//! link is one task that forwards binary frames in both directions. The
//! session side never awaits: link tasks report into an unbounded queue that
//! [`Transport::poll_receive`] drains with `try_recv`.
//!
//! Wire frame: one channel byte followed by the datagram.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::transport::{
    stamp_delay, ChannelId, ChannelKind, ClientId, NetEvent, Transport, TransportError,
};

/// Report from a link task.
#[derive(Debug)]
enum LinkEvent {
    Opened {
        id: ClientId,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    },
    Frame {
        id: ClientId,
        data: Vec<u8>,
    },
    Closed {
        id: ClientId,
    },
}

/// WebSocket backend.
pub struct WebSocketTransport {
    runtime: Handle,
    bind_address: String,
    port: u16,
    local_addr: Option<SocketAddr>,
    channels: Vec<ChannelKind>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown_tx: broadcast::Sender<()>,
    links: BTreeMap<ClientId, mpsc::UnboundedSender<Vec<u8>>>,
    outgoing: BTreeMap<ClientId, Vec<Vec<u8>>>,
    /// Links closed from this side; their `Closed` report is swallowed.
    closed: BTreeSet<ClientId>,
    next_id: Arc<AtomicU32>,
}

impl WebSocketTransport {
    /// Transport bound to `bind_address:port` when listening, running its
    /// socket tasks on `runtime`.
    pub fn new(runtime: Handle, bind_address: impl Into<String>, port: u16) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            runtime,
            bind_address: bind_address.into(),
            port,
            local_addr: None,
            channels: Vec::new(),
            events_tx,
            events_rx,
            shutdown_tx,
            links: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            closed: BTreeSet::new(),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of open links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    fn close_link(&mut self, id: ClientId) {
        self.outgoing.remove(&id);
        // Dropping the outbound sender ends the link task.
        if self.links.remove(&id).is_some() {
            self.closed.insert(id);
            debug!("Closed link {}", id);
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("local_addr", &self.local_addr)
            .field("channels", &self.channels.len())
            .field("links", &self.links.len())
            .finish()
    }
}

impl Transport for WebSocketTransport {
    fn connect(&mut self, address: &str, port: u16) -> Result<(), TransportError> {
        let url = format!("ws://{}:{}", address, port);
        let events = self.events_tx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let id = self.server_client_id();
        self.closed.remove(&id);

        info!("Connecting to {}", url);
        self.runtime.spawn(async move {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => run_link(id, ws, events, shutdown).await,
                Err(e) => {
                    error!("WebSocket connect to {} failed: {}", url, e);
                    let _ = events.send(LinkEvent::Closed { id });
                }
            }
        });
        Ok(())
    }

    fn register_server_listen_socket(&mut self) -> Result<(), TransportError> {
        let std_listener = std::net::TcpListener::bind((self.bind_address.as_str(), self.port))?;
        std_listener.set_nonblocking(true)?;
        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!("WebSocket transport listening on {}", local_addr);

        let events = self.events_tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let next_id = self.next_id.clone();
        self.runtime.spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let id = ClientId(next_id.fetch_add(1, Ordering::Relaxed));
                                debug!("New connection from {} as {}", addr, id);
                                let events = events.clone();
                                let shutdown = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    match accept_async(stream).await {
                                        Ok(ws) => run_link(id, ws, events, shutdown).await,
                                        Err(e) => {
                                            error!("WebSocket handshake failed for {}: {}", addr, e);
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Listener on {} stopped", local_addr);
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    fn add_channel(&mut self, kind: ChannelKind) -> Result<ChannelId, TransportError> {
        let id = ChannelId::try_from(self.channels.len()).map_err(|_| TransportError::ChannelLimit)?;
        self.channels.push(kind);
        Ok(id)
    }

    fn poll_receive(&mut self) -> Result<NetEvent, TransportError> {
        loop {
            let event = match self.events_rx.try_recv() {
                Ok(event) => event,
                Err(_) => return Ok(NetEvent::Nothing),
            };

            match event {
                LinkEvent::Opened { id, outbound } => {
                    self.closed.remove(&id);
                    self.links.insert(id, outbound);
                    return Ok(NetEvent::Connect { client: id });
                }
                LinkEvent::Frame { id, data } => {
                    if !self.links.contains_key(&id) {
                        continue;
                    }
                    let Some((&channel, payload)) = data.split_first() else {
                        warn!("Empty frame from {}", id);
                        continue;
                    };
                    if usize::from(channel) >= self.channels.len() {
                        warn!("Frame from {} on unregistered channel {}", id, channel);
                        continue;
                    }
                    return Ok(NetEvent::Data {
                        client: id,
                        channel,
                        payload: payload.to_vec(),
                    });
                }
                LinkEvent::Closed { id } => {
                    if self.closed.remove(&id) {
                        continue;
                    }
                    self.links.remove(&id);
                    self.outgoing.remove(&id);
                    return Ok(NetEvent::Disconnect { client: id });
                }
            }
        }
    }

    fn queue_message(
        &mut self,
        client: ClientId,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if usize::from(channel) >= self.channels.len() {
            return Err(TransportError::UnknownChannel(channel));
        }
        if !self.links.contains_key(&client) {
            return Err(TransportError::UnknownEndpoint(client));
        }
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(channel);
        frame.extend_from_slice(payload);
        self.outgoing.entry(client).or_default().push(frame);
        Ok(())
    }

    fn send_queue(&mut self, client: ClientId) -> Result<(), TransportError> {
        let Some(frames) = self.outgoing.remove(&client) else {
            return Ok(());
        };
        let Some(link) = self.links.get(&client) else {
            return Err(TransportError::UnknownEndpoint(client));
        };
        for frame in frames {
            link.send(frame)
                .map_err(|_| TransportError::Backend(format!("link {} is closed", client)))?;
        }
        Ok(())
    }

    fn disconnect_client(&mut self, client: ClientId) {
        self.close_link(client);
    }

    fn disconnect_from_server(&mut self) {
        let server = self.server_client_id();
        self.close_link(server);
    }

    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.links.clear();
        self.outgoing.clear();
        self.closed.clear();
        self.local_addr = None;
        self.channels.clear();

        // Reports from tasks that are still winding down go nowhere.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = events_tx;
        self.events_rx = events_rx;
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = shutdown_tx;
        info!("WebSocket transport shut down");
    }

    fn network_timestamp(&self) -> i32 {
        // Wall clock milliseconds, wrapped into the 32-bit stamp.
        Utc::now().timestamp_millis() as i32
    }

    fn remote_delay(&self, _client: ClientId, remote_timestamp: i32) -> Duration {
        stamp_delay(self.network_timestamp(), remote_timestamp)
    }
}

/// Pump one WebSocket until either side closes it.
async fn run_link<S>(
    id: ClientId,
    ws: WebSocketStream<S>,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if events
        .send(LinkEvent::Opened {
            id,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(data) => {
                        if let Err(e) = sink.send(Message::Binary(data)).await {
                            debug!("Send to {} failed: {}", id, e);
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if events.send(LinkEvent::Frame { id, data }).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Link {} closed by peer", id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    let _ = events.send(LinkEvent::Closed { id });
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(transport: &mut WebSocketTransport) -> NetEvent {
        for _ in 0..300 {
            let event = transport.poll_receive().expect("poll");
            if event != NetEvent::Nothing {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        NetEvent::Nothing
    }

    #[tokio::test]
    async fn test_channel_ids_are_sequential() {
        let mut transport = WebSocketTransport::new(Handle::current(), "127.0.0.1", 0);
        assert_eq!(transport.add_channel(ChannelKind::ReliableSequenced).unwrap(), 0);
        assert_eq!(transport.add_channel(ChannelKind::Unreliable).unwrap(), 1);
        assert!(matches!(
            transport.queue_message(ClientId(1), 0, b"x"),
            Err(TransportError::UnknownEndpoint(ClientId(1)))
        ));
        assert!(matches!(
            transport.queue_message(ClientId(1), 9, b"x"),
            Err(TransportError::UnknownChannel(9))
        ));
        assert!(transport.send_queue(ClientId(1)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_exchange_and_disconnect() {
        let mut server = WebSocketTransport::new(Handle::current(), "127.0.0.1", 0);
        server.add_channel(ChannelKind::ReliableSequenced).unwrap();
        server.register_server_listen_socket().unwrap();
        let port = server.local_addr().unwrap().port();

        let mut client = WebSocketTransport::new(Handle::current(), "127.0.0.1", 0);
        client.add_channel(ChannelKind::ReliableSequenced).unwrap();
        client.connect("127.0.0.1", port).unwrap();

        assert_eq!(
            next_event(&mut client).await,
            NetEvent::Connect {
                client: ClientId::SERVER
            }
        );
        assert_eq!(
            next_event(&mut server).await,
            NetEvent::Connect { client: ClientId(1) }
        );

        client.queue_message(ClientId::SERVER, 0, b"hello").unwrap();
        client.send_queue(ClientId::SERVER).unwrap();
        assert_eq!(
            next_event(&mut server).await,
            NetEvent::Data {
                client: ClientId(1),
                channel: 0,
                payload: b"hello".to_vec(),
            }
        );

        server.disconnect_client(ClientId(1));
        assert_eq!(
            next_event(&mut client).await,
            NetEvent::Disconnect {
                client: ClientId::SERVER
            }
        );

        // The side that closed the link hears nothing back.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.poll_receive().unwrap(), NetEvent::Nothing);
        assert_eq!(server.link_count(), 0);

        server.shutdown();
        client.shutdown();
    }

    #[tokio::test]
    async fn test_connect_failure_reports_disconnect() {
        let mut client = WebSocketTransport::new(Handle::current(), "127.0.0.1", 0);
        client.add_channel(ChannelKind::ReliableSequenced).unwrap();
        // Port 1 is privileged and never has a WebSocket listener in CI.
        client.connect("127.0.0.1", 1).unwrap();
        assert_eq!(
            next_event(&mut client).await,
            NetEvent::Disconnect {
                client: ClientId::SERVER
            }
        );
    }
}
