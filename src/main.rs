//! Netsync Demo
//!
//! Runs a host and two clients over the in-process loopback transport,
//! exchanges a few custom messages and prints the resulting rosters.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use netsync::network::channel::DEFAULT_MESSAGE_CHANNEL;
use netsync::network::{AllowAll, LoopbackHub, TransportKind};
use netsync::{ClientId, HostOptions, NetworkConfig, Session, VERSION};

/// One simulation step at the default 64 Hz.
const STEP: Duration = Duration::from_micros(15_625);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Netsync demo v{}", VERSION);

    let config = NetworkConfig {
        transport: TransportKind::Custom,
        connection_approval: true,
        enable_encryption: true,
        ..NetworkConfig::default()
    };

    let hub = LoopbackHub::new();
    let inbox: Rc<RefCell<Vec<(ClientId, String)>>> = Rc::default();

    let mut host = Session::new(config.clone())
        .with_transport(hub.endpoint())
        .with_approval(AllowAll);
    host.start_host(HostOptions::default())?;

    let mut clients = Vec::new();
    for name in ["alpha", "beta"] {
        let received = inbox.clone();
        let mut client = Session::new(config.clone())
            .with_transport(hub.endpoint())
            .with_custom_messages(move |sender: ClientId, _tag: u32, body: &[u8]| {
                received
                    .borrow_mut()
                    .push((sender, String::from_utf8_lossy(body).into_owned()));
            });
        client.start_client()?;
        info!("Client {} starting", name);
        clients.push(client);
    }

    step_all(&mut host, &mut clients, 8);
    for client in &clients {
        info!(
            "Client {} state {:?}, peers {:?}, key {}",
            client.local_client_id(),
            client.client_state(),
            client.peers(),
            client
                .server_key()
                .map(|key| key.fingerprint())
                .unwrap_or_else(|| "none".into())
        );
    }

    host.broadcast_custom_message(DEFAULT_MESSAGE_CHANNEL, b"welcome")?;
    step_all(&mut host, &mut clients, 4);
    for (sender, text) in inbox.borrow().iter() {
        info!("Received {:?} from {}", text, sender);
    }

    clients[0].stop();
    step_all(&mut host, &mut clients, 4);
    info!("Host roster after a client left: {:?}", host.client_ids());
    info!("Remaining client sees peers {:?}", clients[1].peers());

    for client in clients.iter_mut() {
        client.stop();
    }
    host.stop();
    info!("Stats: {:?}", host.stats());
    Ok(())
}

fn step_all(host: &mut Session, clients: &mut [Session], steps: usize) {
    for _ in 0..steps {
        host.tick(STEP);
        for client in clients.iter_mut() {
            client.tick(STEP);
        }
    }
}
