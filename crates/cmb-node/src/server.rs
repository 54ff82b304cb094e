//! The CMB server: one listener task per endpoint, one connection actor
//! per requesting peer.
//!
//! The listener owns the socket's receive half, parses datagrams (dropping
//! malformed ones), applies a per-IP inbound rate limit, and routes packets
//! to per-peer actors over mailbox channels. Each actor owns its
//! [`SenderConnection`] exclusively and alternates between its mailbox and
//! the machine's next timer deadline.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use cmb_proto::wire::{ErrorCode, ErrorPacket};
use cmb_proto::{Packet, Resource, SenderConnection};

use crate::sleep_until_deadline;

/// Inbound control packets allowed per second per source IP.
const INBOUND_PACKETS_PER_SECOND: u32 = 10_000;

/// Mailbox depth per connection actor.
const MAILBOX_DEPTH: usize = 256;

/// Per-IP rate limiter over inbound datagrams.
type KeyedRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

type ConnectionMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Packet>>>>;

/// Loads `path` into memory and serves it on every endpoint until the
/// process is interrupted.
pub async fn serve(path: &Path, endpoints: Vec<SocketAddr>) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let resource = Arc::new(Resource::new(data));

    // The line the client pastes back as <resource_id_hex>.
    println!("{}", resource.id());
    info!(
        length = resource.length(),
        blocks = resource.block_count(),
        "serving resource"
    );

    let mut sockets = Vec::with_capacity(endpoints.len());
    for addr in endpoints {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        sockets.push(socket);
    }

    tokio::select! {
        result = serve_on(sockets, resource) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

/// Serves `resource` on a set of already-bound sockets.
pub async fn serve_on(sockets: Vec<UdpSocket>, resource: Arc<Resource>) -> anyhow::Result<()> {
    let mut listeners = JoinSet::new();
    for socket in sockets {
        listeners.spawn(listen(socket, resource.clone()));
    }
    while let Some(joined) = listeners.join_next().await {
        joined.context("listener task failed")??;
    }
    Ok(())
}

async fn listen(socket: UdpSocket, resource: Arc<Resource>) -> anyhow::Result<()> {
    let local = socket.local_addr().context("socket has no local address")?;
    info!(%local, "listening");

    let socket = Arc::new(socket);
    let connections: ConnectionMap = Arc::new(Mutex::new(HashMap::new()));
    let pps = NonZeroU32::new(INBOUND_PACKETS_PER_SECOND).unwrap_or(NonZeroU32::MIN);
    let limiter: KeyedRateLimiter = RateLimiter::keyed(Quota::per_second(pps));
    let mut malformed: u64 = 0;
    let mut buf = vec![0u8; 2048];

    loop {
        let (len, peer) = socket.recv_from(&mut buf).await.context("recv failed")?;
        if limiter.check_key(&peer.ip()).is_err() {
            trace!(%peer, "rate limited");
            continue;
        }

        let packet = match Packet::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                malformed += 1;
                trace!(%peer, %err, malformed, "dropping malformed datagram");
                continue;
            }
        };

        // Hand the packet to the peer's actor; a send failure means the
        // actor already exited and the entry is stale.
        let unrouted = {
            let sender = connections.lock().await.get(&peer).cloned();
            match sender {
                Some(tx) => match tx.send(packet).await {
                    Ok(()) => None,
                    Err(returned) => {
                        connections.lock().await.remove(&peer);
                        Some(returned.0)
                    }
                },
                None => Some(packet),
            }
        };

        if let Some(packet) = unrouted {
            match &packet {
                Packet::RequestResource(_) => {
                    let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
                    connections.lock().await.insert(peer, tx.clone());
                    tokio::spawn(connection_actor(
                        socket.clone(),
                        peer,
                        resource.clone(),
                        rx,
                        connections.clone(),
                    ));
                    let _ = tx.send(packet).await;
                }
                _ => {
                    debug!(%peer, "packet for unknown connection");
                    let reply = Packet::Error(ErrorPacket { code: ErrorCode::ProtocolViolation });
                    if let Err(err) = socket.send_to(&reply.to_bytes(), peer).await {
                        warn!(%peer, %err, "failed to send error reply");
                    }
                }
            }
        }
    }
}

async fn connection_actor(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    resource: Arc<Resource>,
    mut mailbox: mpsc::Receiver<Packet>,
    connections: ConnectionMap,
) {
    debug!(%peer, "connection opened");
    let mut machine = SenderConnection::new(resource, Instant::now());

    'run: loop {
        let outbound = tokio::select! {
            packet = mailbox.recv() => match packet {
                Some(packet) => machine.handle_packet(&packet, Instant::now()),
                None => break 'run,
            },
            _ = sleep_until_deadline(machine.next_deadline()) => machine.poll(Instant::now()),
        };

        for packet in outbound {
            if let Err(err) = socket.send_to(&packet.to_bytes(), peer).await {
                warn!(%peer, %err, "send failed");
                break 'run;
            }
        }
        if machine.is_closed() {
            break;
        }
    }

    connections.lock().await.remove(&peer);
    debug!(%peer, "connection closed");
}
