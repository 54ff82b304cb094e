//! The CMB client: up to two connection actors coordinated by the session
//! partitioner.
//!
//! Each actor owns a connected UDP socket and a [`ReceiverConnection`]
//! machine; decoded blocks flow to the session loop, which is the only
//! writer of the output sink and the completed-block set. Claim
//! instructions flow back on per-actor control channels, so the two
//! connections never share mutable state.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use cmb_proto::{
    block_count, BlockId, Packet, Partitioner, ProtoError, ReceiverAction, ReceiverConnection,
    ResourceId, SessionInstruction, MAX_CONNECTIONS,
};

use crate::sink::Sink;
use crate::sleep_until_deadline;

/// Mailbox depth for session-internal channels.
const CHANNEL_DEPTH: usize = 64;

/// Grace period for actors to flush their final shrink on interrupt.
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

/// One server endpoint and the rate to request from it.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub rate: u32,
}

enum ConnEvent {
    Decoded { connection: usize, block_id: BlockId, data: Vec<u8> },
    Failed { connection: usize, error: ProtoError },
    Finished { connection: usize },
}

enum ConnControl {
    Claim(BlockId),
    Complete,
}

/// Downloads the resource from the given endpoints into `output`.
pub async fn download(
    resource_id: ResourceId,
    endpoints: Vec<Endpoint>,
    output: &str,
) -> anyhow::Result<()> {
    if endpoints.is_empty() || endpoints.len() > MAX_CONNECTIONS {
        bail!("expected 1 or {} endpoints, got {}", MAX_CONNECTIONS, endpoints.len());
    }

    let blocks = block_count(resource_id.length);
    info!(%resource_id, blocks, connections = endpoints.len(), "starting download");

    let mut sink = Sink::create(output, resource_id.length)
        .await
        .with_context(|| format!("failed to open output {output}"))?;

    let mut partitioner = Partitioner::new(blocks, endpoints.len());
    let (event_tx, mut events) = mpsc::channel(CHANNEL_DEPTH);
    let mut controls = Vec::with_capacity(endpoints.len());
    let mut actors = Vec::with_capacity(endpoints.len());

    for (index, (endpoint, (range, reverse))) in
        endpoints.iter().zip(partitioner.assignments()).enumerate()
    {
        let socket = connect(endpoint.addr)
            .await
            .with_context(|| format!("failed to open socket to {}", endpoint.addr))?;
        let machine =
            ReceiverConnection::new(resource_id, range, reverse, endpoint.rate, Instant::now());
        let (control_tx, control_rx) = mpsc::channel(CHANNEL_DEPTH);
        controls.push(control_tx);
        actors.push(tokio::spawn(run_connection(
            index,
            socket,
            machine,
            control_rx,
            event_tx.clone(),
        )));
    }
    drop(event_tx);

    // A zero-block resource is complete before any Data arrives.
    if partitioner.is_complete() {
        for control in &controls {
            let _ = control.send(ConnControl::Complete).await;
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut finished = vec![false; endpoints.len()];
    let mut failure: Option<ProtoError> = None;

    while !finished.iter().all(|done| *done) {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = &mut ctrl_c => {
                info!("interrupted, closing connections");
                for control in &controls {
                    let _ = control.send(ConnControl::Complete).await;
                }
                tokio::time::sleep(INTERRUPT_GRACE).await;
                break;
            }
        };

        match event {
            ConnEvent::Decoded { connection, block_id, data } => {
                trace!(connection, block_id, "block received");
                for instruction in partitioner.on_decoded(connection, block_id, data) {
                    match instruction {
                        SessionInstruction::Write { block_id, data } => {
                            sink.write_block(block_id, &data)
                                .await
                                .context("failed to write output")?;
                        }
                        SessionInstruction::Claim { connection, block_id } => {
                            let _ = controls[connection].send(ConnControl::Claim(block_id)).await;
                        }
                        SessionInstruction::Complete => {
                            debug!("transfer complete, tearing down");
                            for control in &controls {
                                let _ = control.send(ConnControl::Complete).await;
                            }
                        }
                    }
                }
            }
            ConnEvent::Failed { connection, error } => {
                warn!(connection, %error, "connection failed");
                failure = Some(error);
                break;
            }
            ConnEvent::Finished { connection } => {
                debug!(connection, "connection finished");
                finished[connection] = true;
            }
        }
    }

    for actor in &actors {
        actor.abort();
    }

    if let Some(error) = failure {
        return Err(error.into());
    }
    if !partitioner.is_complete() {
        bail!("transfer ended with {}/{} blocks", partitioner.acked_count(), blocks);
    }
    sink.finish().await.context("failed to flush output")?;
    info!("download complete");
    Ok(())
}

/// Binds an ephemeral socket of the right family and connects it to the
/// server endpoint.
async fn connect(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match addr.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

async fn run_connection(
    index: usize,
    socket: UdpSocket,
    mut machine: ReceiverConnection,
    mut control: mpsc::Receiver<ConnControl>,
    events: mpsc::Sender<ConnEvent>,
) {
    let mut buf = vec![0u8; 2048];

    loop {
        let actions = tokio::select! {
            received = socket.recv(&mut buf) => match received {
                Ok(len) => match Packet::parse(&buf[..len]) {
                    Ok(packet) => machine.on_packet(&packet, Instant::now()),
                    Err(err) => {
                        trace!(%err, "dropping malformed datagram");
                        Vec::new()
                    }
                },
                // Connected UDP sockets surface ICMP refusals as errors;
                // the retransmit schedule covers that case.
                Err(err) => {
                    trace!(%err, "recv error");
                    Vec::new()
                }
            },
            command = control.recv() => match command {
                Some(ConnControl::Claim(block_id)) => machine.apply_claim(block_id, Instant::now()),
                Some(ConnControl::Complete) => machine.complete(Instant::now()),
                None => return,
            },
            _ = sleep_until_deadline(machine.next_deadline()) => machine.poll(Instant::now()),
        };

        for action in actions {
            match action {
                ReceiverAction::Send(packet) => {
                    if let Err(err) = socket.send(&packet.to_bytes()).await {
                        trace!(%err, "send error");
                    }
                }
                ReceiverAction::Deliver { block_id, data } => {
                    let event = ConnEvent::Decoded { connection: index, block_id, data };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                ReceiverAction::Failed(error) => {
                    let _ = events.send(ConnEvent::Failed { connection: index, error }).await;
                    return;
                }
                ReceiverAction::Finished => {
                    let _ = events.send(ConnEvent::Finished { connection: index }).await;
                    return;
                }
            }
        }
        if machine.is_closed() {
            return;
        }
    }
}
