//! The UDP datagram listener.
//!
//! A small pool of reader tasks shares one socket. Each reader owns a
//! 65535-byte scratch buffer and a semaphore bounding its in-flight packet
//! handlers; when the pool is saturated the reader parses the packet itself,
//! degrading to synchronous draining instead of queueing unboundedly.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::event::Events;
use crate::parser::packet_to_events;
use crate::telemetry::Telemetry;

// Maximum UDP payload; a datagram can never be larger.
const SCRATCH_SIZE: usize = 65535;

/// Binds the ingest socket, optionally raising the OS receive buffer.
pub fn bind(addr: SocketAddr, read_buffer: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if read_buffer > 0 {
        socket.set_recv_buffer_size(read_buffer)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Spawns `threads` reader tasks on the socket, with `packet_handlers`
/// concurrent packet handlers split evenly across them.
pub fn spawn(
    socket: UdpSocket,
    threads: usize,
    packet_handlers: usize,
    telemetry: Arc<Telemetry>,
    events: flume::Sender<Events>,
) -> Vec<JoinHandle<()>> {
    let socket = Arc::new(socket);
    let threads = threads.max(1);
    let handlers_per_reader = (packet_handlers / threads).max(1);

    (0..threads)
        .map(|_| {
            tokio::spawn(read_loop(
                socket.clone(),
                handlers_per_reader,
                telemetry.clone(),
                events.clone(),
            ))
        })
        .collect()
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    handler_permits: usize,
    telemetry: Arc<Telemetry>,
    events: flume::Sender<Events>,
) {
    let handlers = Arc::new(Semaphore::new(handler_permits));
    let mut scratch = vec![0u8; SCRATCH_SIZE];
    loop {
        let len = match socket.recv_from(&mut scratch).await {
            Ok((len, _)) => len,
            Err(error) => {
                warn!(%error, "error reading from UDP socket");
                continue;
            }
        };
        telemetry.udp_packets.inc();
        let packet = scratch[..len].to_vec();

        match handlers.clone().try_acquire_owned() {
            Ok(permit) => {
                let telemetry = telemetry.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    handle_packet(&telemetry, &packet, &events).await;
                    drop(permit);
                });
            }
            // All handler slots are busy: drain this packet on the reader.
            Err(_) => handle_packet(&telemetry, &packet, &events).await,
        }
    }
}

async fn handle_packet(telemetry: &Telemetry, packet: &[u8], events: &flume::Sender<Events>) {
    let batch = packet_to_events(telemetry, packet);
    if !batch.is_empty() {
        let _ = events.send_async(batch).await;
    }
}
