//! The TCP line listener.
//!
//! Long-lived sessions send one StatsD line per newline. Reads are bounded:
//! a line that exceeds the limit before its newline arrives closes the
//! connection, as does any read error other than a clean EOF.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::event::Events;
use crate::parser::line_to_events;
use crate::telemetry::Telemetry;

const MAX_LINE_LENGTH: usize = 65536;

/// Spawns the accept loop. Connection handlers live in a `JoinSet` owned by
/// the accept task, so aborting it tears the sessions down too.
pub fn spawn(
    listener: TcpListener,
    telemetry: Arc<Telemetry>,
    events: flume::Sender<Events>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "error accepting TCP connection");
                    continue;
                }
            };
            telemetry.tcp_connections.inc();
            connections.spawn(handle_connection(
                stream,
                peer,
                telemetry.clone(),
                events.clone(),
            ));
            // Reap finished handlers so the set does not grow unboundedly.
            while connections.try_join_next().is_some() {}
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    telemetry: Arc<Telemetry>,
    events: flume::Sender<Events>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => return,
            Ok(_) => {}
            Err(error) => {
                telemetry.tcp_errors.inc();
                debug!(%peer, %error, "read failed");
                return;
            }
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if buf.len() > MAX_LINE_LENGTH {
            telemetry.tcp_line_too_long.inc();
            debug!(%peer, "line too long");
            return;
        }

        telemetry.lines_received.inc();
        match std::str::from_utf8(&buf) {
            Ok(line) => {
                let batch = line_to_events(&telemetry, line);
                if !batch.is_empty() {
                    let _ = events.send_async(batch).await;
                }
            }
            Err(_) => {
                telemetry.sample_errors.malformed_line.inc();
                debug!(%peer, "non-UTF-8 line from StatsD");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use tokio::io::AsyncWriteExt;

    async fn setup() -> (Arc<Telemetry>, flume::Receiver<Events>, SocketAddr, JoinHandle<()>) {
        let registry = Registry::new();
        let telemetry = Arc::new(Telemetry::register(&registry).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = flume::bounded(16);
        let task = spawn(listener, telemetry.clone(), tx);
        (telemetry, rx, addr, task)
    }

    #[tokio::test]
    async fn test_lines_flow_to_the_events_channel() {
        let (telemetry, rx, addr, task) = setup().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"foo:2|c\nbar:3|g\n").await.unwrap();

        let batch = rx.recv_async().await.unwrap();
        assert_eq!(batch.len(), 1);
        let batch = rx.recv_async().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(telemetry.tcp_connections.get(), 1.0);

        task.abort();
    }

    #[tokio::test]
    async fn test_overlong_line_closes_the_connection() {
        let (telemetry, _rx, addr, task) = setup().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let long = vec![b'x'; MAX_LINE_LENGTH + 10];
        // The listener may reset the connection while we are still writing.
        let _ = client.write_all(&long).await;
        let _ = client.flush().await;

        // The listener closes its end once the bound is exceeded.
        let mut buf = [0u8; 1];
        let closed = matches!(client.read(&mut buf).await, Ok(0) | Err(_));
        assert!(closed);
        assert_eq!(telemetry.tcp_line_too_long.get(), 1.0);

        task.abort();
    }
}
