//! TCP transport
//!
//! Each direction of a connection is a stream of `len | bincode(Envelope) | len`
//! frames. A connection runs one reader task, which feeds socket bytes through
//! a [`LengthPrefixSuffixFramer`], and one writer task draining a queue of
//! already framed messages.

use async_trait::async_trait;
use bytes::Bytes;
use chronicle_core::framing::LengthPrefixSuffixFramer;
use chronicle_core::replication::{Envelope, ReplicationMessage};
use chronicle_core::transport::{
    AcceptedConnection, ConnectionStats, LeaderConnector, LeaderLink, ReplicaConnection,
};
use chronicle_core::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One end of a framed TCP connection
#[derive(Debug)]
pub struct TcpConnection {
    connection_id: Uuid,
    peer: SocketAddr,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    queued: AtomicUsize,
    closed: AtomicBool,
    stats: Mutex<ConnectionStats>,
    stop: watch::Sender<bool>,
}

impl TcpConnection {
    /// Take over `stream`, returning the connection and the envelopes read from it
    pub fn spawn(
        stream: TcpStream,
        max_frame_size: usize,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Envelope>)> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (stop, stopped) = watch::channel(false);

        let connection = Arc::new(Self {
            connection_id: Uuid::new_v4(),
            peer,
            outgoing: Mutex::new(Some(outgoing_tx)),
            queued: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stats: Mutex::new(ConnectionStats::default()),
            stop,
        });

        tokio::spawn(write_loop(connection.clone(), writer, outgoing_rx));
        tokio::spawn(read_loop(
            connection.clone(),
            reader,
            LengthPrefixSuffixFramer::new(max_frame_size),
            inbound_tx,
            stopped,
        ));

        tracing::debug!(
            connection_id = %connection.connection_id,
            peer = %peer,
            "TCP connection opened"
        );
        Ok((connection, inbound_rx))
    }

    /// Remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn enqueue(&self, frame: Bytes) -> bool {
        let outgoing = self.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            return false;
        };
        let size = frame.len() as u64;
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.stats.lock().pending_send_bytes += size;
        if tx.send(frame).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            let mut stats = self.stats.lock();
            stats.pending_send_bytes = stats.pending_send_bytes.saturating_sub(size);
            return false;
        }
        true
    }

    fn mark_closed(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            connection_id = %self.connection_id,
            peer = %self.peer,
            "Closing TCP connection: {}",
            reason
        );
        self.outgoing.lock().take();
        self.stop.send_replace(true);
    }
}

impl ReplicaConnection for TcpConnection {
    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn send_envelope(&self, envelope: Envelope) {
        if self.is_closed() {
            return;
        }
        match envelope.encode() {
            Ok(frame) => {
                self.enqueue(frame);
            }
            Err(e) => {
                tracing::error!(
                    connection_id = %self.connection_id,
                    "Failed to encode {}: {}",
                    envelope.message.name(),
                    e
                );
            }
        }
    }

    fn send_queue_size(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stop(&self, reason: &str) {
        self.mark_closed(reason);
    }

    fn send_bad_request_and_close(&self, correlation_id: Uuid, reason: &str) {
        let envelope = Envelope::reply(
            correlation_id,
            ReplicationMessage::BadRequest {
                reason: reason.to_string(),
            },
        );
        if let Ok(frame) = envelope.encode() {
            self.enqueue(frame);
        }
        // Dropping the queue sender lets the writer flush the reply before it exits.
        self.mark_closed(reason);
    }

    fn stats(&self) -> ConnectionStats {
        *self.stats.lock()
    }
}

async fn write_loop(
    connection: Arc<TcpConnection>,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = outgoing.recv().await {
        let size = frame.len() as u64;
        let written = writer.write_all(&frame).await;
        connection.queued.fetch_sub(1, Ordering::SeqCst);
        {
            let mut stats = connection.stats.lock();
            stats.pending_send_bytes = stats.pending_send_bytes.saturating_sub(size);
            if written.is_ok() {
                stats.total_bytes_sent += size;
            }
        }
        if let Err(e) = written {
            connection.mark_closed(&format!("write failed: {}", e));
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(
            connection_id = %connection.connection_id,
            "Socket shutdown failed: {}",
            e
        );
    }
}

async fn read_loop(
    connection: Arc<TcpConnection>,
    mut reader: OwnedReadHalf,
    mut framer: LengthPrefixSuffixFramer,
    inbound: mpsc::UnboundedSender<Envelope>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = stopped.changed() => break "stopped".to_string(),
        };
        let n = match read {
            Ok(0) => break "peer closed the connection".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read failed: {}", e),
        };

        connection.stats.lock().total_bytes_received += n as u64;
        let dispatched = framer.unframe_data(&buf[..n], |payload| {
            let envelope = Envelope::from_bytes(&payload)?;
            inbound
                .send(envelope)
                .map_err(|_| Error::connection_closed("Inbound receiver dropped"))
        });
        if let Err(e) = dispatched {
            break format!("bad frame: {}", e);
        }
    };
    connection.mark_closed(&reason);
}

/// Bind `addr` and hand every accepted socket to the returned receiver.
///
/// Returns the bound address, which differs from `addr` when it asked for
/// port 0. Accepting stops once the receiver is dropped.
pub async fn listen(
    addr: SocketAddr,
    max_frame_size: usize,
) -> Result<(
    SocketAddr,
    mpsc::UnboundedReceiver<AcceptedConnection>,
    JoinHandle<()>,
)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Replication listener bound to {}", local_addr);

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(accept_connections(listener, max_frame_size, tx));
    Ok((local_addr, rx, task))
}

async fn accept_connections(
    listener: TcpListener,
    max_frame_size: usize,
    accepted: mpsc::UnboundedSender<AcceptedConnection>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    tracing::info!("Replica connected from {}", addr);
                    let (connection, inbound) = match TcpConnection::spawn(stream, max_frame_size) {
                        Ok(spawned) => spawned,
                        Err(e) => {
                            tracing::warn!("Failed to set up connection from {}: {}", addr, e);
                            continue;
                        }
                    };
                    let handed_over = accepted.send(AcceptedConnection { connection: connection.clone(), inbound });
                    if handed_over.is_err() {
                        connection.stop("listener closed");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            },
            _ = accepted.closed() => break,
        }
    }
    tracing::info!("Replication listener stopped");
}

/// Opens replica links to a leader over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_frame_size: usize,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Connector accepting frames up to `max_frame_size`
    pub fn new(max_frame_size: usize, connect_timeout: Duration) -> Self {
        Self {
            max_frame_size,
            connect_timeout,
        }
    }
}

#[async_trait]
impl LeaderConnector for TcpConnector {
    async fn connect(&self, endpoint: SocketAddr, secure: bool) -> Result<LeaderLink> {
        if secure {
            return Err(Error::config(format!(
                "Secure endpoint {} requested but this transport has no TLS",
                endpoint
            )));
        }

        tracing::info!("Connecting to leader at {}", endpoint);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::connection_closed(format!("Connection to {} timed out", endpoint)))??;
        let (connection, inbound) = TcpConnection::spawn(stream, self.max_frame_size)?;

        let (outbound, mut to_leader) = mpsc::unbounded_channel::<Envelope>();
        let forwarder = connection.clone();
        tokio::spawn(async move {
            while let Some(envelope) = to_leader.recv().await {
                forwarder.send_envelope(envelope);
            }
            forwarder.stop("replica released the link");
        });

        Ok(LeaderLink {
            connection_id: connection.connection_id(),
            outbound,
            inbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> (LeaderLink, AcceptedConnection) {
        let (addr, mut listener, _task) = listen("127.0.0.1:0".parse().unwrap(), 1 << 20)
            .await
            .unwrap();
        let connector = TcpConnector::new(1 << 20, Duration::from_secs(5));
        let link = connector.connect(addr, false).await.unwrap();
        let accepted = listener.recv().await.unwrap();
        (link, accepted)
    }

    #[tokio::test]
    async fn test_envelopes_cross_both_ways() {
        let (mut link, mut accepted) = connected().await;

        let request = Envelope::new(ReplicationMessage::GetReplicationStats);
        link.outbound.send(request.clone()).unwrap();
        let received = accepted.inbound.recv().await.unwrap();
        assert_eq!(received, request);

        accepted
            .connection
            .reply(request.correlation_id, ReplicationMessage::ReplicatedTo { log_position: 42 });
        let reply = link.inbound.recv().await.unwrap();
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.message, ReplicationMessage::ReplicatedTo { log_position: 42 });

        let stats = accepted.connection.stats();
        assert!(stats.total_bytes_sent > 0);
        assert!(stats.total_bytes_received > 0);
    }

    #[tokio::test]
    async fn test_many_messages_arrive_in_order() {
        let (mut link, accepted) = connected().await;
        for i in 0..500 {
            accepted
                .connection
                .send(ReplicationMessage::ReplicatedTo { log_position: i });
        }
        for i in 0..500 {
            let envelope = link.inbound.recv().await.unwrap();
            assert_eq!(envelope.message, ReplicationMessage::ReplicatedTo { log_position: i });
        }
    }

    #[tokio::test]
    async fn test_stop_ends_both_sides() {
        let (mut link, mut accepted) = connected().await;
        accepted.connection.stop("test");
        assert!(accepted.connection.is_closed());
        assert!(link.inbound.recv().await.is_none());
        assert!(accepted.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_bad_request_is_delivered_before_close() {
        let (mut link, accepted) = connected().await;
        accepted
            .connection
            .send_bad_request_and_close(Uuid::new_v4(), "no such epoch");

        let envelope = link.inbound.recv().await.unwrap();
        assert_eq!(
            envelope.message,
            ReplicationMessage::BadRequest {
                reason: "no such epoch".to_string()
            }
        );
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_link_closes_leader_side() {
        let (link, mut accepted) = connected().await;
        drop(link);
        assert!(accepted.inbound.recv().await.is_none());
        assert!(accepted.connection.is_closed());
    }

    #[tokio::test]
    async fn test_secure_endpoint_rejected() {
        let connector = TcpConnector::new(1 << 20, Duration::from_secs(1));
        let result = connector.connect("127.0.0.1:1".parse().unwrap(), true).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
