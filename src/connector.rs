use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::connection::{Connection, WeakConnection};
use crate::handshake::{AuthenticatingStage, HANDSHAKE_STAGE_NAME, HandshakeSettings};
use crate::pipeline::{Stage, StageChain, StageContext, WireSink};
use crate::target::Target;

const READ_BUFFER_SIZE: usize = 16384;

enum WireCommand {
    Data(Bytes),
    Close,
}

/// Hands outbound bytes to the writer task.
struct ChannelSink {
    tx: UnboundedSender<WireCommand>,
    closed: Arc<Notify>,
}

impl WireSink for ChannelSink {
    fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.tx
            .send(WireCommand::Data(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection writer has stopped"))
    }

    fn close(&mut self) {
        let _ = self.tx.send(WireCommand::Close);
        self.closed.notify_one();
    }
}

/// Opens outbound connections with the authenticating stage in front of the
/// caller's stages.
#[derive(Debug, Clone)]
pub struct ShimConnector {
    settings: Arc<HandshakeSettings>,
}

impl ShimConnector {
    pub fn new(settings: HandshakeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &HandshakeSettings {
        &self.settings
    }

    /// Connects to `target` and starts driving the connection.
    ///
    /// The target is resolved again on every call. Connect failures are passed
    /// through the pipeline before being returned.
    pub async fn connect(&self, target: Target, chain: StageChain) -> io::Result<Connection> {
        let (tx, rx) = unbounded_channel();
        let closed = Arc::new(Notify::new());
        let sink = ChannelSink {
            tx,
            closed: closed.clone(),
        };

        let handshake = AuthenticatingStage::new(self.settings.clone(), chain);
        let connection = Connection::new(
            sink,
            StageChain::new().with(HANDSHAKE_STAGE_NAME, handshake),
        )?;

        let stream = match open_stream(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                if let Err(e) = connection.error(e) {
                    log::error!("Failed to connect to {target}: {e}");
                }
                let _ = connection.closed();
                return Err(io::Error::new(kind, message));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY on connection to {target}: {e}");
        }

        let (read_half, write_half) = stream.into_split();

        tokio::spawn(writer_loop(write_half, rx, connection.downgrade()));

        if let Err(e) = connection.connected(target.clone()) {
            let _ = connection.close();
            return Err(e);
        }

        tokio::spawn(reader_loop(
            read_half,
            connection.clone(),
            closed,
            target.clone(),
        ));

        if let Some(timeout) = self.settings.handshake_timeout {
            let weak = connection.downgrade();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(connection) = weak.upgrade()
                    && connection.is_open()
                    && connection.contains_stage(HANDSHAKE_STAGE_NAME)
                {
                    log::warn!("Handshake with {target} did not finish within {timeout:?}, closing");
                    let _ = connection.close();
                }
            });
        }

        Ok(connection)
    }
}

async fn open_stream(target: &Target) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host(), target.port()))
        .await
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("Failed to resolve {target}: {e}"),
            )
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("Failed to connect to {target} at {addr}: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("No addresses found for {target}"),
        )
    }))
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: UnboundedReceiver<WireCommand>,
    connection: WeakConnection,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WireCommand::Data(data) => {
                if let Err(e) = write_half.write_all(&data).await {
                    log::debug!("Write failed: {e}");
                    if let Some(connection) = connection.upgrade() {
                        if let Err(e) = connection.error(e) {
                            log::debug!("Unhandled write error: {e}");
                        }
                        let _ = connection.closed();
                    }
                    break;
                }
            }
            WireCommand::Close => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    connection: Connection,
    closed: Arc<Notify>,
    target: Target,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let result = tokio::select! {
            result = read_half.read(&mut buf) => result,
            _ = closed.notified() => break,
        };

        match result {
            Ok(0) => {
                log::debug!("Connection to {target} closed by peer");
                if let Err(e) = connection.closed() {
                    log::debug!("Error while closing connection to {target}: {e}");
                }
                break;
            }
            Ok(n) => {
                if let Err(e) = connection.read(Bytes::copy_from_slice(&buf[..n])) {
                    log::warn!("Closing connection to {target}: {e}");
                    let _ = connection.close();
                    break;
                }
            }
            Err(e) => {
                if let Err(e) = connection.error(e) {
                    log::warn!("Connection to {target} failed: {e}");
                }
                let _ = connection.closed();
                break;
            }
        }

        if !connection.is_open() {
            break;
        }
    }
}

/// What a [`ChannelEndpoint`] reports to its receiver.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected(Target),
    Data(Bytes),
    Error(io::Error),
    Closed,
}

/// Terminal stage that forwards inbound events over a channel.
pub struct ChannelEndpoint {
    tx: UnboundedSender<ConnectionEvent>,
}

pub fn channel_endpoint() -> (ChannelEndpoint, UnboundedReceiver<ConnectionEvent>) {
    let (tx, rx) = unbounded_channel();
    (ChannelEndpoint { tx }, rx)
}

impl ChannelEndpoint {
    fn send(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("Connection event receiver dropped");
        }
    }
}

impl Stage for ChannelEndpoint {
    fn on_connected(&mut self, _ctx: &mut StageContext<'_>, target: Target) -> io::Result<()> {
        self.send(ConnectionEvent::Connected(target));
        Ok(())
    }

    fn on_read(&mut self, _ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        self.send(ConnectionEvent::Data(data));
        Ok(())
    }

    fn on_error(&mut self, _ctx: &mut StageContext<'_>, error: io::Error) -> io::Result<()> {
        self.send(ConnectionEvent::Error(error));
        Ok(())
    }

    fn on_closed(&mut self, _ctx: &mut StageContext<'_>) -> io::Result<()> {
        self.send(ConnectionEvent::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MemorySink;

    #[tokio::test]
    async fn test_channel_endpoint_forwards_events() {
        let (endpoint, mut rx) = channel_endpoint();
        let connection =
            Connection::new(MemorySink::new(), StageChain::new().with("app", endpoint)).unwrap();

        connection.connected(Target::new("localhost", 1)).unwrap();
        connection.read(Bytes::from_static(b"data")).unwrap();
        connection.error(io::Error::other("oops")).unwrap();
        connection.close().unwrap();

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected(t)) if t.port() == 1));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Data(d)) if d == "data"));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Error(_))));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Closed)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = ShimConnector::new(HandshakeSettings::new("cluster-1"));
        let (endpoint, _rx) = channel_endpoint();
        let err = connector
            .connect(
                Target::new("127.0.0.1", port),
                StageChain::new().with("app", endpoint),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let connector = ShimConnector::new(HandshakeSettings::new("cluster-1"));
        let err = connector
            .connect(Target::new("nonexistent.invalid", 9300), StageChain::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
