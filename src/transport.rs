//! One TCP socket to one node.
//!
//! A [`TcpTransport`] owns a reader task and a writer task. The reader decodes
//! frames and forwards them to the connection actor as
//! [`TransportEvent::Package`]; the writer drains an unbounded queue so
//! [`PackageSink::send`] never blocks the actor.
//!
//! Every transport gets a fresh connection id. The actor compares it against
//! its current transport and ignores events from a socket it already replaced.
//! A read or write failure produces exactly one [`TransportEvent::Closed`];
//! an explicit [`TcpTransport::close`] produces none.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Package, TcpCommand, read_frame, write_frame};

/// What the transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    Package {
        connection_id: Uuid,
        package: Package,
    },
    Closed {
        connection_id: Uuid,
        error: Error,
    },
}

/// Outbound side of a connection, as seen by the dispatcher.
pub trait PackageSink {
    fn connection_id(&self) -> Uuid;

    /// Queue a package for sending. Never waits for the socket.
    fn send(&self, package: Package) -> Result<()>;
}

pub struct TcpTransport {
    connection_id: Uuid,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Package>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connection_id", &self.connection_id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .finish()
    }
}

impl TcpTransport {
    /// Open a socket to `remote` within `connect_timeout` and start the I/O tasks.
    pub async fn connect(
        remote: SocketAddr,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<TcpTransport> {
        let stream = match timeout(connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(%remote, error = %e, "TCP connect failed");
                return Err(e.into());
            }
            Err(_) => {
                debug!(%remote, timeout_ms = connect_timeout.as_millis() as u64, "TCP connect timed out");
                return Err(Error::IoError(std::io::ErrorKind::TimedOut));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Self::from_stream(stream, events))
    }

    /// Wrap an already connected socket.
    pub fn from_stream(
        stream: TcpStream,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TcpTransport {
        let connection_id = Uuid::new_v4();
        let local = stream.local_addr().ok();
        let remote = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            connection_id,
            read_half,
            events.clone(),
            closed.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            connection_id,
            write_half,
            outbound_rx,
            events,
            closed.clone(),
        ));

        info!(%connection_id, %remote, ?local, "TCP connection established");

        TcpTransport {
            connection_id,
            remote,
            local,
            outbound,
            closed,
            reader,
            writer,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop both I/O tasks without reporting a `Closed` event.
    pub fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(connection_id = %self.connection_id, remote = %self.remote, reason, "Closing TCP connection");
        }
        self.reader.abort();
        self.writer.abort();
    }
}

impl PackageSink for TcpTransport {
    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn send(&self, package: Package) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(format!(
                "connection {} is closed",
                self.connection_id
            )));
        }
        self.outbound.send(package).map_err(|_| {
            Error::ConnectionClosed(format!("connection {} is closed", self.connection_id))
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        self.writer.abort();
    }
}

fn report_closed(
    connection_id: Uuid,
    closed: &AtomicBool,
    events: &mpsc::UnboundedSender<TransportEvent>,
    error: Error,
) {
    // Whichever task fails first reports; an explicit close reports nothing.
    if !closed.swap(true, Ordering::AcqRel) {
        let _ = events.send(TransportEvent::Closed {
            connection_id,
            error,
        });
    }
}

async fn read_loop(
    connection_id: Uuid,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%connection_id, error = %e, "Read loop finished");
                report_closed(connection_id, &closed, &events, e);
                return;
            }
        };

        let package = match Package::decode(frame) {
            Ok(package) => package,
            Err(e) => {
                warn!(%connection_id, error = %e, "Malformed package, closing connection");
                report_closed(connection_id, &closed, &events, e);
                return;
            }
        };

        if let TcpCommand::Unknown(code) = package.command {
            warn!(
                %connection_id,
                code,
                correlation_id = %package.correlation_id,
                "Skipping package with unknown command"
            );
            continue;
        }

        if events
            .send(TransportEvent::Package {
                connection_id,
                package,
            })
            .is_err()
        {
            // Owner is gone.
            return;
        }
    }
}

async fn write_loop(
    connection_id: Uuid,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Package>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(package) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &package).await {
            warn!(
                %connection_id,
                command = ?package.command,
                error = %e,
                "Write failed, closing connection"
            );
            report_closed(connection_id, &closed, &events, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpTransport, TcpStream, mpsc::UnboundedReceiver<TransportEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (transport, accepted) = tokio::join!(
            TcpTransport::connect(addr, Duration::from_secs(1), tx),
            listener.accept()
        );
        (transport.unwrap(), accepted.unwrap().0, rx)
    }

    #[tokio::test]
    async fn test_send_and_receive_packages() {
        let (transport, mut server, mut events) = pair().await;

        let ping = Package::new(TcpCommand::Ping, Uuid::new_v4());
        transport.send(ping.clone()).unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(Package::decode(frame).unwrap(), ping);

        let pong = Package::new(TcpCommand::Pong, ping.correlation_id);
        write_frame(&mut server, &pong).await.unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::Package {
                connection_id,
                package,
            } => {
                assert_eq!(connection_id, transport.connection_id());
                assert_eq!(package, pong);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_command_is_skipped() {
        let (_transport, mut server, mut events) = pair().await;

        let unknown = Package::new(TcpCommand::Unknown(0x7E), Uuid::new_v4());
        write_frame(&mut server, &unknown).await.unwrap();
        let pong = Package::new(TcpCommand::Pong, Uuid::new_v4());
        write_frame(&mut server, &pong).await.unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Package { package, .. } => assert_eq!(package.command, TcpCommand::Pong),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_once() {
        let (transport, server, mut events) = pair().await;
        drop(server);

        match events.recv().await.unwrap() {
            TransportEvent::Closed { connection_id, .. } => {
                assert_eq!(connection_id, transport.connection_id())
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(transport.is_closed());
        assert!(transport.send(Package::new(TcpCommand::Ping, Uuid::new_v4())).is_err());

        // No second report from the writer.
        let second = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(second.is_err() || second.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes() {
        let (_transport, mut server, mut events) = pair().await;

        let mut buf = BytesMut::new();
        buf.put_i32(i32::MAX);
        server.write_all(&buf).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Closed {
                error: Error::MissingData(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_explicit_close_is_silent() {
        let (transport, _server, mut events) = pair().await;
        transport.close("test");

        let next = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(!matches!(next, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = TcpTransport::connect(addr, Duration::from_secs(1), tx).await;
        assert!(matches!(result, Err(Error::IoError(_))));
    }
}
