//! Framed transports between the client and a TURN server.
//!
//! UDP carries one STUN message or ChannelData frame per datagram. TCP and
//! TLS carry a byte stream that is split back into frames using the STUN
//! length field or the padded ChannelData length.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

use super::{TransportProtocol, TurnError, TurnServer};
use crate::channel_data::stream_frame_len;

/// Largest datagram accepted from the server
const MAX_DATAGRAM: usize = 65_535;

/// A framed connection to a TURN server
#[async_trait]
pub trait TurnTransport: Send + Sync {
    /// Send one complete STUN message or ChannelData frame
    async fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Receive the next complete frame
    async fn recv(&self) -> io::Result<Vec<u8>>;

    /// Whether the transport is a reliable byte stream
    ///
    /// ChannelData frames must be padded on stream transports, and STUN
    /// requests are not retransmitted on them.
    fn is_stream(&self) -> bool;

    /// Local address of the underlying socket
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// UDP transport connected to the server address
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral socket and connect it to `server`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if binding or connecting fails.
    pub async fn connect(server: SocketAddr) -> io::Result<Self> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl TurnTransport for UdpTransport {
    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).await.map(|_| ())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    fn is_stream(&self) -> bool {
        false
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Stream transport (TCP or TLS) with frame reassembly
pub struct StreamTransport<S> {
    reader: Mutex<(ReadHalf<S>, Vec<u8>)>,
    writer: Mutex<WriteHalf<S>>,
    local: SocketAddr,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a connected stream
    pub fn new(stream: S, local: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new((reader, Vec::new())),
            writer: Mutex::new(writer),
            local,
        }
    }
}

#[async_trait]
impl<S> TurnTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let (reader, buffer) = &mut *guard;
        let mut chunk = [0u8; 4096];

        loop {
            let frame_len = stream_frame_len(buffer)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if let Some(len) = frame_len {
                if buffer.len() >= len {
                    let rest = buffer.split_off(len);
                    return Ok(std::mem::replace(buffer, rest));
                }
            }

            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Open the transport `server` asks for
///
/// # Errors
///
/// Returns `TurnError::Resolve` if the host has no address, `TurnError::Io`
/// on connection failure and `TurnError::Tls` if the TLS handshake fails.
pub async fn open(server: &TurnServer) -> Result<Arc<dyn TurnTransport>, TurnError> {
    let addr = tokio::net::lookup_host((server.host.as_str(), server.port))
        .await?
        .next()
        .ok_or_else(|| TurnError::Resolve(server.host.clone()))?;

    debug!(
        server = %addr,
        transport = ?server.transport,
        secure = server.secure,
        "Opening TURN transport"
    );

    match (server.transport, server.secure) {
        (TransportProtocol::Udp, _) => Ok(Arc::new(UdpTransport::connect(addr).await?)),
        (TransportProtocol::Tcp, false) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let local = stream.local_addr()?;
            Ok(Arc::new(StreamTransport::new(stream, local)))
        }
        (TransportProtocol::Tcp, true) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let local = stream.local_addr()?;
            let tls = tls::connect(&server.host, stream).await?;
            Ok(Arc::new(StreamTransport::new(tls, local)))
        }
    }
}

mod tls {
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::client::TlsStream;
    use rustls::{OwnedTrustAnchor, RootCertStore, ServerName};

    use super::TurnError;

    fn client_config() -> rustls::ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }

    pub(super) async fn connect(
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, TurnError> {
        let name = ServerName::try_from(host).map_err(|e| TurnError::Tls(e.to_string()))?;
        let connector = TlsConnector::from(Arc::new(client_config()));
        connector
            .connect(name, stream)
            .await
            .map_err(|e| TurnError::Tls(e.to_string()))
    }
}
