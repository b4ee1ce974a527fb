//! Line-oriented transports.
//!
//! A [`Transport`] owns one outbound connection. Once connected it hands out
//! an input [`LineSource`] and an output [`LineSink`]; the chat connection
//! only ever talks to those. [`TcpConnector`] builds plaintext or TLS
//! transports over tokio sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::config::ConnectConfig;
use crate::error::TransportError;

/// Longest inbound line accepted, terminator included. Tagged gateway lines
/// stay well below this.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Inbound half: yields one line at a time, terminator stripped.
#[async_trait]
pub trait LineSource: Send {
    async fn read_line(&mut self) -> Result<String, TransportError>;
}

/// Outbound half. Lines are buffered until [`flush`](LineSink::flush).
#[async_trait]
pub trait LineSink: Send {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;
    async fn flush(&mut self) -> Result<(), TransportError>;
}

/// One connection to the gateway.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Derive the input/output line channels. Valid once per connect.
    fn channels(&mut self) -> Result<(Box<dyn LineSource>, Box<dyn LineSink>), TransportError>;

    /// Dispose of the connection. Wakes any pending read with
    /// [`TransportError::Closed`].
    async fn close(&mut self);
}

/// Creates a fresh, unconnected transport for every connection attempt.
pub trait Connector: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

/// Plaintext or TLS transports over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    receive_timeout: Duration,
    tls: bool,
}

impl TcpConnector {
    pub fn new(receive_timeout: Duration, tls: bool) -> Self {
        Self { receive_timeout, tls }
    }

    pub fn from_config(config: &ConnectConfig) -> Self {
        Self::new(config.receive_timeout, config.use_tls())
    }
}

impl Connector for TcpConnector {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(TcpTransport::new(self.receive_timeout, self.tls))
    }
}

/// A socket that has connected (and finished TLS, if any) but whose line
/// channels have not been handed out yet.
enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

impl EstablishedConnection {
    fn split(self) -> (BoxedRead, BoxedWrite) {
        match self {
            EstablishedConnection::Plain(tcp) => {
                let (reader, writer) = tcp.into_split();
                (Box::new(reader), Box::new(writer))
            }
            EstablishedConnection::Tls(tls) => {
                let (reader, writer) = tokio::io::split(*tls);
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

pub struct TcpTransport {
    receive_timeout: Duration,
    tls: bool,
    connected: bool,
    stream: Option<EstablishedConnection>,
    closed: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(receive_timeout: Duration, tls: bool) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            receive_timeout,
            tls,
            connected: false,
            stream: None,
            closed,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let mode = if self.tls { "TLS" } else { "plain" };
        tracing::debug!("Connecting to {host}:{port} ({mode})");
        let tcp = TcpStream::connect((host, port)).await?;

        let stream = if self.tls {
            let connector = TlsConnector::from(Arc::new(rustls_default_config()));
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            let tls = connector.connect(server_name, tcp).await?;
            tracing::debug!("TLS handshake complete");
            EstablishedConnection::Tls(Box::new(tls))
        } else {
            EstablishedConnection::Plain(tcp)
        };

        self.stream = Some(stream);
        self.connected = true;
        self.closed.send_replace(false);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn channels(&mut self) -> Result<(Box<dyn LineSource>, Box<dyn LineSink>), TransportError> {
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        let (reader, writer) = stream.split();
        let source = TcpLineSource {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            receive_timeout: self.receive_timeout,
            closed: self.closed.subscribe(),
        };
        let sink = TcpLineSink {
            writer: BufWriter::new(writer),
        };
        Ok((Box::new(source), Box::new(sink)))
    }

    async fn close(&mut self) {
        self.connected = false;
        self.stream = None;
        self.closed.send_replace(true);
    }
}

struct TcpLineSource {
    reader: BufReader<BoxedRead>,
    buf: Vec<u8>,
    receive_timeout: Duration,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl LineSource for TcpLineSource {
    async fn read_line(&mut self) -> Result<String, TransportError> {
        let Self {
            reader,
            buf,
            receive_timeout,
            closed,
        } = self;
        // `buf` keeps bytes from a read that was cancelled mid-line.
        let limit = MAX_LINE_LEN.saturating_sub(buf.len()) as u64;
        let mut limited = (&mut *reader).take(limit);
        let read_line = limited.read_until(b'\n', buf);

        let read = tokio::select! {
            read = tokio::time::timeout(*receive_timeout, read_line) => read,
            _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
        };
        let n = read.map_err(|_| TransportError::Timeout(*receive_timeout))??;
        if !buf.ends_with(b"\n") {
            if buf.len() >= MAX_LINE_LEN {
                buf.clear();
                return Err(TransportError::LineTooLong(MAX_LINE_LEN));
            }
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }

        let line = String::from_utf8(std::mem::take(buf))?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

struct TcpLineSink {
    writer: BufWriter<BoxedWrite>,
}

#[async_trait]
impl LineSink for TcpLineSink {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.writer.flush().await?;
        Ok(())
    }
}

fn install_crypto_provider() {
    // ring wins when both providers are compiled in.
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn connected(port: u16, receive_timeout: Duration) -> TcpTransport {
        let mut transport = TcpTransport::new(receive_timeout, false);
        assert!(!transport.is_connected());
        transport.connect("127.0.0.1", port).await.unwrap();
        assert!(transport.is_connected());
        transport
    }

    #[tokio::test]
    async fn lines_are_crlf_framed_both_ways() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"A\r\nB\n").await.unwrap();
            let mut received = vec![0u8; "JOIN #foo\r\n".len()];
            socket.read_exact(&mut received).await.unwrap();
            received
        });

        let mut transport = connected(port, Duration::from_secs(5)).await;
        let (mut source, mut sink) = transport.channels().unwrap();
        assert_eq!(source.read_line().await.unwrap(), "A");
        assert_eq!(source.read_line().await.unwrap(), "B");

        sink.write_line("JOIN #foo").await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(server.await.unwrap(), b"JOIN #foo\r\n");
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_decode_error() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"\xff\xfe\r\n").await.unwrap();
            socket
        });

        let mut transport = connected(port, Duration::from_secs(5)).await;
        let (mut source, _sink) = transport.channels().unwrap();
        assert!(matches!(source.read_line().await, Err(TransportError::Decode(_))));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_read_keeps_partial_line() {
        let (listener, port) = listener().await;
        let (rest_tx, rest_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"HEL").await.unwrap();
            rest_rx.await.unwrap();
            socket.write_all(b"LO\r\n").await.unwrap();
            socket
        });

        let mut transport = connected(port, Duration::from_secs(5)).await;
        let (mut source, _sink) = transport.channels().unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(100), source.read_line()).await;
        assert!(cancelled.is_err());

        rest_tx.send(()).unwrap();
        assert_eq!(source.read_line().await.unwrap(), "HELLO");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn overlong_line_rejected() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&vec![b'a'; MAX_LINE_LEN + 10]).await.unwrap();
            socket
        });

        let mut transport = connected(port, Duration::from_secs(5)).await;
        let (mut source, _sink) = transport.channels().unwrap();
        assert!(matches!(
            source.read_line().await,
            Err(TransportError::LineTooLong(MAX_LINE_LEN))
        ));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn idle_read_times_out() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut transport = connected(port, Duration::from_millis(50)).await;
        let (mut source, _sink) = transport.channels().unwrap();
        let _socket = server.await.unwrap();
        assert!(matches!(source.read_line().await, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn close_wakes_pending_read() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut transport = connected(port, Duration::from_secs(30)).await;
        let (mut source, _sink) = transport.channels().unwrap();
        let _socket = server.await.unwrap();

        let reader = tokio::spawn(async move { source.read_line().await });
        tokio::task::yield_now().await;
        transport.close().await;
        assert!(!transport.is_connected());
        assert!(matches!(reader.await.unwrap(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn eof_is_closed() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = connected(port, Duration::from_secs(5)).await;
        let (mut source, _sink) = transport.channels().unwrap();
        server.await.unwrap();
        assert!(matches!(source.read_line().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn channels_only_once_per_connect() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut transport = connected(port, Duration::from_secs(5)).await;
        assert!(transport.channels().is_ok());
        assert!(matches!(transport.channels(), Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn refused_connect_is_io_error() {
        let (listener, port) = listener().await;
        drop(listener);

        let mut transport = TcpTransport::new(Duration::from_secs(5), false);
        assert!(matches!(
            transport.connect("127.0.0.1", port).await,
            Err(TransportError::Io(_))
        ));
        assert!(!transport.is_connected());
    }
}
