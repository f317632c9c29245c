//! WebSocket connection and heartbeat for the live endpoint.

use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tungstenite::stream::MaybeTlsStream;
use tungstenite::WebSocket;
use url::Url;

use crate::error::LiveError;

pub type LiveSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// How often the client loop polls the socket.
pub const READ_TICK: Duration = Duration::from_millis(100);

/// Open a `ws://` or `wss://` connection with connect and I/O timeouts.
pub fn connect(url_str: &str) -> Result<LiveSocket, LiveError> {
    let url = Url::parse(url_str)
        .map_err(|e| LiveError::Connection(format!("bad url '{url_str}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| LiveError::Connection(format!("no host in '{url_str}'")))?
        .to_string();
    let secure = url.scheme() == "wss";
    let port = url.port().unwrap_or(if secure { 443 } else { 80 });

    let addr = format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|e| LiveError::Connection(format!("resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| LiveError::Connection(format!("no address for {host}")))?;

    let tcp_stream = TcpStream::connect_timeout(&addr, Duration::from_secs(10))
        .map_err(|e| LiveError::Connection(format!("connect {addr}: {e}")))?;
    tcp_stream
        .set_read_timeout(Some(READ_TICK))
        .and_then(|_| tcp_stream.set_write_timeout(Some(Duration::from_secs(30))))
        .and_then(|_| tcp_stream.set_nodelay(true))
        .map_err(|e| LiveError::Connection(e.to_string()))?;

    let stream = if secure {
        let connector = native_tls::TlsConnector::new()
            .map_err(|e| LiveError::Connection(format!("tls init: {e}")))?;
        let tls_stream = connector
            .connect(&host, tcp_stream)
            .map_err(|e| LiveError::Connection(format!("tls handshake: {e}")))?;
        MaybeTlsStream::NativeTls(tls_stream)
    } else {
        MaybeTlsStream::Plain(tcp_stream)
    };

    let (socket, _response) = tungstenite::client::client(url_str, stream)
        .map_err(|e| LiveError::Connection(format!("websocket handshake: {e}")))?;
    Ok(socket)
}

/// True for the error a read-timeout poll produces.
pub fn is_timeout(error: &tungstenite::Error) -> bool {
    matches!(
        error,
        tungstenite::Error::Io(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
    )
}

/// Application-level ping/pong tracking. The transport may be "open" long
/// after the path went dark; a missed pong budget catches that.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    last_ping: Instant,
    last_pong: Instant,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Heartbeat {
            interval,
            last_ping: now,
            last_pong: now,
        }
    }

    /// True when it is time to send the next ping. Marks it sent.
    pub fn due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_ping) >= self.interval {
            self.last_ping = now;
            true
        } else {
            false
        }
    }

    pub fn note_pong(&mut self, now: Instant) {
        self.last_pong = now;
    }

    /// No pong for two whole intervals means the connection is silently dead.
    pub fn is_dead(&self, now: Instant) -> bool {
        now.duration_since(self.last_pong) > self.interval * 2
    }
}
