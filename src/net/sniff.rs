//! Protocol detection from the first bytes of a connection.
//!
//! The decision is made once per connection from a peek buffer; no bytes are
//! consumed, so the chosen protocol handler sees the stream from the start.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

/// HTTP/2 client connection preface.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// TLS record type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;
/// Major version byte shared by SSL 3.0 and every TLS version.
const TLS_MAJOR: u8 = 0x03;

const PEEK_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TLS client hello.
    Tls,
    /// HTTP/2 with prior knowledge over cleartext.
    H2c,
    /// Anything else is treated as HTTP/1.x.
    Http1,
}

/// Classify a prefix of the stream. `None` means more bytes are needed.
pub fn classify(buf: &[u8]) -> Option<Protocol> {
    match buf {
        [] => None,
        [TLS_HANDSHAKE] => None,
        [TLS_HANDSHAKE, TLS_MAJOR, ..] => Some(Protocol::Tls),
        _ if buf.starts_with(H2_PREFACE) => Some(Protocol::H2c),
        _ if H2_PREFACE.starts_with(buf) => None,
        _ => Some(Protocol::Http1),
    }
}

/// Peek at `stream` until its protocol is known or `timeout` elapses.
pub async fn sniff(stream: &TcpStream, timeout: Duration) -> io::Result<Protocol> {
    let mut buf = [0u8; H2_PREFACE.len()];
    tokio::time::timeout(timeout, async {
        loop {
            let n = stream.peek(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            if let Some(protocol) = classify(&buf[..n]) {
                return Ok(protocol);
            }
            // peek returns immediately while any bytes are buffered.
            tokio::time::sleep(PEEK_RETRY).await;
        }
    })
    .await
    .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
}
