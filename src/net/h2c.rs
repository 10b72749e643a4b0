//! HTTP/2 cleartext upgrade (`Upgrade: h2c`).
//!
//! The request that asked for the upgrade is answered on stream 1 of the new
//! HTTP/2 connection. hyper has no way to inject that stream, so after the
//! `101` the client preface and first SETTINGS frame are read here and
//! replayed to the HTTP/2 server followed by a HEADERS frame rebuilt from the
//! original request.
//!
//! Only bodiless requests are upgraded; others are served over HTTP/1.1.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::net::sniff::H2_PREFACE;

const FRAME_HEADER_LEN: usize = 9;
const MAX_FRAME_LEN: usize = 16_384;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

/// Headers that must not be carried into HTTP/2.
const CONNECTION_SPECIFIC: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "http2-settings",
    "te",
];

/// An accepted upgrade waiting for the `101` to be written.
pub struct H2cUpgrade {
    on_upgrade: OnUpgrade,
    headers_frame: Vec<u8>,
}

impl H2cUpgrade {
    /// Claim the upgrade if `request` asks for h2c and can be replayed.
    pub fn take<B>(request: &mut Request<B>) -> Option<Self> {
        if !requests_h2c(request) {
            return None;
        }
        let headers_frame = headers_frame(request)?;
        Some(Self {
            on_upgrade: hyper::upgrade::on(request),
            headers_frame,
        })
    }

    /// Wait for the upgraded connection and position it at the start of an
    /// HTTP/2 session whose stream 1 is the original request.
    pub async fn resume(self) -> io::Result<Rewind<TokioIo<Upgraded>>> {
        let mut io = TokioIo::new(self.on_upgrade.await.map_err(io::Error::other)?);

        let mut prefix = vec![0u8; H2_PREFACE.len() + FRAME_HEADER_LEN];
        io.read_exact(&mut prefix).await?;
        if !prefix.starts_with(H2_PREFACE) {
            return Err(invalid("missing HTTP/2 connection preface after upgrade"));
        }
        let header = &prefix[H2_PREFACE.len()..];
        if header[3] != FRAME_SETTINGS {
            return Err(invalid("first HTTP/2 frame is not SETTINGS"));
        }
        let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(invalid("oversized SETTINGS frame"));
        }

        let mut settings = vec![0u8; len];
        io.read_exact(&mut settings).await?;
        prefix.extend_from_slice(&settings);
        prefix.extend_from_slice(&self.headers_frame);
        Ok(Rewind::new(prefix, io))
    }
}

/// The `101 Switching Protocols` answer to an accepted upgrade.
pub fn switching_protocols() -> Response {
    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
    response
}

fn requests_h2c<B>(request: &Request<B>) -> bool {
    let headers = request.headers();
    let has_token = |name, token: &str| {
        headers.get_all(name).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    };
    let bodiless = !headers.contains_key(TRANSFER_ENCODING)
        && headers
            .get(CONTENT_LENGTH)
            .map_or(true, |len| len.as_bytes() == b"0");

    has_token(UPGRADE, "h2c")
        && has_token(CONNECTION, "upgrade")
        && headers.contains_key("http2-settings")
        && bodiless
}

/// Encode `request` as a HEADERS frame on stream 1 using HPACK literals that
/// leave the dynamic table untouched.
fn headers_frame<B>(request: &Request<B>) -> Option<Vec<u8>> {
    let mut block = Vec::new();
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    literal(&mut block, b":method", request.method().as_str().as_bytes());
    literal(&mut block, b":scheme", b"http");
    literal(&mut block, b":path", path.as_bytes());
    if let Some(host) = request.headers().get(HOST) {
        literal(&mut block, b":authority", host.as_bytes());
    }
    for (name, value) in request.headers() {
        if name == HOST || name == CONTENT_LENGTH || CONNECTION_SPECIFIC.contains(&name.as_str()) {
            continue;
        }
        literal(&mut block, name.as_str().as_bytes(), value.as_bytes());
    }
    if block.len() > MAX_FRAME_LEN {
        return None;
    }

    let len = u32::try_from(block.len()).ok()?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + block.len());
    frame.extend_from_slice(&len.to_be_bytes()[1..]);
    frame.push(FRAME_HEADERS);
    frame.push(FLAG_END_STREAM | FLAG_END_HEADERS);
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(&block);
    Some(frame)
}

/// Literal header field without indexing, new name.
fn literal(block: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    block.push(0x00);
    string(block, name);
    string(block, value);
}

fn string(block: &mut Vec<u8>, bytes: &[u8]) {
    integer(block, bytes.len(), 7);
    block.extend_from_slice(bytes);
}

fn integer(block: &mut Vec<u8>, value: usize, prefix_bits: u32) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        block.push(value as u8);
        return;
    }
    block.push(max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        block.push((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    block.push(rest as u8);
}

fn invalid(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Replays buffered bytes before reading from the inner stream.
pub struct Rewind<I> {
    prefix: Vec<u8>,
    position: usize,
    inner: I,
}

impl<I> Rewind<I> {
    fn new(prefix: Vec<u8>, inner: I) -> Self {
        Self {
            prefix,
            position: 0,
            inner,
        }
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for Rewind<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.position < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.position);
            buf.put_slice(&this.prefix[this.position..this.position + n]);
            this.position += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for Rewind<I> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
