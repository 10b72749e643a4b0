//! Protocol detection on plaintext and shared listeners.

mod common;

use common::{
    base_config, certs, connector, free_port, https_request, CertDir, ClientOptions, Running,
    TestCa, READY_REQUEST,
};
use std::time::Duration;

use mesh_bootstrap::net::Role;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn http1_and_h2c_share_the_plaintext_listener() {
    let known = tempfile::tempdir().unwrap();
    let running = Running::start(base_config(known.path())).await;
    let url = format!("http://{}/ready", running.server.http_addr().unwrap());

    let http1 = reqwest::Client::builder().http1_only().build().unwrap();
    let response = http1.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.version(), reqwest::Version::HTTP_11);
    assert!(response.headers().contains_key("x-request-id"));

    let h2c = reqwest::Client::builder().http2_prior_knowledge().build().unwrap();
    let response = h2c.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.version(), reqwest::Version::HTTP_2);

    running.stop().await;
}

#[tokio::test]
async fn grpc_requests_route_to_grpc_on_shared_listener() {
    let known = tempfile::tempdir().unwrap();
    let running = Running::start(base_config(known.path())).await;
    let addr = running.server.http_addr().unwrap();

    let h2c = reqwest::Client::builder().http2_prior_knowledge().build().unwrap();
    let response = h2c
        .post(format!("http://{addr}/mesh.Discovery/Stream"))
        .header("content-type", "application/grpc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["grpc-status"], "12");

    let response = h2c
        .get(format!("http://{addr}/mesh.Discovery/Stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    running.stop().await;
}

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const EMPTY_SETTINGS: [u8; 9] = [0, 0, 0, 0x4, 0, 0, 0, 0, 0];
/// HPACK static table entry 8, `:status: 200`.
const STATUS_200: u8 = 0x88;

struct Frame {
    kind: u8,
    stream: u32,
    payload: Vec<u8>,
}

async fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    Frame {
        kind: header[3],
        stream: u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff,
        payload,
    }
}

async fn response_headers(stream: &mut TcpStream, id: u32) -> Vec<u8> {
    let read = async {
        loop {
            let frame = read_frame(stream).await;
            assert_ne!(frame.kind, 0x7, "server sent GOAWAY");
            if frame.kind == 0x1 && frame.stream == id {
                return frame.payload;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read).await.unwrap()
}

fn request_headers(id: u32, path: &str) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in [
        (":method", "GET"),
        (":scheme", "http"),
        (":path", path),
        (":authority", "localhost"),
    ] {
        block.push(0x00);
        block.push(name.len() as u8);
        block.extend_from_slice(name.as_bytes());
        block.push(value.len() as u8);
        block.extend_from_slice(value.as_bytes());
    }
    let mut frame = (block.len() as u32).to_be_bytes()[1..].to_vec();
    frame.extend_from_slice(&[0x1, 0x5]);
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(&block);
    frame
}

#[tokio::test]
async fn h2c_upgrade_switches_to_http2() {
    let known = tempfile::tempdir().unwrap();
    let running = Running::start(base_config(known.path())).await;

    let mut stream = TcpStream::connect(running.server.http_addr().unwrap()).await.unwrap();
    stream
        .write_all(
            b"GET /ready HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade, HTTP2-Settings\r\n\
              Upgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        )
        .await
        .unwrap();

    // Byte at a time so no HTTP/2 frame is swallowed with the head.
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    let head = String::from_utf8_lossy(&head).to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 101"), "{head}");
    assert!(head.contains("upgrade: h2c"), "{head}");

    stream.write_all(H2_PREFACE).await.unwrap();
    stream.write_all(&EMPTY_SETTINGS).await.unwrap();

    // The upgrading request is answered on stream 1.
    let headers = response_headers(&mut stream, 1).await;
    assert_eq!(headers[0], STATUS_200);

    // Later streams reach the same routes.
    stream.write_all(&request_headers(3, "/ready")).await.unwrap();
    let headers = response_headers(&mut stream, 3).await;
    assert_eq!(headers[0], STATUS_200);

    drop(stream);
    running.stop().await;
}

#[tokio::test]
async fn upgrade_with_body_stays_on_http1() {
    let known = tempfile::tempdir().unwrap();
    let running = Running::start(base_config(known.path())).await;

    let mut stream = TcpStream::connect(running.server.http_addr().unwrap()).await.unwrap();
    stream
        .write_all(
            b"POST /ready HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade, HTTP2-Settings, close\r\n\
              Upgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\nContent-Length: 2\r\n\r\nhi",
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 "), "{response}");
    assert!(!response.starts_with("HTTP/1.1 101"), "{response}");

    running.stop().await;
}

#[tokio::test]
async fn plaintext_and_tls_on_one_port() {
    let known = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let files = CertDir::new();
    files.write(&ca.issue_server(), None);

    let shared = format!("127.0.0.1:{}", free_port());
    let mut config = base_config(known.path());
    config.server.http_addr = Some(shared.clone());
    config.server.https_addr = Some(shared);
    config.server.secure_grpc_addr = None;
    config.tls.cert_file = Some(files.cert.clone());
    config.tls.key_file = Some(files.key.clone());
    let running = Running::start(config).await;

    let server = &running.server;
    assert_eq!(server.listeners().len(), 1);
    let addr = server.http_addr().unwrap();
    assert_eq!(server.https_addr(), Some(addr));
    assert_eq!(server.addr_for(Role::Grpc), Some(addr));

    let response = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
    assert_eq!(response.status(), 200);

    let client = connector(&ClientOptions::trusting(certs(&ca.cert_pem)));
    let response = https_request(addr, &client, READY_REQUEST).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    running.stop().await;
}

#[tokio::test]
async fn tls_on_plaintext_only_listener_is_closed() {
    let known = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let running = Running::start(base_config(known.path())).await;

    let client = connector(&ClientOptions::trusting(certs(&ca.cert_pem)));
    let addr = running.server.http_addr().unwrap();
    let result = https_request(addr, &client, READY_REQUEST).await;
    assert!(result.is_err());

    running.stop().await;
}
