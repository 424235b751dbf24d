//! Shared utilities for integration testing.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use plume_proxy::config::{parse_directives, ProxyConfig};
use plume_proxy::plugin::{HttpPlugin, PluginHost};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A request as seen by a mock backend.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Received {
    pub head: String,
    pub body: Vec<u8>,
}

/// Read one request head and its `Content-Length` body.
pub async fn read_request(socket: &mut TcpStream) -> Received {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before the request head was complete");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before the request body was complete");
        body.extend_from_slice(&chunk[..n]);
    }
    Received { head, body }
}

/// Start a simple mock backend that returns a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move { (200, response.to_string()) }).await
}

/// Start a programmable mock backend; `f` sees each request and picks the reply.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(Received) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    start_raw_backend(move |received| {
        let reply = f(received);
        async move {
            let (status, body) = reply.await;
            let status_text = match status {
                200 => "200 OK",
                201 => "201 Created",
                404 => "404 Not Found",
                500 => "500 Internal Server Error",
                _ => "200 OK",
            };
            format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_text,
                body.len(),
                body
            )
            .into_bytes()
        }
    })
    .await
}

/// Start a backend that writes whatever bytes `f` produces, then closes.
pub async fn start_raw_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(Received) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let received = read_request(&mut socket).await;
                        let response = f(received).await;
                        let _ = socket.write_all(&response).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// An address nothing listens on.
#[allow(dead_code)]
pub fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Directive block serving `backends` on an ephemeral port.
pub fn http_block(backends: &[SocketAddr]) -> String {
    let mut block = String::from("http {\n    http_listen 127.0.0.1 0 64;\n");
    for backend in backends {
        block.push_str(&format!("    http_backend {} {};\n", backend.ip(), backend.port()));
    }
    block.push('}');
    block
}

/// Configure and start a proxy; returns the host and its listening address.
pub fn start_proxy(directives: &str, config: ProxyConfig) -> (PluginHost, SocketAddr) {
    let mut host = PluginHost::new(config);
    host.register(Box::new(HttpPlugin::new()));
    host.configure(&parse_directives(directives).unwrap()).unwrap();
    host.start().unwrap();
    let addr = host.local_addrs()[0];
    (host, addr)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
