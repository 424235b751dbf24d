//! Client request intake.
//!
//! # Responsibilities
//! - Read one request head from a client connection
//! - Enforce header and body size limits
//! - Collect a `Content-Length` body
//! - Produce the `ProxyRequest` consumed by the forward engine
//!
//! # Design Decisions
//! - The head is forwarded byte-for-byte; nothing is rewritten
//! - Chunked request bodies are rejected (`501`)
//! - One request per client connection
//! - `Expect: 100-continue` is answered here before the body is read; the
//!   header still reaches the origin, whose own interim reply is relayed as
//!   an ordinary 1xx response

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::LimitsConfig;

const MAX_HEADERS: usize = 64;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A parsed request ready to be proxied.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    /// Request line and headers, including the terminating blank line.
    pub head: Bytes,
    pub body: Bytes,
    /// Stream the body while the response is already being relayed.
    pub post_receive: bool,
}

impl ProxyRequest {
    /// Build a request from a raw head and body.
    pub fn new(head: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            head: head.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// `HEAD` responses never carry a body, whatever their headers say.
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("client closed the connection")]
    Closed,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("request body of {0} bytes exceeds the limit")]
    BodyTooLarge(u64),
    #[error("chunked request bodies are not supported")]
    ChunkedBody,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl RequestError {
    /// Status line to answer with, if the client is still there.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            RequestError::Closed | RequestError::Io(_) => None,
            RequestError::Malformed(_) => Some((400, "Bad Request")),
            RequestError::HeadTooLarge(_) => Some((431, "Request Header Fields Too Large")),
            RequestError::BodyTooLarge(_) => Some((413, "Payload Too Large")),
            RequestError::ChunkedBody => Some((501, "Not Implemented")),
        }
    }
}

/// Request line and framing facts pulled out of a complete head.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub head_len: usize,
    pub content_length: u64,
    pub expects_continue: bool,
}

/// Parse a request head out of `buf`. `Ok(None)` means more bytes are needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    };

    let mut content_length = None;
    let mut expects_continue = false;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| RequestError::Malformed("invalid content-length".into()))?;
            if content_length.is_some_and(|seen| seen != value) {
                return Err(RequestError::Malformed("conflicting content-length".into()));
            }
            content_length = Some(value);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let chunked = std::str::from_utf8(header.value)
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);
            if chunked {
                return Err(RequestError::ChunkedBody);
            }
        } else if header.name.eq_ignore_ascii_case("expect") {
            // HTTP/1.0 clients never wait for an interim response.
            expects_continue = req.version == Some(1) && header.value.eq_ignore_ascii_case(b"100-continue");
        }
    }

    Ok(Some(RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or_default().to_string(),
        head_len,
        content_length: content_length.unwrap_or(0),
        expects_continue,
    }))
}

/// Read one complete request from the client.
pub async fn read_request(stream: &mut TcpStream, limits: &LimitsConfig) -> Result<ProxyRequest, RequestError> {
    let mut buf = BytesMut::with_capacity(4096);

    let head = loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(if buf.is_empty() {
                RequestError::Closed
            } else {
                RequestError::Malformed("connection closed mid-head".into())
            });
        }
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if buf.len() > limits.max_header_bytes {
            return Err(RequestError::HeadTooLarge(limits.max_header_bytes));
        }
    };

    if head.head_len > limits.max_header_bytes {
        return Err(RequestError::HeadTooLarge(limits.max_header_bytes));
    }
    if head.content_length > limits.max_body_bytes as u64 {
        return Err(RequestError::BodyTooLarge(head.content_length));
    }

    let head_bytes = buf.split_to(head.head_len).freeze();
    let body_len = head.content_length as usize;
    if head.expects_continue && buf.len() < body_len {
        stream.write_all(CONTINUE).await?;
    }
    while buf.len() < body_len {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::Malformed("connection closed mid-body".into()));
        }
    }
    buf.truncate(body_len);

    tracing::debug!(method = %head.method, path = %head.path, body_len, "Request received");

    Ok(ProxyRequest {
        method: head.method,
        path: head.path,
        head: head_bytes,
        body: buf.freeze(),
        // Let the origin answer `Expect: 100-continue` while the body streams.
        post_receive: head.expects_continue,
    })
}
