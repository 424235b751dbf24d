//! Response framing and gateway error responses.
//!
//! # Responsibilities
//! - Track where a relayed HTTP/1.1 response ends (content-length,
//!   chunked terminator, or connection close)
//! - Skip interim `1xx` responses
//! - Build the short error responses written when forwarding fails
//!
//! # Design Decisions
//! - Bytes are relayed untouched; framing only counts them
//! - Chunked bodies are scanned incrementally, across read boundaries

use crate::forward::ForwardStatus;

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("malformed response head: {0}")]
    Head(String),
    #[error("response head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("malformed chunked body")]
    Chunked,
    #[error("backend closed the connection before the response completed")]
    Truncated,
}

/// Result of feeding bytes to the framing tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// All bytes belong to the response, more are expected.
    Incomplete,
    /// The response ends after this many of the fed bytes.
    Complete(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size { size: u64, in_ext: bool, digits: bool },
    Data(u64),
    DataEnd,
    TrailerStart,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Length(u64),
    Chunked(Chunk),
    UntilClose,
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Head,
    Body(Body),
    Done,
}

/// Incremental end-of-response detector.
#[derive(Debug, Default)]
pub struct ResponseFraming {
    phase: Phase,
    head: Vec<u8>,
    head_request: bool,
    status: Option<u16>,
    close_delimited: bool,
}

impl ResponseFraming {
    /// Prepare for a new response. `head_request` suppresses the body.
    pub fn reset(&mut self, head_request: bool) {
        self.phase = Phase::Head;
        self.head.clear();
        self.head_request = head_request;
        self.status = None;
        self.close_delimited = false;
    }

    /// Status code of the final response, once its head is parsed.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    /// The response ended on its own framing, so the connection may carry another.
    pub fn reusable(&self) -> bool {
        self.is_complete() && !self.close_delimited
    }

    /// Account for `bytes` read from the backend.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Feed, FramingError> {
        let mut pos = 0;
        while pos < bytes.len() {
            match self.phase {
                Phase::Done => return Ok(Feed::Complete(pos)),
                Phase::Head => pos += self.feed_head(&bytes[pos..])?,
                Phase::Body(body) => {
                    let (used, next) = feed_body(body, &bytes[pos..])?;
                    pos += used;
                    self.phase = next;
                }
            }
        }
        Ok(match self.phase {
            Phase::Done => Feed::Complete(pos),
            _ => Feed::Incomplete,
        })
    }

    /// The backend closed its side. `Ok` when that legitimately ends the response.
    pub fn on_eof(&mut self) -> Result<(), FramingError> {
        match self.phase {
            Phase::Done => Ok(()),
            Phase::Body(Body::UntilClose) => {
                self.phase = Phase::Done;
                Ok(())
            }
            _ => Err(FramingError::Truncated),
        }
    }

    fn feed_head(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        let already = self.head.len();
        self.head.extend_from_slice(bytes);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let head_len = match resp.parse(&self.head) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if self.head.len() > MAX_HEAD_BYTES {
                    return Err(FramingError::HeadTooLarge);
                }
                return Ok(bytes.len());
            }
            Err(e) => return Err(FramingError::Head(e.to_string())),
        };

        let status = resp.code.unwrap_or_default();
        let mut content_length = None;
        let mut chunked = false;
        for header in resp.headers.iter() {
            if header.name.eq_ignore_ascii_case("content-length") {
                let value = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| FramingError::Head("invalid content-length".into()))?;
                content_length = Some(value);
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = std::str::from_utf8(header.value)
                    .map(|v| v.to_ascii_lowercase().trim_end().ends_with("chunked"))
                    .unwrap_or(false);
            }
        }

        let used = head_len - already;
        self.head.clear();

        if (100..200).contains(&status) && status != 101 {
            // Interim response; the final one follows.
            return Ok(used);
        }

        self.status = Some(status);
        self.phase = if self.head_request || status == 204 || status == 304 {
            Phase::Done
        } else if status == 101 {
            self.close_delimited = true;
            Phase::Body(Body::UntilClose)
        } else if chunked {
            Phase::Body(Body::Chunked(Chunk::Size {
                size: 0,
                in_ext: false,
                digits: false,
            }))
        } else {
            match content_length {
                Some(0) => Phase::Done,
                Some(n) => Phase::Body(Body::Length(n)),
                None => {
                    self.close_delimited = true;
                    Phase::Body(Body::UntilClose)
                }
            }
        };
        Ok(used)
    }
}

fn feed_body(body: Body, bytes: &[u8]) -> Result<(usize, Phase), FramingError> {
    match body {
        Body::UntilClose => Ok((bytes.len(), Phase::Body(Body::UntilClose))),
        Body::Length(remaining) => {
            let take = remaining.min(bytes.len() as u64);
            let left = remaining - take;
            let next = if left == 0 {
                Phase::Done
            } else {
                Phase::Body(Body::Length(left))
            };
            Ok((take as usize, next))
        }
        Body::Chunked(state) => feed_chunked(state, bytes),
    }
}

fn feed_chunked(mut state: Chunk, bytes: &[u8]) -> Result<(usize, Phase), FramingError> {
    let mut pos = 0;
    while pos < bytes.len() {
        if let Chunk::Data(remaining) = state {
            let take = remaining.min((bytes.len() - pos) as u64);
            pos += take as usize;
            state = if remaining == take {
                Chunk::DataEnd
            } else {
                Chunk::Data(remaining - take)
            };
            continue;
        }

        let byte = bytes[pos];
        pos += 1;
        state = match (state, byte) {
            (Chunk::Size { size, digits, .. }, b'\n') => {
                if !digits {
                    return Err(FramingError::Chunked);
                }
                if size == 0 {
                    Chunk::TrailerStart
                } else {
                    Chunk::Data(size)
                }
            }
            (Chunk::Size { .. }, b'\r') => state,
            (Chunk::Size { in_ext: true, .. }, _) => state,
            (Chunk::Size { size, digits, .. }, b';') => Chunk::Size {
                size,
                in_ext: true,
                digits,
            },
            (Chunk::Size { size, digits, .. }, b' ' | b'\t') => Chunk::Size {
                size,
                in_ext: false,
                digits,
            },
            (Chunk::Size { size, .. }, b) => {
                let digit = (b as char).to_digit(16).ok_or(FramingError::Chunked)?;
                let size = size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add(u64::from(digit)))
                    .ok_or(FramingError::Chunked)?;
                Chunk::Size {
                    size,
                    in_ext: false,
                    digits: true,
                }
            }
            (Chunk::DataEnd, b'\r') => Chunk::DataEnd,
            (Chunk::DataEnd, b'\n') => Chunk::Size {
                size: 0,
                in_ext: false,
                digits: false,
            },
            (Chunk::DataEnd, _) => return Err(FramingError::Chunked),
            (Chunk::TrailerStart, b'\r') => Chunk::TrailerStart,
            (Chunk::TrailerStart, b'\n') => return Ok((pos, Phase::Done)),
            (Chunk::TrailerStart, _) => Chunk::Trailer,
            (Chunk::Trailer, b'\n') => Chunk::TrailerStart,
            (Chunk::Trailer, _) => Chunk::Trailer,
            (Chunk::Data(_), _) => unreachable!("data bytes are consumed in bulk"),
        };
    }
    Ok((pos, Phase::Body(Body::Chunked(state))))
}

/// HTTP status to answer a failed forward with, if any.
pub fn gateway_status(status: ForwardStatus) -> Option<(u16, &'static str)> {
    match status {
        ForwardStatus::Success | ForwardStatus::ClientDisconnected => None,
        ForwardStatus::AllocationFailure | ForwardStatus::NoBackend | ForwardStatus::Busy => {
            Some((503, "Service Unavailable"))
        }
        ForwardStatus::BackendUnreachable | ForwardStatus::IoError => Some((502, "Bad Gateway")),
    }
}

/// A minimal `Connection: close` response with a plain-text reason.
pub fn error_response(code: u16, reason: &str) -> Vec<u8> {
    let body = format!("{code} {reason}\n");
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framing() -> ResponseFraming {
        let mut f = ResponseFraming::default();
        f.reset(false);
        f
    }

    #[test]
    fn content_length_across_reads() {
        let mut f = framing();
        assert_eq!(f.feed(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap(), Feed::Incomplete);
        assert_eq!(f.feed(b"ngth: 5\r\n\r\nhel").unwrap(), Feed::Incomplete);
        assert_eq!(f.feed(b"lo").unwrap(), Feed::Complete(2));
        assert_eq!(f.status(), Some(200));
    }

    #[test]
    fn trailing_bytes_are_not_counted() {
        let mut f = framing();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA";
        assert_eq!(f.feed(raw).unwrap(), Feed::Complete(raw.len() - 5));
    }

    #[test]
    fn chunked_terminator() {
        let mut f = framing();
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(f.feed(head).unwrap(), Feed::Incomplete);
        assert_eq!(f.feed(b"4;ext=1\r\nwiki\r\n5\r\npe").unwrap(), Feed::Incomplete);
        assert_eq!(f.feed(b"dia\r\n0\r\n").unwrap(), Feed::Incomplete);
        assert_eq!(f.feed(b"X-Trailer: 1\r\n\r\n").unwrap(), Feed::Complete(16));
    }

    #[test]
    fn bad_chunk_size_is_an_error() {
        let mut f = framing();
        f.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(f.feed(b"zz\r\n").unwrap_err(), FramingError::Chunked);
    }

    #[test]
    fn close_delimited_ends_on_eof() {
        let mut f = framing();
        assert_eq!(f.feed(b"HTTP/1.0 200 OK\r\n\r\nstream").unwrap(), Feed::Incomplete);
        assert!(f.on_eof().is_ok());
        assert!(f.is_complete());
        assert!(!f.reusable());
    }

    #[test]
    fn truncated_length_body_on_eof() {
        let mut f = framing();
        f.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").unwrap();
        assert_eq!(f.on_eof().unwrap_err(), FramingError::Truncated);
    }

    #[test]
    fn interim_and_bodiless_responses() {
        let mut f = framing();
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        assert_eq!(f.feed(raw).unwrap(), Feed::Complete(raw.len()));
        assert_eq!(f.status(), Some(204));

        let mut head = ResponseFraming::default();
        head.reset(true);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\n";
        assert_eq!(head.feed(raw).unwrap(), Feed::Complete(raw.len()));
    }

    #[test]
    fn gateway_mapping() {
        assert_eq!(gateway_status(ForwardStatus::Success), None);
        assert_eq!(gateway_status(ForwardStatus::BackendUnreachable).unwrap().0, 502);
        assert_eq!(gateway_status(ForwardStatus::NoBackend).unwrap().0, 503);
        let resp = String::from_utf8(error_response(502, "Bad Gateway")).unwrap();
        assert!(resp.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(resp.ends_with("\r\n\r\n502 Bad Gateway\n"));
    }
}
