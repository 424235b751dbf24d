//! HTTP/1.1 handling at the edges of a forward.
//!
//! # Data Flow
//! ```text
//! client connection
//!     → request.rs  (read head + Content-Length body, enforce limits)
//!     → forward engine (head and body relayed verbatim to a backend)
//!     → response.rs (track response framing while bytes are relayed)
//!     → on failure before any byte reached the client: gateway error
//! ```

pub mod request;
pub mod response;

pub use request::{read_request, ProxyRequest, RequestError};
pub use response::{error_response, gateway_status, Feed, FramingError, ResponseFraming};
