//! Web server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Memory Consumption
//!
//! Each active connection consumes memory according to:
//!
//! `Total` = [`Request Buffer`](crate::limits::ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](crate::limits::RespLimits#buffer-management) +
//!           `Runtime Overhead`
//!
//! See each component's documentation for details and configuration options.
//!
//! # Examples
//!
//! ```no_run
//! # embedded_http::impt_default_handler!{MyHandler}
//! use embedded_http::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 18,      // More headers for complex APIs
//!             body_size: 16 * 1024,  // 16KB for larger payloads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Strictness level gating every lenient parsing behavior.
///
/// Default policy bits derived from a single integer instead of a pile of
/// booleans: empty-line skipping before the request line, bare LF as CRLF,
/// bare CR treated as space, tab/VT/FF as whitespace, coalesced whitespace
/// blocks, whitespace inside the URI, NUL bytes treated as space, folded
/// header lines, leading whitespace on the first header line, whitespace
/// inside a header name, empty header names, whitespace before the colon,
/// a missing colon, lax cookie parsing, permissive duplicate `Host`, and
/// tolerating both `Content-Length` and `Transfer-Encoding` being present
/// (anti-smuggling: at strict level this is a hard `400`, at lenient level
/// `Content-Length` is ignored and the connection is forced to close).
///
/// This crate ships exactly two levels (see `DESIGN.md`), so a single
/// negative value enables every leniency at once rather than inventing
/// arbitrary intermediate cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Strictness(i8);

impl Strictness {
    /// Reject every leniency named above. The default.
    pub const STRICT: Strictness = Strictness(0);
    /// Accept every leniency named above.
    pub const LENIENT: Strictness = Strictness(-1);

    #[inline(always)]
    pub const fn is_lenient(self) -> bool {
        self.0 < 0
    }
}

impl Default for Strictness {
    fn default() -> Self {
        Strictness::STRICT
    }
}

/// Controls server-level concurrency, queueing, and performance behavior.
///
/// Configures how the server handles connection admission, worker pools,
/// and overload protection with tunable parameters for different workloads.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Queue if full? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [---------]   Yes   /--------------------------\   No   [------]
/// [ Handler ] <====== | Is there a free handler? | =====> [ Wait ]
/// [---------]         \--------------------------/        [------]
/// ```
///
/// The queue acts as a buffer between connection acceptance and processing.
/// Workers continuously poll the queue using the configured `wait_strategy`.
///
/// # Handler
/// A worker process is a continuously running asynchronous task, created once
/// during initialization (from [tokio::spawn]). It runs in an infinite loop,
/// processing connections from a shared queue, which is replenished by a TCP
/// listener. This design eliminates the need to create tasks for each connection,
/// allowing for efficient resource reuse across an unlimited number of connections.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent active connections being processed (default: `100`).
    ///
    /// When the server starts, exactly `max_connections` [handlers](#handler) are
    /// created and used (for [`Scheduling::InternalThreadPool`]) — see
    /// [`Scheduling`] for how the other scheduling modes use this value.
    pub max_connections: usize,

    /// Maximum number of TCP connections waiting in the admission queue (default: `250`).
    ///
    /// All accepted connections first go into this queue. Worker processes select
    /// connections from here. If the queue becomes full, new connections receive immediate
    /// HTTP `503` responses.
    ///
    /// For more information, see [Connection management](#connection-management).
    pub max_pending_connections: usize,

    /// Strategy for worker task waiting behavior (default: `Sleep(50µs)`)
    ///
    /// Controls how worker tasks wait when connection buffers are empty
    /// (the size is set by field `max_pending_connections`). Affects latency,
    /// CPU usage, and throughput characteristics.
    pub wait_strategy: WaitStrategy,

    /// Dedicated handlers for queue overflow responses (default: `1`).
    ///
    /// When the connection queue becomes full, these handlers immediately send
    /// responses with the [503](crate::StatusCode::ServiceUnavailable) code. Using
    /// multiple handlers prevents bottlenecks in scenarios with a large volume of
    /// rejected requests. Set to 0 to silently close the connection (not recommended
    /// for production HTTP servers).
    pub count_503_handlers: usize,

    /// Format for error responses (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    /// Which of the four scheduling modes this daemon runs under (default:
    /// [`Scheduling::InternalThreadPool`], a fixed worker-pool topology).
    pub scheduling: Scheduling,

    /// Strictness level for HTTP parsing (default: [`Strictness::STRICT`]).
    pub strictness: Strictness,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,
            scheduling: Scheduling::InternalThreadPool,
            strictness: Strictness::STRICT,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
///
/// Different strategies optimize for different workload patterns.
/// Choose based on your latency requirements and resource constraints.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// # Note
    /// According to personal measurements, when using this option, the CPU load
    /// is 97-99%, so I do not recommend using it.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

/// The four scheduling modes a daemon can run under. Fixed for the daemon's
/// lifetime once [`crate::Server::builder`] is built.
#[derive(Debug, Clone)]
pub enum Scheduling {
    /// The application drives the event loop itself; the library never
    /// spawns a thread or task. See [`crate::server::external`].
    ExternalEvents,
    /// One worker owns every connection; no queue, no pool.
    InternalSingleThread,
    /// A master task owns the listen socket and distributes accepted
    /// connections round-robin across `max_connections` worker tasks, each
    /// owning its own subset exclusively. This crate's default topology.
    InternalThreadPool,
    /// Each accepted connection gets its own dedicated task until close.
    ThreadPerConnection,
}

/// Connection-level limits and timeouts
///
/// Controls individual TCP connection behavior including timeouts,
/// lifetime, and request limits.
///
/// Default values balance performance, resource usage, and security.
/// Only change if you understand the consequences.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for reading data from socket (default: `2 seconds`)
    ///
    /// If no data is received within this time, connection is closed.
    /// This is the primary mechanism for cleaning up stalled connections.
    /// Prevents `slowloris attacks` and frees resources from inactive clients.
    pub socket_read_timeout: Duration,

    /// Maximum duration to wait for writing data to socket (default: `3 seconds`)
    ///
    /// If data can't be written in time, connection is terminated.
    /// Applies to individual write operations.
    pub socket_write_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`)
    ///
    /// Connection closes after processing this many requests.
    /// Helps prevent potential memory accumulation and maintains connection health.
    /// Combined with `connection_lifetime`, ensures connections don't live indefinitely.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of connection from establishment to closure (default: `2 minutes`)
    ///
    /// Final safety net that guarantees no connection lives longer than this duration.
    /// In practice, connections are typically cleaned up by `socket_read_timeout`
    /// or `max_requests_per_connection` long before this limit is reached.
    pub connection_lifetime: Duration,

    /// Maximum number of bytes buffered from `Expect: 100-continue` onward
    /// before a `BodyTooLarge` trips during chunked upload, independent of
    /// any single chunk's declared size (anti chunk-size-lying). Default: `1 MiB`.
    pub max_chunked_body_size: usize,

    /// Maximum number of trailer lines accepted after the terminating
    /// chunk (default: `8`).
    pub max_trailers: usize,

    /// Whether `101 Switching Protocols` upgrade responses are permitted on
    /// this connection pool (default: `true`). When `false`, a handler's
    /// [`Response::upgrade`](crate::Response::upgrade) still sends its
    /// response, but the connection is then closed ordinarily instead of
    /// being handed to `Handler::on_upgrade`.
    pub allow_upgrade: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(2),
            socket_write_timeout: Duration::from_secs(3),
            connection_lifetime: Duration::from_secs(120),
            max_requests_per_connection: 100,
            max_chunked_body_size: 1024 * 1024,
            max_trailers: 8,
            allow_upgrade: true,

            _priv: (),
        }
    }
}

/// HTTP request parsing limits and buffer pre-allocation strategy
///
/// ⚠️ **SECURITY-FIRST DEFAULTS**
///
/// These limits are intentionally conservative to prevent resource exhaustion
/// and various parsing attacks. They work well for:
/// - Simple REST APIs
/// - Microservices
/// - Internal tools
/// - Low-memory environments
///
/// 🔧 **You MAY need to increase these if you see:**
/// - `413 Payload Too Large` for legitimate requests
/// - `414 URI Too Long` for normal API calls
/// - `431 Request Header Fields Too Large`
///
/// # Memory Allocation Strategy
///
/// Each TCP connection pre-allocates a fixed-size buffer based on these limits,
/// using it as the initial head allocation of the connection's [`crate::pool::Pool`]
/// (the buffer grows in place from there, half of remaining free space at a
/// time, floored at 1.5 KiB).
///
/// ```text
/// Total Buffer = First Line + (Headers × Header Line) + Body + Overhead
/// ```
///
/// # Example
/// ```
/// use embedded_http::limits::ReqLimits;
///
/// let mut limits = ReqLimits::default();
/// let buffer_size = limits.estimated_buffer_size();
/// println!("Each connection needs {} bytes for data buffer", buffer_size);
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum URL length in bytes including path and query string (default: `256 B`)
    pub url_size: usize,
    /// Maximum number of path segments in URL (default: `8 segments`)
    pub url_parts: usize,
    /// Maximum query string length (default: `128`)
    pub url_query_size: usize,
    /// Maximum number of query parameters (default: `8`)
    pub url_query_parts: usize,

    /// Maximum number of headers per request (default: `16 headers`)
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64 B`)
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `512 B`)
    pub header_value_size: usize,

    /// Maximum request body size in bytes (default: `4 KB`)
    pub body_size: usize,

    /// Maximum number of cookies parsed out of a `Cookie` header (default: `16`).
    pub cookie_count: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 256,
            url_parts: 8,
            url_query_size: 128,
            url_query_parts: 8,

            header_count: 16,
            header_name_size: 64,
            header_value_size: 512,

            body_size: 4 * 1024,

            cookie_count: 16,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the estimated memory buffer size required per connection.
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        self.precalc.buffer = self.buffer();
        self.precalc.req_without_body = self.precalc.buffer - self.body_size;

        self
    }

    #[inline(always)]
    // First line + Header * N + "\r\n" + Body
    fn buffer(&self) -> usize {
        self.precalc.first_line + self.header_count * self.precalc.h_line + 2 + self.body_size
    }

    #[inline(always)]
    // CONNECT /url/test HTTP/1.1\r\n
    // Formula: Method(7) + " " + URl + " " + Version(8) + "\r\n"
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    // Authorization: Sample%20Data\r\n
    // Formula: Name + ": " + Value +  "\r\n"
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    pub(crate) req_without_body: usize,
    pub(crate) h_line: usize,
}

/// Configuration for response processing and memory allocation limits.
///
/// Controls how response buffers are allocated and managed to balance
/// memory usage and performance.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`)
    pub default_capacity: usize,
    /// Maximum allowed buffer capacity for responses (default: `8192 B`)
    pub max_capacity: usize,
    /// Block size used when streaming a file-backed response body
    /// (default: `8192 B`).
    pub file_block_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,
            file_block_size: 8 * 1024,

            _priv: (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictness_levels() {
        assert!(!Strictness::STRICT.is_lenient());
        assert!(Strictness::LENIENT.is_lenient());
        assert!(Strictness::default().eq(&Strictness::STRICT));
    }

    #[test]
    fn req_limits_precalculate_matches_manual_formula() {
        let limits = ReqLimits::default();
        let expected = (19 + limits.url_size)
            + limits.header_count * (limits.header_name_size + limits.header_value_size + 4)
            + 2
            + limits.body_size;
        assert_eq!(limits.estimated_buffer_size(), expected);
    }
}
