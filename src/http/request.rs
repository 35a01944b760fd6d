//! Request-line/header/body parsing and the request half of the connection
//! state machine (C7).
//!
//! A `Parser` owns the connection's read buffer and a set of
//! `HttpConnection` methods consume it byte-range by byte-range using
//! `memchr`. The buffer is carved from a [`crate::pool::Pool`] instead of
//! being one fixed `Box<[u8]>` so it can grow, and parsing covers chunked
//! bodies, trailers, `Expect: 100-continue`, and a request-smuggling
//! resistance rule.

use crate::{
    errors::{select_overflow_status, ErrorKind},
    http::{
        action::{Action, UploadMode},
        cookie,
        query::Query,
        types::{self, Header, HeaderMap, Method, StatusCode, Url, Version},
    },
    limits::ReqLimits,
    pool::{End, Handle, Pool},
    server::{connection::ConnectionData, connection::HttpConnection, server_impl::Handler},
};
use memchr::memchr;
use std::net::SocketAddr;

/// Coarse-grained request-half states, up to `ReqRecvFinished` (the reply
/// half is `http::response::ResponseState`). Set at each milestone
/// `HttpConnection::parse` crosses — this crate parses synchronously once
/// enough of a given section is buffered (issuing more `fill_buffer` reads
/// only when a section is incomplete), so the states mark progress rather
/// than gating a byte-at-a-time resumable machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    Init,
    ReqLineReceiving,
    ReqLineReceived,
    ReqHeadersReceiving,
    HeadersReceived,
    HeadersProcessed,
    ContinueSending,
    BodyReceiving,
    BodyReceived,
    FootersReceiving,
    FootersReceived,
    FullReqReceived,
    ReqRecvFinished,
}

/// Declared body framing for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    FixedLength(usize),
    Chunked,
}

#[repr(align(128))]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) footers: Vec<Header>,
    pub(crate) cookies: Vec<(&'static [u8], &'static [u8])>,
    pub(crate) post_parts: Vec<(&'static [u8], &'static [u8])>,
    pub(crate) body: Option<&'static [u8]>,
    pub(crate) framing: BodyFraming,
    pub(crate) must_close: bool,
    pub(crate) expect_continue: bool,
    pub(crate) client_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
}

const UNSPECIFIED: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

impl Request {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            method: Method::Get,
            url: Url::new(limits),
            version: Version::Http11,
            headers: HeaderMap::new(limits.header_count),
            footers: Vec::new(),
            cookies: Vec::with_capacity(limits.cookie_count),
            post_parts: Vec::with_capacity(limits.url_query_parts),
            body: None,
            framing: BodyFraming::None,
            must_close: false,
            expect_continue: false,
            client_addr: UNSPECIFIED,
            server_addr: UNSPECIFIED,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.url.clear();
        self.headers.reset();
        self.footers.clear();
        self.cookies.clear();
        self.post_parts.clear();
        self.body = None;
        self.framing = BodyFraming::None;
        self.must_close = false;
        self.expect_continue = false;
    }
}

// Public accessors
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    #[inline(always)]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }

    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        matches!(self.framing, BodyFraming::Chunked)
    }

    #[inline(always)]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    #[inline(always)]
    pub const fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Footer (trailer) lines received after a chunked body's terminating
    /// chunk.
    #[inline(always)]
    pub fn footer(&self, name: &[u8]) -> Option<&[u8]> {
        self.footers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value)
    }

    #[inline(always)]
    pub fn cookie(&self, name: &[u8]) -> Option<&[u8]> {
        self.cookies.iter().find(|&&(n, _)| n == name).map(|&(_, v)| v)
    }

    #[inline(always)]
    pub fn cookies(&self) -> &[(&[u8], &[u8])] {
        &self.cookies
    }

    /// Entries decoded from an `application/x-www-form-urlencoded` body by
    /// the `PostProcess` application action.
    #[inline(always)]
    pub fn post(&self, key: &[u8]) -> Option<&[u8]> {
        self.post_parts.iter().find(|&&(k, _)| k == key).map(|&(_, v)| v)
    }
}

/// Owns the connection's read buffer, carved from the connection's
/// [`Pool`]. `position` is how much of the filled region has already been
/// consumed by parsing; `filled` is how much has been read off the socket.
/// `upload` is a second, tail-end allocation used only to accumulate a
/// chunked body's decoded bytes (the optional large-buffer handle for a
/// buffered upload).
pub(crate) struct Parser {
    pool: Pool,
    read: Handle,
    upload: Handle,
    position: usize,
    filled: usize,
    has_crlf: bool,
}

impl Parser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            pool: Pool::new(limits.precalc.buffer),
            read: Handle::EMPTY,
            upload: Handle::EMPTY,
            position: 0,
            filled: 0,
            has_crlf: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn from(limits: &ReqLimits, value: impl AsRef<[u8]>) -> Self {
        let bytes = value.as_ref();
        let mut pool = Pool::new(limits.precalc.buffer.max(bytes.len()));
        let read = pool.allocate(bytes.len(), End::Head).expect("test fixture fits in pool");
        pool.get_mut(read).copy_from_slice(bytes);
        Self { pool, read, upload: Handle::EMPTY, position: 0, filled: bytes.len(), has_crlf: true }
    }

    pub(crate) fn reset(&mut self) {
        self.pool.reset();
        self.read = Handle::EMPTY;
        self.upload = Handle::EMPTY;
        self.position = 0;
        self.filled = 0;
        self.has_crlf = true;
    }

    #[inline(always)]
    pub(crate) fn unconsumed(&self) -> usize {
        self.filled - self.position
    }

    /// Grows the read buffer: half of free space on first need, one-eighth
    /// of remaining free thereafter, floored at 1.5 KiB unless that would
    /// overrun the pool, only ever in place.
    fn grow_to_fit(&mut self, want_total: usize) -> Result<(), ErrorKind> {
        if want_total <= self.read.len() {
            return Ok(());
        }
        let free = self.pool.get_free();
        let current = self.read.len();
        let min_increment: usize = 1536;
        let preferred = if current == 0 { free / 2 } else { free / 8 };
        let needed = want_total - current;
        let increment = preferred.max(min_increment).max(needed).min(free);
        let new_len = current + increment;

        if new_len < want_total {
            return Err(ErrorKind::BodyTooLarge);
        }

        self.read = self
            .pool
            .reallocate(self.read, new_len, End::Head)
            .map_err(|_| ErrorKind::BodyTooLarge)?;
        Ok(())
    }

    /// Reads more bytes from the socket into the tail of the filled region,
    /// growing the buffer first if it's already full. Returns the number of
    /// bytes read (`0` means the peer performed an orderly shutdown).
    pub(crate) async fn fill_buffer<IO>(
        &mut self,
        stream: &mut IO,
        timeout: std::time::Duration,
    ) -> Result<usize, ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        if self.filled == self.read.len() {
            self.grow_to_fit(self.filled + 1536)?;
        }

        let read_result = tokio::select! {
            biased;
            result = stream.read(&mut self.pool.get_mut(self.read)[self.filled..]) => result,
            _ = tokio::time::sleep(timeout) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
        };

        let n = read_result.map_err(ErrorKind::from)?;
        self.filled += n;
        Ok(n)
    }

    #[inline(always)]
    fn remaining(&self) -> &[u8] {
        &self.pool.get(self.read)[self.position..self.filled]
    }

    /// The bytes already read off the socket but not yet consumed by request
    /// parsing — the prefix an `on_upgrade` handoff needs to replay before
    /// reading anything further from the socket itself.
    pub(crate) fn unconsumed_bytes(&self) -> &[u8] {
        self.remaining()
    }

    #[inline(always)]
    fn advance(&mut self, n: usize) {
        self.position += n;
    }

    /// SAFETY: borrows a slice of the connection's pool with a `'static`
    /// lifetime. The pool outlives every reference handed out from it for
    /// the lifetime of the connection, and is fully zeroed on reset before
    /// the next request reuses the same bytes — so a caller that (against
    /// the documented contract) holds on to a returned slice past the
    /// connection's next reset sees zeros, not another request's data, and
    /// never reads freed memory. Do not widen this beyond Parser-owned
    /// bytes without re-auditing every call site.
    unsafe fn into_static(src: &[u8]) -> &'static [u8] {
        unsafe { std::mem::transmute(src) }
    }

    fn append_upload(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        let old_len = self.upload.len();
        let new_len = old_len + bytes.len();
        self.upload = if self.upload.is_empty() {
            self.pool.allocate(new_len, End::Tail)
        } else {
            self.pool.reallocate(self.upload, new_len, End::Tail)
        }
        .map_err(|_| ErrorKind::BodyTooLarge)?;
        self.pool.get_mut(self.upload)[old_len..new_len].copy_from_slice(bytes);
        Ok(())
    }
}

impl<H, S> HttpConnection<H, S>
where
    H: Handler<S>,
    S: ConnectionData,
{
    /// Parses one full HTTP/1.x request (request line through body and any
    /// trailers), issuing additional socket reads as needed.
    pub(crate) async fn parse<IO>(&mut self, stream: &mut IO) -> Result<Version, ErrorKind>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        self.state = RequestState::ReqLineReceiving;
        eprintln!("DEBUG parse start: filled={} position={} remaining={:?}", self.parser.filled, self.parser.position, String::from_utf8_lossy(self.parser.remaining()));
        self.ensure_line(stream, true).await?;

        let remaining = self.parser.remaining();
        let (method, _) = Method::from_bytes(remaining)?;
        let sp = memchr(b' ', remaining).ok_or(ErrorKind::InvalidMethod)?;
        self.request.method = method;
        self.parser.advance(sp + 1);

        self.state = RequestState::ReqLineReceived;
        self.parse_url()?;

        let version_line = self.take_line(stream, false).await?;
        let version = self.check_version(version_line)?;
        self.request.version = version;

        self.state = RequestState::ReqHeadersReceiving;
        self.parse_headers(stream).await?;
        self.state = RequestState::HeadersReceived;

        self.process_headers()?;
        self.state = RequestState::HeadersProcessed;

        let mut action = self.handler.on_headers(&mut self.connection_data, &self.request);
        if let Action::Suspend(notify) = action {
            notify.notified().await;
            action = Action::Response;
        }
        if matches!(action, Action::Abort) {
            return Err(ErrorKind::Aborted);
        }

        if self.request.expect_continue && self.request.version == Version::Http11 {
            self.state = RequestState::ContinueSending;
            self.send_continue(stream).await?;
        }

        self.state = RequestState::BodyReceiving;
        match action {
            Action::Upload(mode) => self.read_body_streaming(stream, mode).await?,
            _ => match self.request.framing {
                BodyFraming::None => {}
                BodyFraming::FixedLength(len) => self.read_fixed_body(stream, len).await?,
                BodyFraming::Chunked => self.read_chunked_body(stream).await?,
            },
        }
        self.state = RequestState::BodyReceived;

        if matches!(self.request.framing, BodyFraming::Chunked) {
            self.state = RequestState::FootersReceiving;
            self.read_trailers(stream).await?;
            self.state = RequestState::FootersReceived;
        }

        if matches!(action, Action::PostProcess) {
            self.post_process()?;
        }

        self.state = RequestState::FullReqReceived;
        self.state = RequestState::ReqRecvFinished;
        Ok(version)
    }

    /// Ensures at least one full CRLF/LF-terminated line is buffered,
    /// reading more from the socket as needed. `receiving_uri` picks which
    /// overflow status a buffer-exhaustion error resolves to: set only for
    /// the request line itself, `false` for every header/trailer line.
    async fn ensure_line<IO>(&mut self, stream: &mut IO, receiving_uri: bool) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        loop {
            if memchr(b'\n', self.parser.remaining()).is_some() {
                return Ok(());
            }
            eprintln!("DEBUG ensure_line loop: remaining={:?}", String::from_utf8_lossy(self.parser.remaining()));
            let n = match self.parser.fill_buffer(stream, self.conn_limits.socket_read_timeout).await {
                Ok(n) => n,
                Err(err) => return Err(self.remap_overflow(err, receiving_uri, false)),
            };
            if n == 0 {
                eprintln!("DEBUG ensure_line EOF: remaining={:?}", String::from_utf8_lossy(self.parser.remaining()));
                return Err(ErrorKind::InvalidMethod);
            }
        }
    }

    /// Resolves a `BodyTooLarge` surfaced by buffer growth into the
    /// specific 414/431/501/413 the overflow actually means, given what was
    /// being received when the buffer ran out. Any other error passes
    /// through untouched.
    fn remap_overflow(&self, err: ErrorKind, receiving_uri: bool, chunk_extension_present: bool) -> ErrorKind {
        if err != ErrorKind::BodyTooLarge {
            return err;
        }
        let looks_like_standard_method = Method::from_bytes(self.parser.remaining()).is_ok();
        let optional_headers_size: usize =
            self.request.headers.headers.iter().map(|h| h.name.len() + h.value.len()).sum();
        let uri_size =
            if receiving_uri { self.parser.unconsumed() } else { self.request.url.target.len() };
        select_overflow_status(
            receiving_uri,
            looks_like_standard_method,
            chunk_extension_present,
            optional_headers_size,
            uri_size,
        )
        .unwrap_or(ErrorKind::MethodNotImplemented)
    }

    /// Consumes and returns one line (without its terminator), honoring the
    /// strictness-gated bare-LF leniency. `fold` enables RFC 7230 obsolete
    /// line folding: at lenient strictness, a continuation line (one
    /// starting with SP/HTAB) is merged into the line just returned rather
    /// than treated as the next header. Only header and trailer lines fold;
    /// the request line and chunk framing lines never do.
    async fn take_line<IO>(&mut self, stream: &mut IO, fold: bool) -> Result<&'static [u8], ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        self.ensure_line(stream, false).await?;
        let remaining = self.parser.remaining();
        let nl = memchr(b'\n', remaining).expect("ensure_line guarantees a newline");

        let (line, has_crlf) = if nl > 0 && remaining[nl - 1] == b'\r' {
            (&remaining[..nl - 1], true)
        } else if self.server_limits.strictness.is_lenient() {
            (&remaining[..nl], false)
        } else {
            return Err(ErrorKind::InvalidHeader);
        };
        // SAFETY: see `Parser::into_static`.
        let line = unsafe { Parser::into_static(line) };
        self.parser.advance(nl + 1);
        self.parser.has_crlf = has_crlf;

        if !fold {
            return Ok(line);
        }

        let mut folded: Option<Vec<u8>> = None;
        loop {
            self.ensure_line(stream, false).await?;
            match self.parser.remaining().first() {
                Some(b' ' | b'\t') => {
                    if !self.server_limits.strictness.is_lenient() {
                        return Err(ErrorKind::InvalidHeader);
                    }
                }
                _ => break,
            }

            let remaining = self.parser.remaining();
            let nl = memchr(b'\n', remaining).expect("ensure_line guarantees a newline");
            let (cont, has_crlf) = if nl > 0 && remaining[nl - 1] == b'\r' {
                (&remaining[..nl - 1], true)
            } else {
                (&remaining[..nl], false)
            };
            let buf = folded.get_or_insert_with(|| line.to_vec());
            buf.push(b' ');
            buf.extend_from_slice(trim_ascii_whitespace(cont));
            self.parser.advance(nl + 1);
            self.parser.has_crlf = has_crlf;
        }

        match folded {
            Some(buf) => Ok(buf.leak()),
            None => Ok(line),
        }
    }

    fn check_version(&self, line: &'static [u8]) -> Result<Version, ErrorKind> {
        match line.len() {
            8 => Ok(Version::from_bytes(line)?.0),
            _ => Err(ErrorKind::UnsupportedVersion),
        }
    }

    fn parse_url(&mut self) -> Result<(), ErrorKind> {
        let remaining_len = self.parser.remaining().len();
        let sp = memchr(b' ', self.parser.remaining()).ok_or(ErrorKind::InvalidUrl)?;
        if sp == 0 || sp > self.req_limits.url_size {
            return Err(ErrorKind::UriTooLong);
        }
        debug_assert!(sp < remaining_len);

        let start = self.parser.position;
        let raw = &mut self.parser.pool.get_mut(self.parser.read)[start..start + sp];

        // Only the path is decoded in place here; a literal '?' found before
        // decoding is the query separator, one produced by decoding a `%3F`
        // escape is not. The query string itself is left percent-encoded —
        // `Query::parse` decodes each key/value as it splits them out.
        let raw_path_len = memchr(b'?', raw).unwrap_or(raw.len());
        let path_len = crate::http::percent::decode_in_place(&mut raw[..raw_path_len]);
        let suffix_len = raw.len() - raw_path_len;
        raw.copy_within(raw_path_len.., path_len);
        let total_len = path_len + suffix_len;

        // SAFETY: see `Parser::into_static`.
        let target: &'static [u8] = unsafe { Parser::into_static(&raw[..total_len]) };

        if target.first() != Some(&b'/') && target != b"*" {
            return Err(ErrorKind::InvalidUrl);
        }

        let path = &target[..path_len];
        let query = (suffix_len > 0).then(|| &target[path_len + 1..]);

        let part_count = path.split(|&b| b == b'/').filter(|s| !s.is_empty()).count();
        if part_count > self.req_limits.url_parts {
            return Err(ErrorKind::InvalidUrl);
        }

        self.request.url.target = target;
        self.request.url.path = path;
        self.request.url.parts = path.split(|&b| b == b'/').filter(|s| !s.is_empty()).collect();

        if let Some(q) = query {
            if q.len() > self.req_limits.url_query_size {
                return Err(ErrorKind::UriTooLong);
            }
            self.request.url.query = Some(&target[path_len..]);
            self.request.url.query_parts =
                Query::parse(q, self.req_limits.url_query_parts).map_err(ErrorKind::from)?;
        }

        self.parser.advance(sp + 1);
        Ok(())
    }

    async fn parse_headers<IO>(&mut self, stream: &mut IO) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        for _ in 0..=self.req_limits.header_count {
            let line = self.take_line(stream, true).await?;
            if line.is_empty() {
                return Ok(());
            }
            if self.request.headers.headers.len() >= self.req_limits.header_count {
                return Err(ErrorKind::TooManyHeaders);
            }
            let header = self.parse_header_line(line)?;
            self.request.headers.headers.push(header);
        }
        Err(ErrorKind::TooManyHeaders)
    }

    /// Shared by headers and trailers: line parsing is identical between the
    /// two, they differ only in which error each one reports.
    fn parse_header_line(&self, line: &'static [u8]) -> Result<Header, ErrorKind> {
        let lenient = self.server_limits.strictness.is_lenient();
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;

        let mut name = &line[..colon];
        if lenient {
            name = trim_ascii_whitespace(name);
        }
        if name.is_empty() || name.len() > self.req_limits.header_name_size {
            return Err(ErrorKind::InvalidHeader);
        }
        if !lenient && name.iter().any(|&b| b == b' ' || b == b'\t') {
            return Err(ErrorKind::InvalidHeader);
        }

        let value = trim_ascii_whitespace(&line[colon + 1..]);
        if value.len() > self.req_limits.header_value_size {
            return Err(ErrorKind::InvalidHeader);
        }

        let mut lowered = name.to_vec();
        types::to_lower_case(&mut lowered);
        let lowered: &'static [u8] = lowered.leak();

        Ok(Header::new(lowered, value))
    }

    fn process_headers(&mut self) -> Result<(), ErrorKind> {
        let lenient = self.server_limits.strictness.is_lenient();

        let host_count = self.request.headers.headers.iter().filter(|h| h.name == b"host").count();
        if host_count > 1 && !lenient {
            return Err(ErrorKind::DuplicateHost);
        }

        let content_length_values: Vec<&[u8]> =
            self.request.headers.headers.iter().filter(|h| h.name == b"content-length").map(|h| h.value).collect();
        if content_length_values.len() > 1 {
            let all_agree = content_length_values.windows(2).all(|w| w[0] == w[1]);
            if !lenient || !all_agree {
                return Err(ErrorKind::DuplicateContentLength);
            }
        }

        let content_length = self.request.header(b"content-length").map(str_to_len).transpose()?;
        let transfer_encoding = self.request.header(b"transfer-encoding");
        let has_chunked = matches!(transfer_encoding, Some(v) if v.eq_ignore_ascii_case(b"chunked"));
        if transfer_encoding.is_some() && !has_chunked {
            return Err(ErrorKind::InvalidTransferEncoding);
        }

        self.request.framing = match (content_length, has_chunked) {
            (Some(_), true) if !lenient => return Err(ErrorKind::SmugglingAttempt),
            (Some(_), true) => {
                self.request.must_close = true;
                BodyFraming::Chunked
            }
            (None, true) => BodyFraming::Chunked,
            (Some(len), false) => BodyFraming::FixedLength(len),
            (None, false) => BodyFraming::None,
        };
        self.request.headers.content_length = content_length;

        if let Some(connection) = self.request.header(b"connection") {
            if connection.eq_ignore_ascii_case(b"close") {
                self.request.must_close = true;
                self.response.keep_alive = false;
            } else if connection.eq_ignore_ascii_case(b"keep-alive") {
                self.response.keep_alive = true;
            } else if !lenient {
                return Err(ErrorKind::InvalidConnection);
            }
        }

        if let Some(expect) = self.request.header(b"expect") {
            self.request.expect_continue = expect.eq_ignore_ascii_case(b"100-continue");
        }

        if let Some(cookie_header) = self.request.header(b"cookie") {
            // SAFETY: see `Parser::into_static`.
            let cookie_header = unsafe { Parser::into_static(cookie_header) };
            let cookies = cookie::parse(cookie_header, self.server_limits.strictness)?;
            for c in cookies.into_iter().take(self.req_limits.cookie_count) {
                // SAFETY: see `Parser::into_static`.
                self.request.cookies.push(unsafe {
                    (Parser::into_static(c.name), Parser::into_static(c.value))
                });
            }
        }

        Ok(())
    }

    async fn send_continue<IO>(&mut self, stream: &mut IO) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;
        let line = StatusCode::Continue.into_first_line(self.request.version);
        let write = async {
            stream.write_all(line).await?;
            stream.write_all(b"\r\n").await
        };
        tokio::select! {
            biased;
            result = write => result.map_err(ErrorKind::from),
            _ = tokio::time::sleep(self.conn_limits.socket_write_timeout) => {
                Err(ErrorKind::from(std::io::Error::from(std::io::ErrorKind::TimedOut)))
            }
        }
    }

    async fn read_fixed_body<IO>(&mut self, stream: &mut IO, len: usize) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        if len > self.req_limits.body_size {
            return Err(ErrorKind::BodyTooLarge);
        }
        while self.parser.unconsumed() < len {
            let n = self.parser.fill_buffer(stream, self.conn_limits.socket_read_timeout).await?;
            if n == 0 {
                return Err(ErrorKind::BodyMismatch {
                    expected: len,
                    available: self.parser.unconsumed(),
                });
            }
        }
        let body = &self.parser.remaining()[..len];
        // SAFETY: see `Parser::into_static`.
        self.request.body = Some(unsafe { Parser::into_static(body) });
        self.parser.advance(len);
        Ok(())
    }

    /// `Upload` application action: delivers the body straight to
    /// `Handler::on_upload_chunk`/`Handler::on_upload_complete` instead of
    /// buffering it into `Request::body()`.
    async fn read_body_streaming<IO>(&mut self, stream: &mut IO, mode: UploadMode) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        match mode {
            UploadMode::Full => {
                match self.request.framing {
                    BodyFraming::None => {}
                    BodyFraming::FixedLength(len) => self.read_fixed_body(stream, len).await?,
                    BodyFraming::Chunked => self.read_chunked_body(stream).await?,
                }
                let body = self.request.body.unwrap_or(&[]);
                self.handler.on_upload_complete(&mut self.connection_data, body).await;
            }
            UploadMode::Incremental { max_buffered } => {
                match self.request.framing {
                    BodyFraming::None => {}
                    BodyFraming::FixedLength(len) => {
                        self.stream_fixed_body(stream, len, max_buffered).await?;
                    }
                    BodyFraming::Chunked => self.stream_chunked_body(stream, max_buffered).await?,
                }
                self.handler.on_upload_chunk(&mut self.connection_data, &[]).await;
            }
        }
        Ok(())
    }

    async fn stream_fixed_body<IO>(&mut self, stream: &mut IO, len: usize, max_buffered: usize) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        if len > self.req_limits.body_size {
            return Err(ErrorKind::BodyTooLarge);
        }
        let step = max_buffered.max(1);
        let mut remaining = len;
        while remaining > 0 {
            if self.parser.unconsumed() == 0 {
                let n = self.parser.fill_buffer(stream, self.conn_limits.socket_read_timeout).await?;
                if n == 0 {
                    return Err(ErrorKind::BodyMismatch { expected: len, available: 0 });
                }
            }
            let take = remaining.min(self.parser.unconsumed()).min(step);
            let chunk = self.parser.remaining()[..take].to_vec();
            self.parser.advance(take);
            remaining -= take;
            self.handler.on_upload_chunk(&mut self.connection_data, &chunk).await;
        }
        Ok(())
    }

    async fn stream_chunked_body<IO>(&mut self, stream: &mut IO, max_buffered: usize) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        let step = max_buffered.max(1);
        let mut total = 0usize;
        loop {
            let line = self.take_line(stream, false).await?;
            let (size_bytes, has_extension) = match memchr(b';', line) {
                Some(pos) => (&line[..pos], true),
                None => (line, false),
            };
            let chunk_size = parse_hex(size_bytes).ok_or(ErrorKind::InvalidChunkSize)?;

            total += chunk_size;
            if total > self.conn_limits.max_chunked_body_size {
                return Err(if has_extension { ErrorKind::ChunkTooLarge } else { ErrorKind::BodyTooLarge });
            }

            if chunk_size == 0 {
                self.consume_terminator(stream).await?;
                break;
            }

            let mut remaining = chunk_size;
            while remaining > 0 {
                if self.parser.unconsumed() == 0 {
                    let n = match self.parser.fill_buffer(stream, self.conn_limits.socket_read_timeout).await {
                        Ok(n) => n,
                        Err(err) => return Err(self.remap_overflow(err, false, has_extension)),
                    };
                    if n == 0 {
                        return Err(ErrorKind::BodyMismatch { expected: chunk_size, available: 0 });
                    }
                }
                let take = remaining.min(self.parser.unconsumed()).min(step);
                let piece = self.parser.remaining()[..take].to_vec();
                self.parser.advance(take);
                remaining -= take;
                self.handler.on_upload_chunk(&mut self.connection_data, &piece).await;
            }
            self.consume_terminator(stream).await?;
        }
        Ok(())
    }

    async fn read_chunked_body<IO>(&mut self, stream: &mut IO) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        loop {
            let line = self.take_line(stream, false).await?;
            let (size_bytes, has_extension) = match memchr(b';', line) {
                Some(pos) => (&line[..pos], true),
                None => (line, false),
            };
            let chunk_size = parse_hex(size_bytes).ok_or(ErrorKind::InvalidChunkSize)?;

            if self.parser.upload.len() + chunk_size > self.conn_limits.max_chunked_body_size {
                return Err(if has_extension { ErrorKind::ChunkTooLarge } else { ErrorKind::BodyTooLarge });
            }

            if chunk_size == 0 {
                self.consume_terminator(stream).await?;
                break;
            }

            while self.parser.unconsumed() < chunk_size + 2 {
                let n = match self.parser.fill_buffer(stream, self.conn_limits.socket_read_timeout).await {
                    Ok(n) => n,
                    Err(err) => return Err(self.remap_overflow(err, false, has_extension)),
                };
                if n == 0 {
                    return Err(ErrorKind::BodyMismatch { expected: chunk_size, available: self.parser.unconsumed() });
                }
            }

            let chunk = self.parser.remaining()[..chunk_size].to_vec();
            self.parser.append_upload(&chunk)?;
            self.parser.advance(chunk_size);
            self.consume_terminator(stream).await?;
        }

        let body = self.parser.pool.get(self.parser.upload);
        // SAFETY: see `Parser::into_static`.
        self.request.body = Some(unsafe { Parser::into_static(body) });
        Ok(())
    }

    async fn consume_terminator<IO>(&mut self, stream: &mut IO) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        let line = self.take_line(stream, false).await?;
        if !line.is_empty() {
            return Err(ErrorKind::InvalidChunkSize);
        }
        Ok(())
    }

    async fn read_trailers<IO>(&mut self, stream: &mut IO) -> Result<(), ErrorKind>
    where
        IO: tokio::io::AsyncRead + Unpin,
    {
        for _ in 0..=self.conn_limits.max_trailers {
            let line = self.take_line(stream, true).await?;
            if line.is_empty() {
                return Ok(());
            }
            if self.request.footers.len() >= self.conn_limits.max_trailers {
                return Err(ErrorKind::TooManyTrailers);
            }
            let header = self.parse_header_line(line).map_err(|_| ErrorKind::InvalidTrailer)?;
            self.request.footers.push(header);
        }
        Err(ErrorKind::TooManyTrailers)
    }

    /// `PostProcess` application action: decodes an
    /// `application/x-www-form-urlencoded` body into `post-arg` field-list
    /// entries, reusing the same percent-decoder and `Query` parser the
    /// query string already goes through.
    pub(crate) fn post_process(&mut self) -> Result<(), ErrorKind> {
        let is_form = self
            .request
            .header(b"content-type")
            .is_some_and(|v| v.eq_ignore_ascii_case(b"application/x-www-form-urlencoded"));
        let Some(body) = self.request.body else { return Ok(()) };
        if !is_form || body.is_empty() {
            return Ok(());
        }

        // `application/x-www-form-urlencoded` also maps a literal '+' to a
        // space, on top of the percent-decoding `Query::parse` already does
        // — a rule specific to form bodies, not to query strings in general.
        let mut owned = body.to_vec();
        for b in &mut owned {
            if *b == b'+' {
                *b = b' ';
            }
        }
        let leaked: &'static [u8] = owned.leak();

        self.request.post_parts =
            Query::parse(leaked, self.req_limits.url_query_parts).map_err(ErrorKind::from)?;
        Ok(())
    }
}

fn trim_ascii_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn str_to_len(bytes: &[u8]) -> Result<usize, ErrorKind> {
    types::slice_to_usize(bytes).ok_or(ErrorKind::InvalidContentLength)
}

fn parse_hex(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for &b in bytes {
        let digit = (b as char).to_digit(16)? as usize;
        result = result.checked_mul(16)?.checked_add(digit)?;
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::def_handler::DefHandler;

    type TestConn = HttpConnection<DefHandler, ()>;

    /// A no-op stream used where `parse`'s `IO` bound requires `AsyncWrite`
    /// but the test only exercises already-buffered bytes and never reads
    /// or writes through it.
    struct EmptyStream;

    impl tokio::io::AsyncRead for EmptyStream {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl tokio::io::AsyncWrite for EmptyStream {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn parses_simple_get() {
        let mut conn = TestConn::from_req(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut stream = EmptyStream;
        let version = conn.parse(&mut stream).await.unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(conn.request.url.path(), b"/hello");
        assert_eq!(conn.request.header(b"host"), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn rejects_both_content_length_and_chunked_at_strict() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let mut stream = EmptyStream;
        let err = conn.parse(&mut stream).await.unwrap_err();
        assert_eq!(err, ErrorKind::SmugglingAttempt);
    }

    #[tokio::test]
    async fn lenient_smuggling_ignores_content_length() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        conn.server_limits.strictness = crate::limits::Strictness::LENIENT;
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert!(conn.request.must_close);
        assert_eq!(conn.request.body(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn chunked_upload_accumulates_in_order() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert_eq!(conn.request.body(), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn zero_length_chunked_body() {
        let mut conn =
            TestConn::from_req(b"POST /x HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n");
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert_eq!(conn.request.body(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn trailers_after_terminating_chunk() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n0\r\nx-trailer: v\r\n\r\n",
        );
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert_eq!(conn.request.footer(b"x-trailer"), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn overflowing_content_length_is_rejected() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 18446744073709551615\r\n\r\n",
        );
        let mut stream = EmptyStream;
        let err = conn.parse(&mut stream).await.unwrap_err();
        assert_eq!(err, ErrorKind::InvalidContentLength);
    }

    #[tokio::test]
    async fn bare_lf_rejected_when_strict() {
        let mut conn = TestConn::from_req(b"GET / HTTP/1.1\nHost: x\n\n");
        let mut stream = EmptyStream;
        assert!(conn.parse(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn percent_decodes_target() {
        let mut conn = TestConn::from_req(b"GET /hello%20world HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert_eq!(conn.request.url.path(), b"/hello world");
    }

    #[tokio::test]
    async fn parses_cookies_lax() {
        let mut conn = TestConn::from_req(b"GET / HTTP/1.1\r\nHost: x\r\nCookie: a=1; b=2\r\n\r\n");
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert_eq!(conn.request.cookie(b"a"), Some(&b"1"[..]));
        assert_eq!(conn.request.cookie(b"b"), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn post_process_decodes_form_body() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 13\r\n\r\na=hello+world",
        );
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        conn.post_process().unwrap();
        assert_eq!(conn.request.post(b"a"), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn duplicate_content_length_rejected_at_strict() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\nhello",
        );
        let mut stream = EmptyStream;
        let err = conn.parse(&mut stream).await.unwrap_err();
        assert_eq!(err, ErrorKind::DuplicateContentLength);
    }

    #[tokio::test]
    async fn duplicate_agreeing_content_length_accepted_when_lenient() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\nhello",
        );
        conn.server_limits.strictness = crate::limits::Strictness::LENIENT;
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert_eq!(conn.request.body(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn duplicate_disagreeing_content_length_rejected_even_lenient() {
        let mut conn = TestConn::from_req(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\nhello",
        );
        conn.server_limits.strictness = crate::limits::Strictness::LENIENT;
        let mut stream = EmptyStream;
        let err = conn.parse(&mut stream).await.unwrap_err();
        assert_eq!(err, ErrorKind::DuplicateContentLength);
    }

    #[tokio::test]
    async fn folded_header_line_merged_when_lenient() {
        let mut conn = TestConn::from_req(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: first\r\n second\r\n\r\n",
        );
        conn.server_limits.strictness = crate::limits::Strictness::LENIENT;
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();
        assert_eq!(conn.request.header(b"x-long"), Some(&b"first second"[..]));
    }

    #[tokio::test]
    async fn folded_header_line_rejected_when_strict() {
        let mut conn = TestConn::from_req(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: first\r\n second\r\n\r\n",
        );
        let mut stream = EmptyStream;
        assert!(conn.parse(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn oversize_request_line_maps_to_uri_too_long() {
        let mut line = b"GET ".to_vec();
        line.extend(std::iter::repeat(b'A').take(20_000));
        let mut conn = TestConn::from_req(line);
        let mut stream = EmptyStream;
        let err = conn.parse(&mut stream).await.unwrap_err();
        assert_eq!(err, ErrorKind::UriTooLong);
    }

    #[tokio::test]
    async fn action_abort_closes_without_response() {
        use crate::http::action::Action;
        use crate::{Handled, Response, StatusCode};

        struct AbortHandler;
        impl Handler<()> for AbortHandler {
            async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
                r.status(StatusCode::Ok).body("unreachable")
            }
            fn on_headers(&self, _: &mut (), _: &Request) -> Action {
                Action::Abort
            }
        }

        let mut conn = HttpConnection::<AbortHandler, ()>::from_req_with(
            AbortHandler,
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let mut stream = EmptyStream;
        let err = conn.parse(&mut stream).await.unwrap_err();
        assert_eq!(err, ErrorKind::Aborted);
    }

    #[tokio::test]
    async fn action_upload_streams_chunks_to_handler() {
        use crate::http::action::{Action, UploadMode};
        use crate::{Handled, Response, StatusCode};
        use std::sync::{Arc, Mutex};

        struct UploadCapture(Arc<Mutex<Vec<Vec<u8>>>>);
        impl Handler<()> for UploadCapture {
            async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
                r.status(StatusCode::Ok).body("ok")
            }
            fn on_headers(&self, _: &mut (), _: &Request) -> Action {
                Action::Upload(UploadMode::Incremental { max_buffered: 4 })
            }
            async fn on_upload_chunk(&self, _: &mut (), chunk: &[u8]) {
                self.0.lock().unwrap().push(chunk.to_vec());
            }
        }

        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut conn = HttpConnection::<UploadCapture, ()>::from_req_with(
            UploadCapture(captured.clone()),
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world",
        );
        let mut stream = EmptyStream;
        conn.parse(&mut stream).await.unwrap();

        let chunks = captured.lock().unwrap();
        let joined: Vec<u8> = chunks.iter().flatten().copied().collect();
        assert_eq!(joined, b"hello world");
        assert_eq!(chunks.last(), Some(&Vec::new()));
    }
}
