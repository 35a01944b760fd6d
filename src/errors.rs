use crate::http::cookie;
use crate::{query, Version};
use std::{error, fmt, io};

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,

    InvalidUrl,
    #[allow(dead_code)]
    Query(query::Error),
    UriTooLong,

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    HeaderFieldsTooLarge,
    InvalidContentLength,
    InvalidConnection,
    DuplicateHost,
    DuplicateContentLength,
    #[allow(dead_code)]
    InvalidCookie(cookie::Error),

    InvalidTransferEncoding,
    SmugglingAttempt,
    InvalidChunkSize,
    ChunkTooLarge,
    TooManyTrailers,
    InvalidTrailer,

    BodyTooLarge,
    #[allow(dead_code)]
    BodyMismatch {
        expected: usize,
        available: usize,
    },
    #[allow(dead_code)]
    UnexpectedBody(usize),

    MethodNotImplemented,
    UpgradeNotAllowed,

    /// `Handler::on_headers` returned `Action::Abort`. Never reaches
    /// `as_http`: the connection loop closes the socket without a response
    /// before the error would be formatted.
    Aborted,

    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;

        InvalidUrl: "400 Bad Request", "51"
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
        Query: "400 Bad Request", "55"
            => r#"{"error":"Invalid query string","code":"INVALID_QUERY"}"#;
        UriTooLong: "414 URI Too Long", "48"
            => r#"{"error":"URI too long","code":"URI_TOO_LONG"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeaderFieldsTooLarge: "431 Request Header Fields Too Large", "53"
            => r#"{"error":"Headers too large","code":"HEADERS_TOO_LARGE"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidConnection: "400 Bad Request", "65"
            => r#"{"error":"Invalid Connection header","code":"INVALID_CONNECTION"}"#;
        DuplicateHost: "400 Bad Request", "58"
            => r#"{"error":"Duplicate Host header","code":"DUPLICATE_HOST"}"#;
        DuplicateContentLength: "400 Bad Request", "78"
            => r#"{"error":"Conflicting Content-Length headers","code":"DUPLICATE_CONTENT_LENGTH"}"#;
        InvalidCookie: "400 Bad Request", "54"
            => r#"{"error":"Invalid Cookie header","code":"INVALID_COOKIE"}"#;

        InvalidTransferEncoding: "400 Bad Request", "68"
            => r#"{"error":"Invalid Transfer-Encoding","code":"INVALID_TRANSFER_ENCODING"}"#;
        SmugglingAttempt: "400 Bad Request", "79"
            => r#"{"error":"Content-Length and Transfer-Encoding both present","code":"SMUGGLING"}"#;
        InvalidChunkSize: "400 Bad Request", "60"
            => r#"{"error":"Invalid chunk size line","code":"INVALID_CHUNK_SIZE"}"#;
        ChunkTooLarge: "413 Content Too Large", "53"
            => r#"{"error":"Chunk too large","code":"CHUNK_TOO_LARGE"}"#;
        TooManyTrailers: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many trailers","code":"TOO_MANY_TRAILERS"}"#;
        InvalidTrailer: "400 Bad Request", "54"
            => r#"{"error":"Invalid trailer line","code":"INVALID_TRAILER"}"#;

        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        BodyMismatch: "400 Bad Request", "55"
            => r#"{"error":"Body length mismatch","code":"BODY_MISMATCH"}"#;
        UnexpectedBody: "400 Bad Request", "60"
            => r#"{"error":"Unexpected request body","code":"UNEXPECTED_BODY"}"#;

        MethodNotImplemented: "501 Not Implemented", "56"
            => r#"{"error":"Method not implemented","code":"NOT_IMPLEMENTED"}"#;
        UpgradeNotAllowed: "400 Bad Request", "57"
            => r#"{"error":"Protocol upgrade not allowed","code":"NO_UPGRADE"}"#;
        Aborted: "400 Bad Request", "45"
            => r#"{"error":"Request aborted","code":"ABORTED"}"#;

        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}
impl From<cookie::Error> for ErrorKind {
    fn from(err: cookie::Error) -> Self {
        ErrorKind::InvalidCookie(err)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Which of `431`/`414`/`501` an out-of-buffer condition selects, as a
/// standalone pure function so it's testable against real-world scenarios
/// without needing a live connection.
///
/// `chunk_extension_present` is checked first: if the chunk-size line that
/// overflowed the buffer carries an extension (`;`-delimited) that removing
/// would have made it fit, the problem is "this one chunk header is oversize",
/// which is a body framing problem (`413`), not a headers/URI sizing problem.
pub(crate) fn select_overflow_status(
    receiving_uri: bool,
    looks_like_standard_method: bool,
    chunk_extension_present: bool,
    optional_headers_size: usize,
    uri_size: usize,
) -> Option<ErrorKind> {
    if receiving_uri {
        return looks_like_standard_method.then_some(ErrorKind::UriTooLong);
    }

    if chunk_extension_present {
        return Some(ErrorKind::ChunkTooLarge);
    }

    Some(match optional_headers_size.cmp(&uri_size) {
        std::cmp::Ordering::Greater => ErrorKind::HeaderFieldsTooLarge,
        std::cmp::Ordering::Less => ErrorKind::UriTooLong,
        std::cmp::Ordering::Equal if uri_size == 0 => ErrorKind::MethodNotImplemented,
        std::cmp::Ordering::Equal => ErrorKind::HeaderFieldsTooLarge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_overflow_with_standard_method() {
        assert_eq!(
            select_overflow_status(true, true, false, 0, 0),
            Some(ErrorKind::UriTooLong)
        );
    }

    #[test]
    fn uri_overflow_with_nonstandard_method_aborts() {
        assert_eq!(select_overflow_status(true, false, false, 0, 0), None);
    }

    #[test]
    fn chunk_extension_present_is_413() {
        assert_eq!(
            select_overflow_status(false, true, true, 10, 10),
            Some(ErrorKind::ChunkTooLarge)
        );
    }

    #[test]
    fn headers_dominate_is_431() {
        assert_eq!(
            select_overflow_status(false, true, false, 500, 100),
            Some(ErrorKind::HeaderFieldsTooLarge)
        );
    }

    #[test]
    fn uri_dominates_is_414() {
        assert_eq!(
            select_overflow_status(false, true, false, 50, 500),
            Some(ErrorKind::UriTooLong)
        );
    }

    #[test]
    fn method_dominates_is_501() {
        assert_eq!(
            select_overflow_status(false, true, false, 0, 0),
            Some(ErrorKind::MethodNotImplemented)
        );
    }
}
