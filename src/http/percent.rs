//! RFC 3986 percent-decoding.
//!
//! [`crate::query`] deliberately ships with no decoder ("due to zero-copy &
//! zero-alloc"); this closes that gap so request targets and query values
//! reach the application already decoded. Decoding happens in place into
//! pool-backed storage the caller already owns — the output is always the
//! same length or shorter than the input, so it never needs a second
//! allocation.

use percent_encoding::percent_decode;

/// Decodes `src` in place, returning the number of bytes written.
///
/// Invalid `%XX` escapes (not two hex digits) are passed through literally,
/// matching the permissive behavior browsers use rather than rejecting the
/// whole request over one malformed escape — consistent with this crate's
/// other leniency toward whitespace-in-URI handling.
pub fn decode_in_place(src: &mut [u8]) -> usize {
    let decoded = percent_decode(src).collect::<Vec<u8>>();
    let len = decoded.len();
    src[..len].copy_from_slice(&decoded);
    len
}

/// Decodes `src` into a freshly allocated buffer, for callers that can't
/// decode in place because the source bytes are borrowed immutably (e.g. a
/// query string split out of a buffer another caller still reads from).
pub fn decode_to_vec(src: &[u8]) -> Vec<u8> {
    percent_decode(src).collect()
}

/// Validates that a decoded byte run is well-formed UTF-8 without copying.
/// Used for log fields; malformed targets are still served (HTTP targets
/// are not required to be UTF-8), just not logged as a string.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    simdutf8::basic::from_utf8(bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_common_escapes() {
        let mut buf = *b"hello%20world%21";
        let len = decode_in_place(&mut buf);
        assert_eq!(&buf[..len], b"hello world!");
    }

    #[test]
    fn passes_through_plain_text() {
        let mut buf = *b"plain";
        let len = decode_in_place(&mut buf);
        assert_eq!(&buf[..len], b"plain");
    }

    #[test]
    fn round_trips_arbitrary_bytes() {
        let original: Vec<u8> = (0u8..=255).collect();
        let encoded: String = percent_encoding::percent_encode(
            &original,
            percent_encoding::NON_ALPHANUMERIC,
        )
        .collect();
        let mut buf = encoded.into_bytes();
        let len = decode_in_place(&mut buf);
        assert_eq!(&buf[..len], &original[..]);
    }

    #[test]
    fn utf8_validation() {
        assert!(is_valid_utf8(b"hello"));
        assert!(!is_valid_utf8(&[0xff, 0xfe]));
    }

    #[test]
    fn decode_to_vec_matches_in_place() {
        assert_eq!(decode_to_vec(b"a%40b.com"), b"a@b.com");
    }
}
