//! Socket error classification (C2).
//!
//! Maps the handful of `io::Error` kinds that actually matter for connection
//! handling onto an abstract taxonomy, so the rest of the crate branches on
//! intent ("is this recoverable, connection-local, a resource problem, or a
//! bug") instead of re-deriving that from `ErrorKind` at every call site.
//! Grounded on `errors.rs`'s `IoError` wrapper, which previously only ever
//! compared `.kind()` for test equality — this generalizes that comparison
//! into the full classifier the connection I/O layer (C6) actually needs.

use std::io;

/// Abstract socket error taxonomy (C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockErr {
    /// Recoverable: the operation would block, try again later.
    Again,
    /// Recoverable: interrupted by a signal, retry immediately.
    Intr,
    /// Connection-local: peer reset the connection.
    ConnReset,
    /// Connection-local: write to a half-closed pipe.
    Pipe,
    /// Connection-local: socket is not connected.
    NotConn,
    /// Connection-local: the connection is otherwise broken (e.g. timed out).
    ConnBroken,
    /// Resource: allocation failure.
    NoMem,
    /// Programming error: bad file descriptor.
    BadFd,
    /// Programming error: invalid argument.
    Inval,
    /// Programming error: operation not supported on this socket.
    OpNotSupp,
    /// Programming error: not a socket.
    NotSocket,
    /// Unclassified.
    Other,
}

impl SockErr {
    /// True for `Again`/`Intr`: the caller should simply re-poll, not tear
    /// down the connection.
    #[inline(always)]
    pub fn is_recoverable(self) -> bool {
        matches!(self, SockErr::Again | SockErr::Intr)
    }

    /// True for the connection-local family: the connection should move to
    /// pre-close, but nothing else about the daemon is affected.
    #[inline(always)]
    pub fn is_connection_local(self) -> bool {
        matches!(
            self,
            SockErr::ConnReset | SockErr::Pipe | SockErr::NotConn | SockErr::ConnBroken
        )
    }

    pub fn classify(err: &io::Error) -> Self {
        use io::ErrorKind as K;
        match err.kind() {
            K::WouldBlock => SockErr::Again,
            K::Interrupted => SockErr::Intr,
            K::ConnectionReset => SockErr::ConnReset,
            K::BrokenPipe => SockErr::Pipe,
            K::NotConnected => SockErr::NotConn,
            K::TimedOut | K::ConnectionAborted | K::UnexpectedEof => SockErr::ConnBroken,
            K::OutOfMemory => SockErr::NoMem,
            K::InvalidInput | K::InvalidData => SockErr::Inval,
            K::Unsupported => SockErr::OpNotSupp,
            K::NotFound | K::PermissionDenied => SockErr::BadFd,
            _ => SockErr::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert_eq!(SockErr::classify(&io::Error::from(io::ErrorKind::WouldBlock)), SockErr::Again);
        assert_eq!(SockErr::classify(&io::Error::from(io::ErrorKind::Interrupted)), SockErr::Intr);
        assert!(SockErr::Again.is_recoverable());
        assert!(!SockErr::ConnReset.is_recoverable());
    }

    #[test]
    fn connection_local_kinds() {
        assert_eq!(
            SockErr::classify(&io::Error::from(io::ErrorKind::ConnectionReset)),
            SockErr::ConnReset
        );
        assert_eq!(SockErr::classify(&io::Error::from(io::ErrorKind::BrokenPipe)), SockErr::Pipe);
        assert_eq!(SockErr::classify(&io::Error::from(io::ErrorKind::NotConnected)), SockErr::NotConn);
        assert!(SockErr::ConnReset.is_connection_local());
    }

    #[test]
    fn unknown_kind_falls_back_to_other() {
        assert_eq!(SockErr::classify(&io::Error::from(io::ErrorKind::Other)), SockErr::Other);
    }
}
