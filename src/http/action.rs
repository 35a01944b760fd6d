//! The decision an application makes once a request's headers are parsed,
//! before its body (if any) is read.

use std::sync::Arc;
use tokio::sync::Notify;

/// What `Handler::on_headers` decides to do with a request once its headers
/// are known but before its body is read.
pub enum Action {
    /// Read the body the ordinary way (buffered into `Request::body()`, if
    /// any) and dispatch straight to `Handler::handle`. The default.
    Response,

    /// Stream the body to `Handler::on_upload_chunk`/`on_upload_complete`
    /// instead of buffering the whole thing, then dispatch to
    /// `Handler::handle` once it's fully received.
    Upload(UploadMode),

    /// Buffer the body as usual, then decode an
    /// `application/x-www-form-urlencoded` body into `Request::post(...)`
    /// entries before dispatching to `Handler::handle`.
    PostProcess,

    /// Pause request processing until the paired `Notify` handle is
    /// signaled, then proceed as `Response` would.
    Suspend(Arc<Notify>),

    /// Close the connection without sending any response.
    Abort,
}

/// How a streamed upload is delivered to the application.
#[derive(Clone, Copy)]
pub enum UploadMode {
    /// Each read (or chunk, for chunked transfer-encoding) is handed to
    /// `Handler::on_upload_chunk` as soon as it's available, split into
    /// pieces no larger than `max_buffered`; a final empty-slice call marks
    /// completion.
    Incremental { max_buffered: usize },

    /// The whole body is buffered, then handed to
    /// `Handler::on_upload_complete` once, in full.
    Full,
}
