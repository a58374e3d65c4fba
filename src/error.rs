//! The error taxonomy shared by the whole crate.
//!
//! Byte-level failures ([`StreamError`]) bubble up into the request worker,
//! which maps them onto an HTTP status where one applies and forwards every
//! error to the [`ServerEvents::server_error`](crate::events::ServerEvents)
//! hook.

use std::io;

use http::{Method, StatusCode};
use thiserror::Error;

use crate::scheduler::WorkerQueue;

/// I/O failures at the byte-stream layer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("unexpected end of stream")]
    EndOfStream,
    #[error("line is not valid utf-8")]
    MalformedLine,
    #[error("read timed out")]
    TimedOut,
    #[error("stream is not connected")]
    Disconnected,
    #[error("io error")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub(crate) fn from_io(err: io::Error) -> StreamError {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => StreamError::EndOfStream,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => StreamError::TimedOut,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => StreamError::Disconnected,
            _ => StreamError::Io(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::TimedOut)
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, StreamError::EndOfStream | StreamError::Disconnected)
    }
}

/// The request violates HTTP/1.1 framing.
#[derive(Debug, Error)]
pub enum MalformedRequest {
    #[error("invalid request head: {0:?}")]
    InvalidRequestHead(String),
    #[error("unsupported http version: {0:?}")]
    UnsupportedVersion(String),
    #[error("malformed header: {0:?}")]
    MalformedHeader(String),
    #[error("invalid Transfer-Encoding header")]
    InvalidTransferEncoding,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("invalid chunk size")]
    InvalidChunkSize,
    #[error("chunk is missing its CRLF terminator")]
    InvalidChunkTerminator,
}

/// The body framing was fine but its content could not be decoded.
#[derive(Debug, Error)]
pub enum BodyDecodeError {
    #[error("urlencoded form body could not be decoded")]
    InvalidUrlencodedForm,
    #[error("multipart content-type is missing its boundary parameter")]
    MissingBoundary,
    #[error("expected multipart boundary")]
    BoundaryNotFound,
    #[error("unexpected bytes after part boundary")]
    UnexpectedBoundaryTrailer,
    #[error("malformed part header: {0:?}")]
    MalformedPartHeader(String),
    #[error("part {part:?} is not valid utf-8")]
    InvalidTextPart { part: String },
    #[error("failed to store upload for part {part:?}")]
    Upload {
        part: String,
        #[source]
        cause: io::Error,
    },
    #[error("body exceeds the configured in-memory limit")]
    PayloadTooLarge,
}

/// Route registration and lookup failures.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("unknown transform {0:?}")]
    UnknownTransform(String),
    #[error("no route matches {0:?}")]
    NotFound(String),
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
}

/// The tagged failure variant handlers return instead of a [`Response`].
///
/// The writer converts each variant to a status through the owning
/// controller's hooks, so handlers never hand-craft error pages unless they
/// want to.
///
/// [`Response`]: crate::response::Response
#[derive(Debug, Error)]
pub enum HandlerFailure {
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("handler error")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerFailure {
    pub fn internal<E>(err: E) -> HandlerFailure
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        HandlerFailure::Internal(err.into())
    }
}

/// Everything the server can report through the observability hooks.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] MalformedRequest),
    #[error("body decode failed: {0}")]
    BodyDecode(#[from] BodyDecodeError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("hop to queue {queue:?} failed")]
    QueueHop {
        queue: WorkerQueue,
        #[source]
        cause: Box<Error>,
    },
    #[error("server shutdown in progress")]
    ShutdownInProgress,
}

impl Error {
    /// The status a request worker answers with before closing the
    /// connection, when answering is still possible.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Stream(err) if err.is_timeout() => StatusCode::REQUEST_TIMEOUT,
            Error::Stream(_) => StatusCode::BAD_REQUEST,
            Error::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Error::BodyDecode(BodyDecodeError::PayloadTooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::BodyDecode(_) => StatusCode::BAD_REQUEST,
            Error::Route(RouteError::MethodNotAllowed(_)) => StatusCode::METHOD_NOT_ALLOWED,
            Error::Route(_) => StatusCode::NOT_FOUND,
            Error::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::QueueHop { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the connection must be closed after answering.
    pub fn must_close(&self) -> bool {
        !matches!(self, Error::Route(_) | Error::Handler(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_stream_timeouts_to_request_timeout() {
        let err = Error::Stream(StreamError::TimedOut);
        assert_eq!(err.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn framing_failures_close_the_connection() {
        let err = Error::MalformedRequest(MalformedRequest::InvalidChunkSize);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.must_close());

        let err = Error::Route(RouteError::NotFound("/nope".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(!err.must_close());
    }
}
