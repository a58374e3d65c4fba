#![doc = include_str!("../README.md")]

mod cell;
pub mod codec;
mod connection;
mod error;
pub mod events;
mod handler;
pub mod headers;
mod multipart;
mod parser;
pub mod query;
mod request;
pub mod response;
mod router;
mod scheduler;
mod server;
pub mod session;
pub mod stream;
pub mod websocket;

pub use cell::SharedCell;
pub use connection::{Connection, ConnectionId, Scheme};
pub use error::{
    BodyDecodeError, Error, HandlerFailure, MalformedRequest, RouteError, StreamError,
};
pub use events::{DisconnectReason, ServerEvents};
pub use handler::{Handler, RouteController};
pub use query::QueryItems;
pub use request::{Body, PathIdentities, PathIdentity, Request, TypedValue, UploadedFile};
pub use response::{Response, ResponseBody, ResponseBuilder, UpgradeHandler, UpgradedConnection};
pub use router::{RoutePattern, Transform, TransformFn, TransformRegistry, TAIL_IDENTITY};
pub use scheduler::{CancelToken, WorkerQueue};
pub use server::{Address, Server, ServerBuilder, ServerHandle};
pub use session::{MemorySessionManager, Session, SessionManager};
pub use stream::{InputStream, OutputStream, RateLimiter};

#[doc(hidden)]
pub use http;
#[doc(no_inline)]
pub use http::{HeaderMap, Method, StatusCode, Version};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use http::{HeaderMap, Method, Version};

    use crate::{
        connection::{ConnectionId, Scheme},
        query::QueryItems,
        request::{Body, PathIdentities, Request},
    };

    /// A `'static` write sink tests can keep a handle to while an
    /// [`OutputStream`](crate::stream::OutputStream) owns the other clone.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub(crate) fn new() -> SharedBuf {
            SharedBuf::default()
        }

        pub(crate) fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn minimal_request() -> Request<'static> {
        Request {
            method: Method::GET,
            scheme: Scheme::Http,
            path: "/".to_owned(),
            raw_query: None,
            query: QueryItems::new(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            identities: PathIdentities::default(),
            uploads: Vec::new(),
            session: None,
            body: Body::consumed(),
            peer: None,
            connection_id: ConnectionId::next(),
        }
    }
}
