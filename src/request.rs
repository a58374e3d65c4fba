//! The immutable request handed to handlers.

use std::{
    any::Any,
    collections::HashMap,
    io::{self, Read},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use http::{HeaderMap, Method, Version};
use mime::Mime;

use crate::{
    connection::{ConnectionId, Scheme},
    headers,
    query::QueryItems,
    session::Session,
    stream::InputStream,
};

/// A value captured from the path, either raw or produced by a transform.
#[derive(Clone)]
pub enum TypedValue {
    Int(i64),
    UInt(u64),
    Other(Arc<dyn Any + Send + Sync>),
}

impl TypedValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TypedValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            TypedValue::UInt(value) => Some(*value),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            TypedValue::Other(value) => value.downcast_ref(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedValue::Int(value) => write!(f, "Int({value})"),
            TypedValue::UInt(value) => write!(f, "UInt({value})"),
            TypedValue::Other(_) => write!(f, "Other(..)"),
        }
    }
}

/// One captured path identity: the raw matched text plus the transformed
/// value when the route declared a transform.
#[derive(Debug, Clone)]
pub struct PathIdentity {
    raw: String,
    typed: Option<TypedValue>,
}

impl PathIdentity {
    pub(crate) fn new(raw: String, typed: Option<TypedValue>) -> PathIdentity {
        PathIdentity { raw, typed }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn typed(&self) -> Option<&TypedValue> {
        self.typed.as_ref()
    }
}

/// Captured path identities, unique per route.
#[derive(Debug, Clone, Default)]
pub struct PathIdentities(HashMap<String, PathIdentity>);

impl PathIdentities {
    pub(crate) fn insert(&mut self, name: impl Into<String>, identity: PathIdentity) {
        self.0.insert(name.into(), identity);
    }

    pub fn get(&self, name: &str) -> Option<&PathIdentity> {
        self.0.get(name)
    }

    pub fn raw(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(PathIdentity::raw)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.0.get(name)?.typed()?.as_int()
    }

    pub fn uint(&self, name: &str) -> Option<u64> {
        self.0.get(name)?.typed()?.as_uint()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A file uploaded through a multipart body, spilled to disk.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    field: String,
    filename: String,
    path: PathBuf,
    content_type: Option<Mime>,
}

impl UploadedFile {
    pub(crate) fn new(
        field: String,
        filename: String,
        path: PathBuf,
        content_type: Option<Mime>,
    ) -> UploadedFile {
        UploadedFile {
            field,
            filename,
            path,
            content_type,
        }
    }

    /// The form field this file was posted under.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The filename the client declared.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Where the content lives until the owning worker exits.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }
}

/// Deletes uploaded temp files when the owning worker is done with them.
/// A queue hop moves the set to the new worker, which takes over cleanup.
#[derive(Default)]
pub(crate) struct UploadSet {
    paths: Vec<PathBuf>,
}

impl UploadSet {
    pub(crate) fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for UploadSet {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(err) = std::fs::remove_file(&path) {
                log::debug!("failed to remove upload {}: {}", path.display(), err);
            }
        }
    }
}

/// The request body as a lazy byte stream. Reads come straight off the
/// connection through the active framing; the stream is consumed at most
/// once.
pub struct Body<'a> {
    kind: BodyKind<'a>,
}

enum BodyKind<'a> {
    Stream(&'a mut InputStream),
    Consumed,
}

impl<'a> Body<'a> {
    pub(crate) fn stream(input: &'a mut InputStream) -> Body<'a> {
        Body {
            kind: BodyKind::Stream(input),
        }
    }

    /// A body that was already decoded by the engine (forms, multipart) or
    /// that the request never had.
    pub(crate) fn consumed() -> Body<'a> {
        Body {
            kind: BodyKind::Consumed,
        }
    }

    /// The advisory Content-Length, when the peer reported one.
    pub fn reported_content_length(&self) -> Option<u64> {
        match &self.kind {
            BodyKind::Stream(input) => input.reported_content_length(),
            BodyKind::Consumed => None,
        }
    }

    /// Buffers the remaining body.
    pub fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = match self.reported_content_length() {
            Some(len) => Vec::with_capacity(len as usize),
            None => Vec::new(),
        };
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for Body<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            BodyKind::Stream(input) => input.read(buf),
            BodyKind::Consumed => Ok(0),
        }
    }
}

/// An HTTP request, immutable after construction apart from its body stream
/// and the attached session.
pub struct Request<'a> {
    pub(crate) method: Method,
    pub(crate) scheme: Scheme,
    pub(crate) path: String,
    pub(crate) raw_query: Option<String>,
    pub(crate) query: QueryItems,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) identities: PathIdentities,
    pub(crate) uploads: Vec<UploadedFile>,
    pub(crate) session: Option<Session>,
    pub(crate) body: Body<'a>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) connection_id: ConnectionId,
}

impl<'a> Request<'a> {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The percent-decoded context path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// Query items in wire order, including items merged from an
    /// urlencoded form body or multipart text parts.
    pub fn query(&self) -> &QueryItems {
        &self.query
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn identities(&self) -> &PathIdentities {
        &self.identities
    }

    pub fn uploaded_files(&self) -> &[UploadedFile] {
        &self.uploads
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn body(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn content_type(&self) -> Option<Mime> {
        headers::content_type(&self.headers)
    }

    pub fn cookies(&self) -> Vec<(String, String)> {
        headers::request_cookies(&self.headers)
    }

    /// Accepted media types ordered by q-value.
    pub fn accept(&self) -> Vec<(String, f32)> {
        headers::accept(&self.headers)
    }

    pub fn host(&self) -> Option<String> {
        headers::host(&self.headers)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn body_streams_lazily_and_only_once() {
        let mut input = InputStream::new(Cursor::new(b"hello world".to_vec()));
        input.begin_fixed_body(11);

        let mut body = Body::stream(&mut input);
        assert_eq!(body.reported_content_length(), Some(11));
        assert_eq!(Body::bytes(&mut body).unwrap(), b"hello world");
        assert_eq!(Body::bytes(&mut body).unwrap(), b"");
    }

    #[test]
    fn typed_identities_expose_raw_and_transformed_values() {
        let mut identities = PathIdentities::default();
        identities.insert(
            "id",
            PathIdentity::new("42".into(), Some(TypedValue::UInt(42))),
        );
        identities.insert("name", PathIdentity::new("frodo".into(), None));

        assert_eq!(identities.raw("id"), Some("42"));
        assert_eq!(identities.uint("id"), Some(42));
        assert_eq!(identities.int("id"), None);
        assert_eq!(identities.raw("name"), Some("frodo"));
        assert!(identities.get("missing").is_none());
    }
}
