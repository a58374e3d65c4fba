//! The mutable response builder and the writer that finalizes it onto the
//! wire.

use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use mime::Mime;
use uuid::Uuid;

use crate::{
    connection::ConnectionId,
    error::{Error, StreamError},
    scheduler::{CancelToken, WorkerQueue},
    session::{Session, SessionManager, SESSION_COOKIE},
    stream::{InputStream, OutputStream, RateLimiter},
};

/// A custom body streamer given the request input and the response output.
pub type Streamer = Box<dyn FnOnce(&mut dyn Read, &mut dyn Write) -> io::Result<()> + Send>;

/// What gets written after the head.
pub enum ResponseBody {
    Empty,
    Bytes {
        data: Bytes,
        content_type: Option<Mime>,
    },
    File {
        path: PathBuf,
        range: Option<std::ops::Range<u64>>,
        limiter: RateLimiter,
    },
    Stream(Streamer),
}

/// Takes over the raw byte streams once a `101 Switching Protocols`
/// response has been written.
pub trait UpgradeHandler: Send {
    fn handle(self: Box<Self>, upgraded: UpgradedConnection);
}

impl<F: FnOnce(UpgradedConnection) + Send> UpgradeHandler for F {
    fn handle(self: Box<Self>, upgraded: UpgradedConnection) {
        self(upgraded)
    }
}

/// The raw streams handed to an upgrade handler after the switch.
pub struct UpgradedConnection {
    pub input: InputStream,
    pub output: OutputStream,
    pub cancel: CancelToken,
    pub connection_id: ConnectionId,
}

/// A response under construction: status, optional reason override,
/// headers, a body variant, and the worker queue it should be written on.
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: ResponseBody,
    queue: Option<WorkerQueue>,
    upgrade: Option<Box<dyn UpgradeHandler>>,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder {
            response: Response::empty(StatusCode::OK),
        }
    }

    pub fn empty(status: StatusCode) -> Response {
        Response {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            queue: None,
            upgrade: None,
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Response {
        Response::bytes(status, body.into().into_bytes(), mime::TEXT_PLAIN_UTF_8)
    }

    pub fn html(status: StatusCode, body: impl Into<String>) -> Response {
        Response::bytes(status, body.into().into_bytes(), mime::TEXT_HTML_UTF_8)
    }

    pub fn bytes(status: StatusCode, data: impl Into<Bytes>, content_type: Mime) -> Response {
        let mut response = Response::empty(status);
        response.body = ResponseBody::Bytes {
            data: data.into(),
            content_type: Some(content_type),
        };
        response
    }

    pub fn json(
        status: StatusCode,
        value: &impl serde::Serialize,
    ) -> Result<Response, serde_json::Error> {
        Ok(Response::bytes(
            status,
            serde_json::to_vec(value)?,
            mime::APPLICATION_JSON,
        ))
    }

    /// Streams a file; content-type defaults from the extension during
    /// finalization.
    pub fn file(status: StatusCode, path: impl Into<PathBuf>) -> Response {
        let mut response = Response::empty(status);
        response.body = ResponseBody::File {
            path: path.into(),
            range: None,
            limiter: RateLimiter::unlimited(),
        };
        response
    }

    /// Streams a slice of a file at a bounded rate.
    pub fn file_range(
        status: StatusCode,
        path: impl Into<PathBuf>,
        range: Option<std::ops::Range<u64>>,
        limiter: RateLimiter,
    ) -> Response {
        let mut response = Response::empty(status);
        response.body = ResponseBody::File {
            path: path.into(),
            range,
            limiter,
        };
        response
    }

    /// A custom body streamer over the request input and response output.
    /// The writer frames it as chunked and guarantees the terminator.
    pub fn stream(
        status: StatusCode,
        streamer: impl FnOnce(&mut dyn Read, &mut dyn Write) -> io::Result<()> + Send + 'static,
    ) -> Response {
        let mut response = Response::empty(status);
        response.body = ResponseBody::Stream(Box::new(streamer));
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Overrides the canonical reason phrase on the status line.
    pub fn reason(mut self, reason: impl Into<String>) -> Response {
        self.reason = Some(reason.into());
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(mut self, name: HeaderName, value: impl TryInto<HeaderValue>) -> Response {
        if let Ok(value) = value.try_into() {
            self.headers.append(name, value);
        }
        self
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn set_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    /// Tags the response to be written on another worker queue. The worker
    /// hops there, transferring the connection and upload cleanup, before
    /// writing.
    pub fn queue(mut self, queue: WorkerQueue) -> Response {
        self.queue = Some(queue);
        self
    }

    pub fn write_queue(&self) -> Option<&WorkerQueue> {
        self.queue.as_ref()
    }

    /// Attaches a protocol-upgrade handler invoked with the raw streams
    /// after the head is written.
    pub fn upgrade(mut self, handler: impl UpgradeHandler + 'static) -> Response {
        self.upgrade = Some(Box::new(handler));
        self
    }
}

pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    pub fn status(mut self, status: StatusCode) -> ResponseBuilder {
        self.response.status = status;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> ResponseBuilder {
        self.response.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl TryInto<HeaderValue>) -> ResponseBuilder {
        if let Ok(value) = value.try_into() {
            self.response.headers.append(name, value);
        }
        self
    }

    pub fn queue(mut self, queue: WorkerQueue) -> ResponseBuilder {
        self.response.queue = Some(queue);
        self
    }

    pub fn body(mut self, body: ResponseBody) -> Response {
        self.response.body = body;
        self.response
    }

    pub fn empty(self) -> Response {
        self.body(ResponseBody::Empty)
    }
}

/// Everything from the request the writer needs after the request itself
/// is gone.
pub(crate) struct WriteContext {
    pub version: Version,
    pub method: Method,
    pub keep_alive: bool,
    pub host: Option<String>,
    pub range: Option<String>,
    pub if_modified_since: Option<SystemTime>,
    pub if_none_match: Option<String>,
    pub if_match: Option<String>,
    pub session_cookies: Vec<String>,
    pub session: Option<Session>,
    pub date: SystemTime,
}

impl Default for WriteContext {
    fn default() -> Self {
        WriteContext {
            version: Version::HTTP_11,
            method: Method::GET,
            keep_alive: true,
            host: None,
            range: None,
            if_modified_since: None,
            if_none_match: None,
            if_match: None,
            session_cookies: Vec::new(),
            session: None,
            date: SystemTime::UNIX_EPOCH,
        }
    }
}

pub(crate) struct WriterConfig {
    pub server: Option<String>,
    pub session_manager: Option<Arc<dyn SessionManager>>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            server: None,
            session_manager: None,
        }
    }
}

pub(crate) enum WriteOutcome {
    KeepAlive,
    Close,
    Upgrade(Box<dyn UpgradeHandler>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    FromTo(u64, u64),
    From(u64),
    Suffix(u64),
}

impl RangeSpec {
    /// Resolves to an inclusive `(lo, hi)` pair, or `None` when the
    /// specifier cannot be satisfied against `size`.
    fn resolve(self, size: u64) -> Option<(u64, u64)> {
        match self {
            RangeSpec::FromTo(lo, hi) if lo <= hi && lo < size => Some((lo, hi.min(size - 1))),
            RangeSpec::From(lo) if lo < size => Some((lo, size - 1)),
            RangeSpec::Suffix(n) if n > 0 && size > 0 => Some((size.saturating_sub(n), size - 1)),
            _ => None,
        }
    }
}

/// Parses `bytes=...` range specifiers. A syntactically invalid header is
/// ignored entirely, per RFC 7233.
fn parse_range_header(raw: &str) -> Option<Vec<RangeSpec>> {
    let specs = raw.strip_prefix("bytes=")?;
    let mut parsed = Vec::new();
    for spec in specs.split(',') {
        let spec = spec.trim();
        let (lo, hi) = spec.split_once('-')?;
        let parsed_spec = match (lo.is_empty(), hi.is_empty()) {
            (true, false) => RangeSpec::Suffix(hi.parse().ok()?),
            (false, true) => RangeSpec::From(lo.parse().ok()?),
            (false, false) => RangeSpec::FromTo(lo.parse().ok()?, hi.parse().ok()?),
            (true, true) => return None,
        };
        parsed.push(parsed_spec);
    }
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

fn removal_cookie(headers: &mut HeaderMap, value: &str) {
    let cookie = format!(
        "{SESSION_COOKIE}={value}; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0; Path=/"
    );
    if let Ok(cookie) = HeaderValue::from_str(&cookie) {
        headers.append(header::SET_COOKIE, cookie);
    }
}

/// Session cookie finalization: expire mismatched prior cookies, then set
/// or remove the active session's cookie.
fn finalize_session(ctx: &mut WriteContext, config: &WriterConfig, headers: &mut HeaderMap) {
    let manager = match &config.session_manager {
        Some(manager) => manager,
        None => return,
    };
    let session = ctx.session.take();

    let active_id = session
        .as_ref()
        .filter(|s| !s.is_invalidated() && !(s.is_empty() && s.is_new()))
        .map(|s| s.id().to_owned());

    let mut expired: Vec<&str> = Vec::new();
    for prior in &ctx.session_cookies {
        if Some(prior.as_str()) != active_id.as_deref() && !expired.contains(&prior.as_str()) {
            removal_cookie(headers, prior);
            expired.push(prior.as_str());
        }
    }

    let session = match session {
        Some(session) => session,
        None => return,
    };

    if active_id.is_none() {
        // Invalidated, or brand new and never written to.
        if !session.is_new() && !expired.contains(&session.id()) {
            removal_cookie(headers, session.id());
        }
        manager.remove_session(session.id());
        return;
    }

    let mut cookie = format!(
        "{SESSION_COOKIE}={}; Max-Age={}; Path=/; HttpOnly",
        session.id(),
        manager.timeout().as_secs(),
    );
    if let Some(host) = &ctx.host {
        cookie.push_str("; Domain=");
        cookie.push_str(host);
    }
    if let Ok(cookie) = HeaderValue::from_str(&cookie) {
        headers.append(header::SET_COOKIE, cookie);
    }
    manager.save_session(session);
}

struct FilePlan {
    file: File,
    parts: Vec<FilePart>,
    limiter: RateLimiter,
    body_len: u64,
    trailer: Vec<u8>,
}

struct FilePart {
    head: Vec<u8>,
    start: u64,
    len: u64,
}

enum BodyPlan {
    None,
    Bytes(Bytes),
    File(FilePlan),
    Stream(Streamer),
}

/// Writes a finalized response. `input` is the request's body stream,
/// passed through to custom streamers; `None` substitutes an empty one.
pub(crate) fn write_response(
    mut ctx: WriteContext,
    response: Response,
    config: &WriterConfig,
    input: Option<&mut InputStream>,
    output: &mut OutputStream,
) -> Result<WriteOutcome, Error> {
    let Response {
        mut status,
        reason,
        mut headers,
        body,
        queue: _,
        upgrade,
    } = response;

    output.reset_for_response();
    finalize_session(&mut ctx, config, &mut headers);

    // Resolve the body before anything reaches the wire, so failures can
    // still become error responses upstream.
    let mut plan = match body {
        ResponseBody::Empty => BodyPlan::None,
        ResponseBody::Bytes { data, content_type } => {
            if !headers.contains_key(header::CONTENT_TYPE) {
                if let Some(mime) = content_type {
                    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                        headers.insert(header::CONTENT_TYPE, value);
                    }
                }
            }
            BodyPlan::Bytes(data)
        }
        ResponseBody::File {
            path,
            range,
            limiter,
        } => plan_file_body(&ctx, &mut status, &mut headers, &path, range, limiter)
            .map_err(|err| Error::Stream(StreamError::from_io(err)))?,
        ResponseBody::Stream(streamer) => BodyPlan::Stream(streamer),
    };

    // Conditional requests resolve before the body is sent.
    if let Some(not_modified_status) = resolve_conditionals(&ctx, &headers, status) {
        status = not_modified_status;
        plan = BodyPlan::None;
        headers.remove(header::CONTENT_RANGE);
    }

    let headless_body = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    if !ctx.keep_alive && !headers.contains_key(header::CONNECTION) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    headers.insert(
        header::DATE,
        HeaderValue::from_str(&httpdate::fmt_http_date(ctx.date))
            .unwrap_or(HeaderValue::from_static("")),
    );
    if let Some(server) = &config.server {
        if let Ok(value) = HeaderValue::from_str(server) {
            headers.insert(header::SERVER, value);
        }
    }

    let mut chunked = false;
    if headless_body {
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
    } else {
        let content_length = match &plan {
            BodyPlan::None => Some(0),
            BodyPlan::Bytes(data) => Some(data.len() as u64),
            BodyPlan::File(plan) => Some(plan.body_len),
            BodyPlan::Stream(_) => None,
        };
        match content_length {
            Some(len) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
            None if ctx.version == Version::HTTP_11 => {
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                chunked = true;
            }
            None => {
                // HTTP/1.0 cannot frame an unknown length; delimit by close.
                headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
                ctx.keep_alive = false;
            }
        }
    }

    write_head(&ctx, status, reason.as_deref(), &headers, output)
        .map_err(|err| Error::Stream(StreamError::from_io(err)))?;

    let skip_body = ctx.method == Method::HEAD || headless_body;
    if !skip_body {
        write_body(plan, chunked, input, output)
            .map_err(|err| Error::Stream(StreamError::from_io(err)))?;
    }
    output
        .flush()
        .map_err(|err| Error::Stream(StreamError::from_io(err)))?;

    if let Some(upgrade) = upgrade {
        return Ok(WriteOutcome::Upgrade(upgrade));
    }
    if ctx.keep_alive && output.is_connected() {
        Ok(WriteOutcome::KeepAlive)
    } else {
        Ok(WriteOutcome::Close)
    }
}

fn plan_file_body(
    ctx: &WriteContext,
    status: &mut StatusCode,
    headers: &mut HeaderMap,
    path: &Path,
    explicit_range: Option<std::ops::Range<u64>>,
    limiter: RateLimiter,
) -> io::Result<BodyPlan> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let size = metadata.len();

    if let Ok(modified) = metadata.modified() {
        if !headers.contains_key(header::LAST_MODIFIED) {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
                headers.insert(header::LAST_MODIFIED, value);
            }
        }
    }

    let guessed = mime_guess::from_path(path).first();
    if !headers.contains_key(header::CONTENT_TYPE) {
        if let Some(mime) = &guessed {
            if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
    }

    // A handler-fixed range defines the resource slice; client range
    // headers only apply to whole-file responses.
    if let Some(range) = explicit_range {
        let lo = range.start.min(size);
        let len = range.end.min(size).saturating_sub(lo);
        return Ok(BodyPlan::File(FilePlan {
            file,
            parts: vec![FilePart {
                head: Vec::new(),
                start: lo,
                len,
            }],
            limiter,
            body_len: len,
            trailer: Vec::new(),
        }));
    }

    let specs = match ctx
        .range
        .as_deref()
        .filter(|_| *status == StatusCode::OK)
        .and_then(parse_range_header)
    {
        Some(specs) => specs,
        None => {
            return Ok(BodyPlan::File(FilePlan {
                file,
                parts: vec![FilePart {
                    head: Vec::new(),
                    start: 0,
                    len: size,
                }],
                limiter,
                body_len: size,
                trailer: Vec::new(),
            }));
        }
    };

    let resolved: Vec<(u64, u64)> = specs
        .into_iter()
        .filter_map(|spec| spec.resolve(size))
        .collect();

    if resolved.is_empty() {
        *status = StatusCode::RANGE_NOT_SATISFIABLE;
        if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
            headers.insert(header::CONTENT_RANGE, value);
        }
        return Ok(BodyPlan::None);
    }

    *status = StatusCode::PARTIAL_CONTENT;

    if let [(lo, hi)] = resolved.as_slice() {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes {lo}-{hi}/{size}")) {
            headers.insert(header::CONTENT_RANGE, value);
        }
        return Ok(BodyPlan::File(FilePlan {
            file,
            parts: vec![FilePart {
                head: Vec::new(),
                start: *lo,
                len: hi - lo + 1,
            }],
            limiter,
            body_len: hi - lo + 1,
            trailer: Vec::new(),
        }));
    }

    let boundary = Uuid::new_v4().simple().to_string();
    if let Ok(value) =
        HeaderValue::from_str(&format!("multipart/byteranges; boundary={boundary}"))
    {
        headers.insert(header::CONTENT_TYPE, value);
    }

    let mut parts = Vec::new();
    let mut body_len = 0_u64;
    for (lo, hi) in &resolved {
        let mut head = format!("--{boundary}\r\n").into_bytes();
        if let Some(mime) = &guessed {
            head.extend_from_slice(format!("Content-Type: {mime}\r\n").as_bytes());
        }
        head.extend_from_slice(format!("Content-Range: bytes {lo}-{hi}/{size}\r\n\r\n").as_bytes());
        let len = hi - lo + 1;
        body_len += head.len() as u64 + len + 2;
        parts.push(FilePart {
            head,
            start: *lo,
            len,
        });
    }
    let trailer = format!("--{boundary}--\r\n").into_bytes();
    body_len += trailer.len() as u64;

    Ok(BodyPlan::File(FilePlan {
        file,
        parts,
        limiter,
        body_len,
        trailer,
    }))
}

/// If-None-Match and If-Modified-Since demote a success into
/// `304 Not Modified`; a failing If-Match becomes `412`.
fn resolve_conditionals(
    ctx: &WriteContext,
    headers: &HeaderMap,
    status: StatusCode,
) -> Option<StatusCode> {
    if !status.is_success() {
        return None;
    }

    let etag = headers
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok());

    if let Some(if_match) = ctx.if_match.as_deref() {
        let matched = if_match.trim() == "*"
            || etag
                .map(|etag| if_match.split(',').any(|c| c.trim() == etag))
                .unwrap_or(false);
        if !matched {
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    }

    if let Some(if_none_match) = ctx.if_none_match.as_deref() {
        let matched = if_none_match.trim() == "*"
            || etag
                .map(|etag| if_none_match.split(',').any(|c| c.trim() == etag))
                .unwrap_or(false);
        if matched {
            return Some(StatusCode::NOT_MODIFIED);
        }
        return None;
    }

    if let (Some(since), Some(modified)) = (
        ctx.if_modified_since,
        headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok()),
    ) {
        if modified <= since {
            return Some(StatusCode::NOT_MODIFIED);
        }
    }

    None
}

fn write_head(
    ctx: &WriteContext,
    status: StatusCode,
    reason: Option<&str>,
    headers: &HeaderMap,
    output: &mut OutputStream,
) -> io::Result<()> {
    let version = match ctx.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let reason = reason
        .or_else(|| status.canonical_reason())
        .unwrap_or_default();
    output.mark_head_written();
    output.write_line(&format!("{version} {} {reason}", status.as_u16()))?;

    for (name, value) in headers {
        output.write_line(&format!(
            "{name}: {}",
            value.to_str().unwrap_or_default()
        ))?;
    }
    output.write_line("")
}

fn write_body(
    plan: BodyPlan,
    chunked: bool,
    input: Option<&mut InputStream>,
    output: &mut OutputStream,
) -> io::Result<()> {
    match plan {
        BodyPlan::None => Ok(()),
        BodyPlan::Bytes(data) => output.write_bytes(&data),
        BodyPlan::File(mut plan) => {
            for part in &plan.parts {
                if !part.head.is_empty() {
                    output.write_bytes(&part.head)?;
                }
                output.write_file_range(&mut plan.file, part.start, part.len, &plan.limiter)?;
                if !plan.trailer.is_empty() {
                    output.write_bytes(b"\r\n")?;
                }
            }
            if !plan.trailer.is_empty() {
                output.write_bytes(&plan.trailer)?;
            }
            Ok(())
        }
        BodyPlan::Stream(streamer) => {
            if chunked {
                output.begin_chunked_body();
            }
            let mut empty = io::empty();
            let result = match input {
                Some(input) => streamer(input, output),
                None => streamer(&mut empty, output),
            };
            // The terminator is owed even when the streamer bails out early.
            let finish = output.finish_chunked_body();
            result.and(finish)
        }
    }
}
