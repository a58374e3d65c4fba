//! The listening server and its request workers.
//!
//! One worker owns each accepted connection and runs the request loop
//! strictly sequentially: head, headers, body, handler, write, drain,
//! repeat. Workers live on bounded queues managed by the scheduler; a
//! response tagged with a different write queue makes the worker hop,
//! carrying the connection and upload cleanup with it.
//!
//! # Example
//! ```no_run
//! use petrel::{Response, RouteController, Server, StatusCode};
//!
//! fn main() -> std::io::Result<()> {
//!     let routes = RouteController::new()
//!         .get("/hello/:name", |req: &mut petrel::Request<'_>| {
//!             let name = req.identities().raw("name").unwrap_or("world").to_owned();
//!             Ok(Response::text(StatusCode::OK, format!("hello {name}")))
//!         })
//!         .expect("valid route");
//!
//!     Server::builder()
//!         .default_host(routes)
//!         .bind("0.0.0.0:4444")?
//!         .serve()
//! }
//! ```

use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    mem,
    net::{SocketAddr, TcpListener, ToSocketAddrs},
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, SystemTime},
};

use http::{header, Method, StatusCode, Version};

use crate::{
    connection::{Connection, Scheme},
    error::{BodyDecodeError, Error, HandlerFailure, RouteError},
    events::{DisconnectReason, ServerEvents},
    handler::{Handler, Lookup, RouteController, VirtualHosts},
    headers,
    multipart,
    parser::{self, BodyFraming},
    request::{Body, PathIdentities, Request, UploadSet, UploadedFile},
    response::{
        write_response, Response, UpgradeHandler, UpgradedConnection, WriteContext, WriteOutcome,
        WriterConfig,
    },
    scheduler::{CancelToken, Scheduler, WorkerQueue},
    session::{SessionManager, SESSION_COOKIE},
    stream::{InputStream, OutputStream},
};

/// A listening endpoint: TCP (v4 or v6, port 0 for first available) or a
/// Unix domain socket given as `unix://<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Address {
    pub fn parse(addr: &str) -> io::Result<Address> {
        if let Some(path) = addr.strip_prefix("unix://") {
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        addr.to_socket_addrs()?
            .next()
            .map(Address::Tcp)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {addr:?}"))
            })
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::Tcp(addr)
    }
}

pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn bind(addr: &Address) -> io::Result<Listener> {
        match addr {
            Address::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr)?)),
            Address::Unix(path) => {
                // A stale socket file from a previous run blocks the bind.
                fs::remove_file(path).ok();
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.set_nonblocking(nonblocking),
            Listener::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    fn accept(&self) -> io::Result<Option<Connection>> {
        let conn: Connection = match self {
            Listener::Tcp(listener) => match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    stream.into()
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            },
            Listener::Unix(listener) => match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    stream.into()
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            },
        };
        Ok(Some(conn))
    }
}

pub(crate) struct ServerShared {
    hosts: VirtualHosts,
    scheduler: Scheduler,
    events: Arc<dyn ServerEvents>,
    writer: WriterConfig,
    keep_alive_max: usize,
    initial_read_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    upload_dir: PathBuf,
    max_form_size: usize,
    thread_stop_timeout: Duration,
    scheme: Scheme,
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.shared.scheduler.begin_shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.scheduler.is_shutdown()
    }
}

pub struct ServerBuilder {
    limits: HashMap<WorkerQueue, i32>,
    max_total: i32,
    keep_alive_max: usize,
    initial_read_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    upload_dir: Option<PathBuf>,
    session_manager: Option<Arc<dyn SessionManager>>,
    server_header: Option<String>,
    events: Arc<dyn ServerEvents>,
    default_host: RouteController,
    hosts: Vec<(String, RouteController)>,
    scheme: Scheme,
    thread_stop_timeout: Duration,
    max_form_size: usize,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder {
            limits: HashMap::new(),
            max_total: -1,
            keep_alive_max: 100,
            initial_read_timeout: Some(Duration::from_secs(30)),
            read_timeout: None,
            write_timeout: None,
            upload_dir: None,
            session_manager: None,
            server_header: None,
            events: Arc::new(()),
            default_host: RouteController::new(),
            hosts: Vec::new(),
            scheme: Scheme::Http,
            thread_stop_timeout: Duration::from_secs(5),
            max_form_size: 1024 * 1024,
        }
    }
}

impl ServerBuilder {
    /// Caps concurrent workers on a queue. Limits must be positive or −1
    /// for unbounded.
    ///
    /// # Panics
    ///
    /// Panics when `limit` is zero or below −1.
    pub fn queue_limit(mut self, queue: WorkerQueue, limit: i32) -> ServerBuilder {
        assert!(
            limit == -1 || limit > 0,
            "queue limit must be positive or -1, got {limit}"
        );
        self.limits.insert(queue, limit);
        self
    }

    /// Caps concurrent workers across all queues. −1 means unbounded.
    pub fn max_total_workers(mut self, max_total: i32) -> ServerBuilder {
        assert!(
            max_total == -1 || max_total > 0,
            "total worker limit must be positive or -1, got {max_total}"
        );
        self.max_total = max_total;
        self
    }

    /// How many requests a single connection may serve before it is
    /// closed.
    pub fn keep_alive_max(mut self, max: usize) -> ServerBuilder {
        self.keep_alive_max = max.max(1);
        self
    }

    /// Deadline for the first request head on a fresh connection. `None`
    /// disables the timeout.
    pub fn initial_read_timeout(mut self, timeout: Option<Duration>) -> ServerBuilder {
        self.initial_read_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> ServerBuilder {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> ServerBuilder {
        self.write_timeout = timeout;
        self
    }

    /// Where multipart file uploads spill to, under one subdirectory per
    /// host.
    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> ServerBuilder {
        self.upload_dir = Some(dir.into());
        self
    }

    pub fn session_manager(mut self, manager: impl SessionManager + 'static) -> ServerBuilder {
        self.session_manager = Some(Arc::new(manager));
        self
    }

    /// Value for the `Server` response header; unset by default.
    pub fn server_header(mut self, server: impl Into<String>) -> ServerBuilder {
        self.server_header = Some(server.into());
        self
    }

    pub fn events(mut self, events: impl ServerEvents + 'static) -> ServerBuilder {
        self.events = Arc::new(events);
        self
    }

    /// Routes used when the Host header is missing or unknown.
    pub fn default_host(mut self, controller: RouteController) -> ServerBuilder {
        self.default_host = controller;
        self
    }

    pub fn host(mut self, name: impl Into<String>, controller: RouteController) -> ServerBuilder {
        self.hosts.push((name.into(), controller));
        self
    }

    /// Marks connections as arriving over https (behind a terminating
    /// proxy).
    pub fn scheme(mut self, scheme: Scheme) -> ServerBuilder {
        self.scheme = scheme;
        self
    }

    /// How long shutdown waits for workers before force-closing their
    /// connections.
    pub fn thread_stop_timeout(mut self, timeout: Duration) -> ServerBuilder {
        self.thread_stop_timeout = timeout;
        self
    }

    /// Upper bound for urlencoded form bodies buffered in memory.
    pub fn max_form_size(mut self, max: usize) -> ServerBuilder {
        self.max_form_size = max;
        self
    }

    /// Binds and returns the configured server. Accepts socket addresses
    /// and `unix://<path>` strings.
    pub fn bind(self, addr: &str) -> io::Result<Server> {
        self.bind_address(&Address::parse(addr)?)
    }

    pub fn bind_address(self, addr: &Address) -> io::Result<Server> {
        let listener = Listener::bind(addr)?;

        let mut hosts = VirtualHosts::new(self.default_host);
        for (name, controller) in self.hosts {
            hosts.insert(name, controller);
        }

        let upload_dir = self
            .upload_dir
            .unwrap_or_else(|| std::env::temp_dir().join("petrel-uploads"));

        Ok(Server {
            shared: Arc::new(ServerShared {
                hosts,
                scheduler: Scheduler::new(self.limits, self.max_total),
                events: self.events,
                writer: WriterConfig {
                    server: self.server_header,
                    session_manager: self.session_manager,
                },
                keep_alive_max: self.keep_alive_max,
                initial_read_timeout: self.initial_read_timeout,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                upload_dir,
                max_form_size: self.max_form_size,
                thread_stop_timeout: self.thread_stop_timeout,
                scheme: self.scheme,
            }),
            listener,
        })
    }
}

/// A bound HTTP/1.1 server; [`Server::serve`] runs the accept loop until
/// a [`ServerHandle`] stops it.
pub struct Server {
    shared: Arc<ServerShared>,
    listener: Listener,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The bound TCP address; useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accepts connections until shutdown, then cancels workers, waits out
    /// the stop timeout, and force-closes whatever is left.
    pub fn serve(self) -> io::Result<()> {
        let Server { shared, listener } = self;
        listener.set_nonblocking(true)?;
        if let Some(addr) = listener.local_addr() {
            log::debug!("listening on {addr}");
        }

        loop {
            if shared.scheduler.is_shutdown() {
                break;
            }
            match listener.accept() {
                Ok(Some(mut conn)) => {
                    conn.set_scheme(shared.scheme);
                    if shared
                        .scheduler
                        .wait_for_queue(&WorkerQueue::Request, None)
                        .is_err()
                    {
                        conn.shutdown();
                        break;
                    }
                    if let Err(err) = Worker::spawn(shared.clone(), conn) {
                        shared.scheduler.release(&WorkerQueue::Request);
                        log::warn!("failed to spawn worker: {err}");
                    }
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }

        shared.scheduler.stop_workers(shared.thread_stop_timeout);
        Ok(())
    }
}

enum Step {
    Next,
    Close(DisconnectReason),
    Hop {
        target: WorkerQueue,
        response: Response,
        ctx: WriteContext,
        uploads: UploadSet,
    },
    Upgrade(Box<dyn UpgradeHandler>),
}

struct Worker {
    shared: Arc<ServerShared>,
    conn: Connection,
    input: InputStream,
    output: OutputStream,
    token: CancelToken,
    queue: WorkerQueue,
    worker_id: u64,
    served: usize,
}

impl Worker {
    /// The caller holds a slot on the request queue; on error the caller
    /// releases it.
    fn spawn(shared: Arc<ServerShared>, conn: Connection) -> io::Result<()> {
        let token = CancelToken::new();
        let worker_id = shared
            .scheduler
            .register_worker(token.clone(), conn.close_handle().ok());

        let reader = match conn.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                shared.scheduler.deregister_worker(worker_id);
                return Err(err);
            }
        };
        let writer = match conn.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                shared.scheduler.deregister_worker(worker_id);
                return Err(err);
            }
        };
        conn.set_read_timeout(shared.read_timeout).ok();
        conn.set_write_timeout(shared.write_timeout).ok();

        let worker = Worker {
            shared: shared.clone(),
            conn,
            input: InputStream::new(reader),
            output: OutputStream::new(writer),
            token,
            queue: WorkerQueue::Request,
            worker_id,
            served: 0,
        };
        shared.scheduler.execute(&WorkerQueue::Request, move || worker.run());
        Ok(())
    }

    fn run(self) {
        self.shared
            .events
            .client_connected(self.conn.id(), self.conn.peer_addr());
        self.resume();
    }

    /// The request loop: runs until the connection closes, the worker
    /// hops, or the protocol is upgraded.
    fn resume(mut self) {
        loop {
            if self.token.is_cancelled() || self.shared.scheduler.is_shutdown() {
                return self.finish(DisconnectReason::Shutdown);
            }
            match self.serve_one() {
                Step::Next => continue,
                Step::Close(reason) => return self.finish(reason),
                Step::Hop {
                    target,
                    response,
                    ctx,
                    uploads,
                } => return self.hop(target, response, ctx, uploads),
                Step::Upgrade(handler) => return self.upgraded(handler),
            }
        }
    }

    fn serve_one(&mut self) -> Step {
        let first = self.served == 0;
        if first {
            if let Some(timeout) = self.shared.initial_read_timeout {
                self.conn.set_read_timeout(Some(timeout)).ok();
            }
        }

        let head = match parser::read_request_head(&mut self.input) {
            Ok(head) => head,
            Err(Error::Stream(err)) if err.is_timeout() && first => {
                self.shared.events.read_request_timed_out(self.conn.id());
                return Step::Close(DisconnectReason::Timeout);
            }
            Err(Error::Stream(err)) if err.is_disconnect() => {
                return Step::Close(DisconnectReason::ClientClosed);
            }
            Err(err) => return self.refuse(err),
        };
        if first && self.shared.initial_read_timeout.is_some() {
            self.conn.set_read_timeout(self.shared.read_timeout).ok();
        }
        log::debug!("{} {} {}", self.conn.id(), head.method, head.path);

        let request_headers = match parser::read_header_block(&mut self.input) {
            Ok(headers) => headers,
            Err(err) => return self.refuse(err),
        };

        let keep_alive = head.version == Version::HTTP_11
            && !headers::connection_contains(&request_headers, "close")
            && self.served + 1 < self.shared.keep_alive_max;
        let close_reason = if head.version != Version::HTTP_11
            || headers::connection_contains(&request_headers, "close")
        {
            DisconnectReason::ConnectionClose
        } else {
            DisconnectReason::KeepAliveExhausted
        };

        let framing = match parser::body_framing(&request_headers) {
            Ok(framing) => framing,
            Err(err) => return self.refuse(err.into()),
        };
        parser::begin_body(&mut self.input, framing);

        if framing != BodyFraming::None && expects_continue(&request_headers) {
            let sent = self
                .output
                .write_line("HTTP/1.1 100 Continue")
                .and_then(|_| self.output.write_line(""))
                .and_then(|_| self.output.flush());
            if sent.is_err() {
                return Step::Close(DisconnectReason::Error);
            }
        }

        let mut query = head.query;
        let mut uploads: Vec<UploadedFile> = Vec::new();
        let mut upload_set = UploadSet::default();
        let mut body_consumed = false;
        let host_name = headers::host_name(&request_headers);

        if let Some(boundary) = headers::multipart_boundary(&request_headers) {
            let dir = self
                .shared
                .upload_dir
                .join(sanitize_host(host_name.as_deref()));
            if let Err(cause) = fs::create_dir_all(&dir) {
                return self.refuse(Error::BodyDecode(BodyDecodeError::Upload {
                    part: String::new(),
                    cause,
                }));
            }
            if let Err(err) = multipart::parse_multipart(
                &mut self.input,
                &boundary,
                &dir,
                &mut query,
                &mut uploads,
                &mut upload_set,
            ) {
                return self.refuse(err);
            }
            body_consumed = true;
        } else if headers::is_urlencoded_form(&request_headers) {
            match parser::read_urlencoded_body(&mut self.input, framing, self.shared.max_form_size)
            {
                Ok(items) => query.extend_from(items),
                Err(err) => return self.refuse(err),
            }
            body_consumed = true;
        }

        let session_cookies: Vec<String> = headers::request_cookies(&request_headers)
            .into_iter()
            .filter(|(name, _)| name == SESSION_COOKIE)
            .map(|(_, value)| value)
            .collect();
        let session = self.shared.writer.session_manager.as_ref().map(|manager| {
            session_cookies
                .iter()
                .find_map(|id| manager.get_session(id))
                .unwrap_or_else(|| manager.create_session())
        });

        let controller = self.shared.hosts.select(host_name.as_deref());
        let lookup = controller.lookup(&head.method, &head.path, &query);

        let mut ctx = WriteContext {
            version: head.version,
            method: head.method.clone(),
            keep_alive,
            host: host_name,
            range: header_string(&request_headers, header::RANGE),
            if_modified_since: header_string(&request_headers, header::IF_MODIFIED_SINCE)
                .and_then(|value| httpdate::parse_http_date(&value).ok()),
            if_none_match: header_string(&request_headers, header::IF_NONE_MATCH),
            if_match: header_string(&request_headers, header::IF_MATCH),
            session_cookies,
            session: None,
            date: SystemTime::now(),
        };

        let (response, session) = {
            let body = if body_consumed || framing == BodyFraming::None {
                Body::consumed()
            } else {
                Body::stream(&mut self.input)
            };
            let mut request = Request {
                method: head.method,
                scheme: self.conn.scheme(),
                path: head.path,
                raw_query: head.raw_query,
                query,
                version: head.version,
                headers: request_headers,
                identities: PathIdentities::default(),
                uploads,
                session,
                body,
                peer: self.conn.peer_addr(),
                connection_id: self.conn.id(),
            };
            let response = dispatch(&*self.shared.events, &controller, lookup, &mut request);
            (response, request.session.take())
        };
        ctx.session = session;

        if let Some(target) = response.write_queue().cloned() {
            if target != self.queue {
                return Step::Hop {
                    target,
                    response,
                    ctx,
                    uploads: upload_set,
                };
            }
        }

        self.write_and_conclude(response, ctx, close_reason)
    }

    /// Steps 10–12: write, drain what the handler left unread, and decide
    /// whether the connection lives on.
    fn write_and_conclude(
        &mut self,
        response: Response,
        ctx: WriteContext,
        close_reason: DisconnectReason,
    ) -> Step {
        let keep_alive = ctx.keep_alive;
        let result = write_response(
            ctx,
            response,
            &self.shared.writer,
            Some(&mut self.input),
            &mut self.output,
        );

        match result {
            Ok(WriteOutcome::Upgrade(handler)) => Step::Upgrade(handler),
            Ok(outcome) => {
                self.served += 1;
                if !self.input.body_exhausted() {
                    if let Err(err) = self.input.drain_body() {
                        self.shared.events.server_error(&Error::Stream(err));
                        return Step::Close(DisconnectReason::Error);
                    }
                }
                self.input.end_body();

                let stay = matches!(outcome, WriteOutcome::KeepAlive)
                    && keep_alive
                    && self.conn.is_alive()
                    && !self.token.is_cancelled()
                    && !self.shared.scheduler.is_shutdown();
                if stay {
                    Step::Next
                } else if self.token.is_cancelled() || self.shared.scheduler.is_shutdown() {
                    Step::Close(DisconnectReason::Shutdown)
                } else {
                    Step::Close(close_reason)
                }
            }
            Err(err) => {
                self.shared.events.server_error(&err);
                if !self.output.head_written() && self.output.is_connected() {
                    self.respond_plain(err.status());
                }
                Step::Close(DisconnectReason::Error)
            }
        }
    }

    /// Answers a protocol-level failure with its status, when the wire is
    /// still in a state to carry one, and closes.
    fn refuse(&mut self, err: Error) -> Step {
        self.shared.events.server_error(&err);
        if !self.output.head_written() && self.output.is_connected() {
            self.respond_plain(err.status());
        }
        Step::Close(DisconnectReason::Error)
    }

    fn respond_plain(&mut self, status: StatusCode) {
        let body = format!("{}\n", status.canonical_reason().unwrap_or("Error"));
        let ctx = WriteContext {
            keep_alive: false,
            date: SystemTime::now(),
            ..WriteContext::default()
        };
        write_response(
            ctx,
            Response::text(status, body),
            &self.shared.writer,
            None,
            &mut self.output,
        )
        .ok();
    }

    /// Transfers the connection, the pending response, and upload cleanup
    /// to the target queue, then writes there.
    fn hop(mut self, target: WorkerQueue, response: Response, ctx: WriteContext, uploads: UploadSet) {
        self.shared.scheduler.release(&self.queue);
        match self.shared.scheduler.wait_for_queue(&target, Some(&self.token)) {
            Ok(()) => {
                log::trace!("{} hops to queue {:?}", self.conn.id(), target.label());
                self.queue = target.clone();
                let shared = self.shared.clone();
                shared.scheduler.execute(&target, move || {
                    self.conclude_hopped(response, ctx, uploads);
                });
            }
            Err(cause) => {
                let err = Error::QueueHop {
                    queue: target,
                    cause: Box::new(cause),
                };
                self.shared.events.server_error(&err);
                self.finish_without_slot(DisconnectReason::Shutdown);
            }
        }
    }

    /// Runs on the hopped-to queue: write, clean up the transferred
    /// uploads, and either fall back to the request queue or wind down.
    fn conclude_hopped(mut self, response: Response, ctx: WriteContext, uploads: UploadSet) {
        let close_reason = if ctx.keep_alive {
            DisconnectReason::KeepAliveExhausted
        } else {
            DisconnectReason::ConnectionClose
        };
        let step = self.write_and_conclude(response, ctx, close_reason);
        drop(uploads);
        match step {
            Step::Next => self.requeue_for_requests(),
            Step::Close(reason) => self.finish(reason),
            Step::Upgrade(handler) => self.upgraded(handler),
            Step::Hop { .. } => unreachable!("a hopped response cannot hop again"),
        }
    }

    /// A keep-alive connection returns to the request queue before its
    /// next head is read.
    fn requeue_for_requests(mut self) {
        if self.queue == WorkerQueue::Request {
            return self.resume();
        }
        self.shared.scheduler.release(&self.queue);
        match self
            .shared
            .scheduler
            .wait_for_queue(&WorkerQueue::Request, Some(&self.token))
        {
            Ok(()) => {
                self.queue = WorkerQueue::Request;
                let shared = self.shared.clone();
                shared
                    .scheduler
                    .execute(&WorkerQueue::Request, move || self.resume());
            }
            Err(_) => self.finish_without_slot(DisconnectReason::Shutdown),
        }
    }

    /// Hands the raw streams to an upgrade handler (the WebSocket frame
    /// loop) and blocks on this queue until it returns.
    fn upgraded(mut self, handler: Box<dyn UpgradeHandler>) {
        let input = mem::replace(&mut self.input, InputStream::new(io::empty()));
        let output = mem::replace(&mut self.output, OutputStream::new(io::sink()));
        handler.handle(UpgradedConnection {
            input,
            output,
            cancel: self.token.clone(),
            connection_id: self.conn.id(),
        });
        let reason = if self.token.is_cancelled() || self.shared.scheduler.is_shutdown() {
            DisconnectReason::Shutdown
        } else {
            DisconnectReason::ClientClosed
        };
        self.finish(reason);
    }

    fn finish(self, reason: DisconnectReason) {
        self.shared.scheduler.release(&self.queue);
        self.finish_without_slot(reason);
    }

    fn finish_without_slot(self, reason: DisconnectReason) {
        self.conn.shutdown();
        self.shared.scheduler.deregister_worker(self.worker_id);
        self.shared
            .events
            .client_disconnected(self.conn.id(), reason);
        log::debug!("{} disconnected: {reason:?}", self.conn.id());
    }
}

/// Route lookup outcome → handler invocation → response, with the
/// controller hooks covering every failure.
fn dispatch(
    events: &dyn ServerEvents,
    controller: &RouteController,
    lookup: Lookup,
    request: &mut Request<'_>,
) -> Response {
    match lookup {
        Lookup::Found {
            handler,
            identities,
        } => {
            request.identities = identities;
            match handler.handle(request) {
                Ok(response) => response,
                Err(HandlerFailure::NotFound) => not_found(events, controller, request),
                Err(HandlerFailure::BadRequest(message)) => {
                    events.server_error(&Error::Handler(message.clone().into()));
                    Response::text(StatusCode::BAD_REQUEST, format!("{message}\n"))
                }
                Err(HandlerFailure::Internal(cause)) => {
                    let err = Error::Handler(cause);
                    events.server_error(&err);
                    controller.internal_error_response(&err)
                }
            }
        }
        Lookup::MethodNotAllowed(allowed) => {
            events.server_error(&Error::Route(RouteError::MethodNotAllowed(
                request.method().clone(),
            )));
            let allow = allowed
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            Response::text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n")
                .header(header::ALLOW, allow)
        }
        Lookup::NotFound => {
            events.server_error(&Error::Route(RouteError::NotFound(
                request.path().to_owned(),
            )));
            not_found(events, controller, request)
        }
    }
}

fn not_found(
    events: &dyn ServerEvents,
    controller: &RouteController,
    request: &mut Request<'_>,
) -> Response {
    match controller.not_found_handler().handle(request) {
        Ok(response) => response,
        Err(failure) => {
            events.server_error(&Error::Handler(failure.into()));
            Response::text(StatusCode::NOT_FOUND, "Not found\n")
        }
    }
}

fn expects_continue(request_headers: &http::HeaderMap) -> bool {
    request_headers
        .get(header::EXPECT)
        .map(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
        .unwrap_or(false)
}

fn header_string(request_headers: &http::HeaderMap, name: header::HeaderName) -> Option<String> {
    request_headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::to_owned)
}

/// Hosts become directory names for upload spillover; anything outside a
/// conservative set is flattened.
fn sanitize_host(host: Option<&str>) -> String {
    match host {
        Some(host) if !host.is_empty() => host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
        _ => "default".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_unix_addresses() {
        assert!(matches!(
            Address::parse("127.0.0.1:0").unwrap(),
            Address::Tcp(_)
        ));
        assert!(matches!(
            Address::parse("[::1]:8080").unwrap(),
            Address::Tcp(addr) if addr.is_ipv6()
        ));
        assert_eq!(
            Address::parse("unix:///tmp/petrel.sock").unwrap(),
            Address::Unix(PathBuf::from("/tmp/petrel.sock"))
        );
        assert!(Address::parse("not an address").is_err());
    }

    #[test]
    fn sanitizes_hosts_for_upload_directories() {
        assert_eq!(sanitize_host(Some("example.com")), "example.com");
        assert_eq!(sanitize_host(Some("evil/../../host")), "evil_.._.._host");
        assert_eq!(sanitize_host(None), "default");
        assert_eq!(sanitize_host(Some("")), "default");
    }

    #[test]
    #[should_panic(expected = "queue limit must be positive or -1")]
    fn zero_queue_limits_are_rejected() {
        Server::builder().queue_limit(WorkerQueue::Request, 0);
    }
}
