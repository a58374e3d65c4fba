use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
    time::Duration,
};

use petrel::{
    Response, RouteController, Server, ServerHandle, StatusCode, WorkerQueue,
};

fn start(routes: RouteController) -> (SocketAddr, ServerHandle, thread::JoinHandle<()>) {
    let server = Server::builder()
        .default_host(routes)
        .queue_limit(WorkerQueue::Request, 16)
        .thread_stop_timeout(Duration::from_millis(200))
        .bind("127.0.0.1:0")
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    let handle = server.handle();
    let join = thread::spawn(move || server.serve().expect("serve"));
    (addr, handle, join)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

/// Reads one response: the head up to the blank line plus a
/// content-length framed body.
fn read_response(reader: &mut BufReader<TcpStream>) -> (String, Vec<u8>) {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).expect("read head line");
        if read == 0 || line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }
    let len: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length: "))
        .map(|value| value.trim().parse().expect("content length"))
        .unwrap_or(0);
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body).expect("read body");
    (head, body)
}

#[test]
fn echoes_a_chunked_request_body() {
    let routes = RouteController::new()
        .post("/echo", |req: &mut petrel::Request<'_>| {
            let body = req.body().bytes().map_err(petrel::HandlerFailure::internal)?;
            Ok(Response::text(
                StatusCode::OK,
                String::from_utf8_lossy(&body).into_owned(),
            ))
        })
        .unwrap();
    let (addr, handle, join) = start(routes);

    let mut stream = connect(addr);
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n",
        )
        .unwrap();

    let mut reader = BufReader::new(stream);
    let (head, body) = read_response(&mut reader);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains("content-length: 5\r\n"));
    assert_eq!(body, b"hello");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn keep_alive_serves_sequential_requests_on_one_connection() {
    let routes = RouteController::new()
        .get("/count", |_req: &mut petrel::Request<'_>| {
            Ok(Response::text(StatusCode::OK, "ok"))
        })
        .unwrap();
    let (addr, handle, join) = start(routes);

    let stream = connect(addr);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    for _ in 0..3 {
        writer
            .write_all(b"GET /count HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut reader);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!head.contains("connection: close"));
        assert_eq!(body, b"ok");
    }

    drop(writer);
    drop(reader);
    handle.stop();
    join.join().unwrap();
}

#[test]
fn typed_route_captures_reach_the_handler() {
    let routes = RouteController::new()
        .get("/users/:id<UInt>", |req: &mut petrel::Request<'_>| {
            let id = req.identities().uint("id").expect("typed id");
            Ok(Response::text(StatusCode::OK, format!("user {id}")))
        })
        .unwrap();
    let (addr, handle, join) = start(routes);

    let mut stream = connect(addr);
    stream
        .write_all(b"GET /users/42 HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut BufReader::new(stream));
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"user 42");

    // A failing transform is a non-match, which falls through to 404.
    let mut stream = connect(addr);
    stream
        .write_all(b"GET /users/abc HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut BufReader::new(stream));
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {head}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn urlencoded_forms_merge_into_query_items() {
    let routes = RouteController::new()
        .post("/form", |req: &mut petrel::Request<'_>| {
            let msg = req.query().get("msg").unwrap_or("missing").to_owned();
            let from_url = req.query().get("src").unwrap_or("missing").to_owned();
            Ok(Response::text(StatusCode::OK, format!("{from_url}:{msg}")))
        })
        .unwrap();
    let (addr, handle, join) = start(routes);

    let form = "msg=hello+world";
    let request = format!(
        "POST /form?src=url HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\
         Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{form}",
        form.len(),
    );
    let mut stream = connect(addr);
    stream.write_all(request.as_bytes()).unwrap();

    let (head, body) = read_response(&mut BufReader::new(stream));
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"url:hello world");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn wrong_methods_get_405_with_allow() {
    let routes = RouteController::new()
        .get("/thing", |_req: &mut petrel::Request<'_>| {
            Ok(Response::text(StatusCode::OK, "ok"))
        })
        .unwrap();
    let (addr, handle, join) = start(routes);

    let mut stream = connect(addr);
    stream
        .write_all(b"POST /thing HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut BufReader::new(stream));
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(head.contains("allow: GET\r\n"));

    handle.stop();
    join.join().unwrap();
}

const MASK: [u8; 4] = [0xaa, 0xbb, 0xcc, 0xdd];

fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126);
    let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&MASK);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(index, byte)| byte ^ MASK[index % 4]),
    );
    frame
}

#[test]
fn websocket_echo_and_transparent_pings() {
    use petrel::websocket::{self, Event, Sender};

    let routes = RouteController::new()
        .get("/ws", |req: &mut petrel::Request<'_>| {
            websocket::upgrade(req, |event: Event, sender: &mut Sender<'_>| {
                if let Event::Text(text) = &event {
                    sender.send_text(text)?;
                }
                Ok(())
            })
        })
        .unwrap();
    let (addr, handle, join) = start(routes);

    let mut stream = connect(addr);
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let (head, _) = read_response(&mut reader);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "head: {head}");
    assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // Masked text "ping" comes back as an unmasked text frame.
    stream.write_all(&masked_frame(0x1, b"ping")).unwrap();
    let mut echo = [0_u8; 6];
    reader.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, &[0x81, 0x04, b'p', b'i', b'n', b'g']);

    // Pings are answered with the same payload and never reach the handler.
    stream.write_all(&masked_frame(0x9, &[0x01])).unwrap();
    let mut pong = [0_u8; 3];
    reader.read_exact(&mut pong).unwrap();
    assert_eq!(&pong, &[0x8a, 0x01, 0x01]);

    // Close handshake.
    stream
        .write_all(&masked_frame(0x8, &1000_u16.to_be_bytes()))
        .unwrap();
    let mut close = [0_u8; 4];
    reader.read_exact(&mut close).unwrap();
    assert_eq!(&close, &[0x88, 0x02, 0x03, 0xe8]);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn stopping_the_server_ends_serve() {
    let routes = RouteController::new();
    let (addr, handle, join) = start(routes);

    // Make sure the listener is actually accepting before stopping.
    let mut stream = connect(addr);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut BufReader::new(stream));
    assert!(head.starts_with("HTTP/1.1 404"));

    handle.stop();
    join.join().unwrap();
    assert!(handle.is_stopped());
}
