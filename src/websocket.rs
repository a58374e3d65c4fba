//! WebSocket upgrade and framing (RFC 6455).
//!
//! [`upgrade`] validates the handshake and produces the
//! `101 Switching Protocols` response, tagged for the websocket worker
//! queue and carrying the frame loop as its upgrade handler. The codec
//! enforces client-to-server masking, reassembles fragmented messages,
//! answers pings transparently, and drives the close handshake.

use std::io::{self, Read, Write};

use bytes::Bytes;
use http::{header, StatusCode};
use sha1::{Digest, Sha1};

use crate::{
    error::{HandlerFailure, StreamError},
    headers,
    request::Request,
    response::{Response, UpgradedConnection},
    scheduler::WorkerQueue,
    stream::{InputStream, OutputStream},
};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// RFC 6455 close status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    InvalidFramePayloadData,
    PolicyViolation,
    InternalServerError,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::InvalidFramePayloadData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::InternalServerError => 1011,
            CloseCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1007 => CloseCode::InvalidFramePayloadData,
            1008 => CloseCode::PolicyViolation,
            1011 => CloseCode::InternalServerError,
            other => CloseCode::Other(other),
        }
    }
}

/// What the frame loop surfaces to the handler. Pings are answered
/// transparently and never appear here.
#[derive(Debug)]
pub enum Event {
    Connected,
    Text(String),
    Binary(Bytes),
    Pong(Bytes),
    Close(Option<CloseCode>, String),
    Disconnected,
}

/// The writing half handed to the handler alongside each event.
pub struct Sender<'a> {
    output: &'a mut OutputStream,
    close_sent: &'a mut bool,
}

impl Sender<'_> {
    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        write_frame(self.output, OP_TEXT, text.as_bytes(), true)
    }

    pub fn send_binary(&mut self, payload: &[u8]) -> io::Result<()> {
        write_frame(self.output, OP_BINARY, payload, true)
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> io::Result<()> {
        write_frame(self.output, OP_PING, payload, true)
    }

    pub fn send_pong(&mut self, payload: &[u8]) -> io::Result<()> {
        write_frame(self.output, OP_PONG, payload, true)
    }

    /// Sends a close frame; the loop winds down after the peer echoes it.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> io::Result<()> {
        send_close(self.output, self.close_sent, code, reason)
    }
}

pub trait WebSocketHandler: Send {
    fn on_event(&mut self, event: Event, sender: &mut Sender<'_>) -> io::Result<()>;
}

impl<F> WebSocketHandler for F
where
    F: FnMut(Event, &mut Sender<'_>) -> io::Result<()> + Send,
{
    fn on_event(&mut self, event: Event, sender: &mut Sender<'_>) -> io::Result<()> {
        self(event, sender)
    }
}

/// The `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    base64::encode(sha.finalize())
}

fn is_valid_key(key: &str) -> bool {
    base64::decode(key.trim())
        .map(|decoded| decoded.len() == 16)
        .unwrap_or(false)
}

/// Validates the upgrade request and builds the switching response. The
/// worker hops to the websocket queue before writing it, then hands the
/// raw streams to the frame loop.
pub fn upgrade(
    request: &Request<'_>,
    handler: impl WebSocketHandler + 'static,
) -> Result<Response, HandlerFailure> {
    let request_headers = request.headers();
    if !headers::upgrade_contains(request_headers, "websocket")
        || !headers::connection_contains(request_headers, "upgrade")
    {
        return Err(HandlerFailure::BadRequest(
            "not a websocket upgrade request".to_owned(),
        ));
    }
    let key = request_headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .filter(|key| is_valid_key(key))
        .ok_or_else(|| {
            HandlerFailure::BadRequest("missing or invalid Sec-WebSocket-Key".to_owned())
        })?;

    let accept = accept_key(key.trim());
    Ok(Response::empty(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .queue(WorkerQueue::WebSocket)
        .upgrade(move |upgraded: UpgradedConnection| {
            run_frame_loop(handler, upgraded);
        }))
}

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

#[derive(Debug)]
enum FrameError {
    /// The peer is gone; nothing more can be sent.
    Stream(StreamError),
    /// Protocol violation; close with this code.
    Protocol(CloseCode),
}

impl From<StreamError> for FrameError {
    fn from(err: StreamError) -> FrameError {
        FrameError::Stream(err)
    }
}

fn read_frame(input: &mut InputStream) -> Result<Frame, FrameError> {
    let first = input.read_byte()?;
    let fin = first & 0x80 != 0;
    if first & 0x70 != 0 {
        // Reserved bits without a negotiated extension.
        return Err(FrameError::Protocol(CloseCode::ProtocolError));
    }
    let opcode = first & 0x0F;

    let second = input.read_byte()?;
    if second & 0x80 == 0 {
        // Client-to-server frames must be masked.
        return Err(FrameError::Protocol(CloseCode::InvalidFramePayloadData));
    }

    let len = match second & 0x7F {
        126 => {
            let bytes = input.read_exact_count(2)?;
            u16::from_be_bytes([bytes[0], bytes[1]]) as u64
        }
        127 => {
            let bytes = input.read_exact_count(8)?;
            u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ])
        }
        len => len as u64,
    };

    let key = input.read_exact_count(4)?;
    let mut payload = input.read_exact_count(len as usize)?;
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[index % 4];
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

/// Server-to-client frames are never masked.
fn write_frame(output: &mut OutputStream, opcode: u8, payload: &[u8], fin: bool) -> io::Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(if fin { 0x80 } else { 0x00 } | opcode);
    match payload.len() {
        len if len < 126 => frame.push(len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    output.write_bytes(&frame)?;
    output.flush()
}

fn send_close(
    output: &mut OutputStream,
    close_sent: &mut bool,
    code: CloseCode,
    reason: &str,
) -> io::Result<()> {
    if *close_sent {
        return Ok(());
    }
    *close_sent = true;
    let mut payload = code.as_u16().to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    write_frame(output, OP_CLOSE, &payload, true)
}

/// Runs the frame loop until close, cancellation, or error. On
/// cancellation an unsent close goes out as `1001 Going Away`; error paths
/// that exit without a close send `1011`.
pub(crate) fn run_frame_loop(handler: impl WebSocketHandler, upgraded: UpgradedConnection) {
    let UpgradedConnection {
        mut input,
        mut output,
        cancel,
        connection_id,
    } = upgraded;
    let mut handler = handler;
    let mut close_sent = false;
    let mut clean_exit = false;

    let result = drive(
        &mut handler,
        &mut input,
        &mut output,
        &cancel,
        &mut close_sent,
        &mut clean_exit,
    );

    if let Err(err) = &result {
        log::debug!("websocket {connection_id} failed: {err}");
    }
    if !close_sent {
        let code = if cancel.is_cancelled() {
            CloseCode::GoingAway
        } else if result.is_err() || !clean_exit {
            CloseCode::InternalServerError
        } else {
            CloseCode::Normal
        };
        send_close(&mut output, &mut close_sent, code, "").ok();
    }

    let mut sender = Sender {
        output: &mut output,
        close_sent: &mut close_sent,
    };
    handler.on_event(Event::Disconnected, &mut sender).ok();
}

fn deliver<H: WebSocketHandler>(
    handler: &mut H,
    event: Event,
    output: &mut OutputStream,
    close_sent: &mut bool,
) -> io::Result<()> {
    let mut sender = Sender { output, close_sent };
    handler.on_event(event, &mut sender)
}

fn drive<H: WebSocketHandler>(
    handler: &mut H,
    input: &mut InputStream,
    output: &mut OutputStream,
    cancel: &crate::scheduler::CancelToken,
    close_sent: &mut bool,
    clean_exit: &mut bool,
) -> io::Result<()> {
    deliver(handler, Event::Connected, output, close_sent)?;

    // Fragmented message being reassembled: initial opcode + payload so far.
    let mut message: Option<(u8, Vec<u8>)> = None;

    loop {
        if cancel.is_cancelled() {
            send_close(output, close_sent, CloseCode::GoingAway, "")?;
            *clean_exit = true;
            return Ok(());
        }

        let frame = match read_frame(input) {
            Ok(frame) => frame,
            Err(FrameError::Stream(err)) => {
                // The peer vanished without a close handshake.
                *clean_exit = err.is_disconnect();
                *close_sent = *close_sent || err.is_disconnect();
                return Ok(());
            }
            Err(FrameError::Protocol(code)) => {
                send_close(output, close_sent, code, "")?;
                *clean_exit = true;
                return Ok(());
            }
        };

        // Control frames must not be fragmented.
        if !frame.fin && matches!(frame.opcode, OP_CLOSE | OP_PING | OP_PONG) {
            send_close(output, close_sent, CloseCode::InvalidFramePayloadData, "")?;
            *clean_exit = true;
            return Ok(());
        }

        match frame.opcode {
            OP_TEXT | OP_BINARY => {
                if message.is_some() {
                    // A new data frame in the middle of a fragmented message.
                    send_close(output, close_sent, CloseCode::PolicyViolation, "")?;
                    *clean_exit = true;
                    return Ok(());
                }
                if frame.fin {
                    let event = match data_event(frame.opcode, frame.payload) {
                        Some(event) => event,
                        None => {
                            send_close(
                                output,
                                close_sent,
                                CloseCode::InvalidFramePayloadData,
                                "",
                            )?;
                            *clean_exit = true;
                            return Ok(());
                        }
                    };
                    deliver(handler, event, output, close_sent)?;
                } else {
                    message = Some((frame.opcode, frame.payload));
                }
            }
            OP_CONTINUATION => match message.take() {
                Some((opcode, mut payload)) => {
                    payload.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let event = match data_event(opcode, payload) {
                            Some(event) => event,
                            None => {
                                send_close(
                                    output,
                                    close_sent,
                                    CloseCode::InvalidFramePayloadData,
                                    "",
                                )?;
                                *clean_exit = true;
                                return Ok(());
                            }
                        };
                        deliver(handler, event, output, close_sent)?;
                    } else {
                        message = Some((opcode, payload));
                    }
                }
                None => {
                    send_close(output, close_sent, CloseCode::ProtocolError, "")?;
                    *clean_exit = true;
                    return Ok(());
                }
            },
            OP_PING => {
                // Answered transparently, never surfaced.
                write_frame(output, OP_PONG, &frame.payload, true)?;
            }
            OP_PONG => {
                deliver(handler, Event::Pong(frame.payload.into()), output, close_sent)?;
            }
            OP_CLOSE => {
                let (code, reason) = parse_close_payload(&frame.payload);
                send_close(output, close_sent, code.unwrap_or(CloseCode::Normal), "")?;
                deliver(handler, Event::Close(code, reason), output, close_sent)?;
                *clean_exit = true;
                return Ok(());
            }
            _ => {
                send_close(output, close_sent, CloseCode::UnsupportedData, "")?;
                *clean_exit = true;
                return Ok(());
            }
        }
    }
}

fn data_event(opcode: u8, payload: Vec<u8>) -> Option<Event> {
    match opcode {
        OP_TEXT => String::from_utf8(payload).ok().map(Event::Text),
        OP_BINARY => Some(Event::Binary(payload.into())),
        _ => None,
    }
}

fn parse_close_payload(payload: &[u8]) -> (Option<CloseCode>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}
