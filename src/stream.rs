//! Blocking byte streams over a connection.
//!
//! [`InputStream`] and [`OutputStream`] own the wire-level framing: CRLF
//! lines, exact-count reads, transparent chunked transfer decoding and
//! encoding, and rate-limited file writes. Everything above (parser, writer,
//! WebSocket codec) is expressed in terms of these two types, which keeps the
//! stream position byte-exact between requests on a keep-alive connection.

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    thread,
    time::Duration,
};

use crate::error::StreamError;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Paces [`OutputStream::write_file_range`] by writing `buffer_size` slices
/// and sleeping `pause` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    buffer_size: usize,
    pause: Duration,
}

impl RateLimiter {
    pub fn new(buffer_size: usize, pause: Duration) -> RateLimiter {
        RateLimiter {
            buffer_size: buffer_size.max(1),
            pause,
        }
    }

    /// Full speed: large buffers, no sleeping.
    pub fn unlimited() -> RateLimiter {
        RateLimiter {
            buffer_size: DEFAULT_BUFFER_SIZE,
            pause: Duration::ZERO,
        }
    }

    /// Limits the transfer to roughly `rate` bytes per second.
    pub fn bytes_per_second(rate: u64) -> RateLimiter {
        let buffer_size = 8 * 1024;
        let pause = Duration::from_secs_f64(buffer_size as f64 / rate.max(1) as f64);
        RateLimiter { buffer_size, pause }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::unlimited()
    }
}

enum Framing {
    Unframed,
    Fixed { remaining: u64 },
    Chunked(ChunkState),
}

enum ChunkState {
    Size,
    Data { remaining: u64 },
    Done,
}

/// Buffered reading half of a connection.
///
/// The stream starts unframed. Before a request body is handed out the
/// worker switches it into content-length or chunked framing, after which
/// [`Read`] yields exactly the body bytes and then signals end-of-stream.
pub struct InputStream {
    inner: BufReader<Box<dyn Read + Send>>,
    framing: Framing,
    reported_content_length: Option<u64>,
    connected: bool,
}

impl InputStream {
    pub fn new(reader: impl Read + Send + 'static) -> InputStream {
        InputStream {
            inner: BufReader::new(Box::new(reader)),
            framing: Framing::Unframed,
            reported_content_length: None,
            connected: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The Content-Length the peer reported for the current body, if any.
    /// Advisory only; framing is what actually bounds the reads.
    pub fn reported_content_length(&self) -> Option<u64> {
        self.reported_content_length
    }

    pub(crate) fn set_reported_content_length(&mut self, len: Option<u64>) {
        self.reported_content_length = len;
    }

    /// Switches into content-length framing: the next `len` bytes are the
    /// body, then reads yield end-of-stream.
    pub(crate) fn begin_fixed_body(&mut self, len: u64) {
        self.framing = Framing::Fixed { remaining: len };
        self.reported_content_length = Some(len);
    }

    /// Switches into chunked framing: chunk sizes and terminators are
    /// decoded transparently and end-of-stream surfaces after the zero
    /// chunk.
    pub(crate) fn begin_chunked_body(&mut self) {
        self.framing = Framing::Chunked(ChunkState::Size);
        self.reported_content_length = None;
    }

    /// Leaves body framing. Callers drain first; switching away from an
    /// unfinished body desynchronizes the connection.
    pub(crate) fn end_body(&mut self) {
        self.framing = Framing::Unframed;
        self.reported_content_length = None;
    }

    /// Whether the current body framing has been fully consumed.
    pub(crate) fn body_exhausted(&self) -> bool {
        match &self.framing {
            Framing::Unframed => true,
            Framing::Fixed { remaining } => *remaining == 0,
            Framing::Chunked(ChunkState::Done) => true,
            Framing::Chunked(_) => false,
        }
    }

    /// Reads the current body to completion, returning how many bytes were
    /// thrown away. Used to ready a keep-alive connection for its next
    /// request.
    pub(crate) fn drain_body(&mut self) -> Result<u64, StreamError> {
        let mut scratch = [0_u8; 8 * 1024];
        let mut drained = 0_u64;
        loop {
            match self.read(&mut scratch) {
                Ok(0) => return Ok(drained),
                Ok(n) => drained += n as u64,
                Err(err) => return Err(StreamError::from_io(err)),
            }
        }
    }

    pub fn read_byte(&mut self) -> Result<u8, StreamError> {
        let mut buf = [0_u8; 1];
        match self.read(&mut buf) {
            Ok(0) => Err(StreamError::EndOfStream),
            Ok(_) => Ok(buf[0]),
            Err(err) => Err(StreamError::from_io(err)),
        }
    }

    /// Reads exactly `count` bytes or fails with end-of-stream.
    pub fn read_exact_count(&mut self, count: usize) -> Result<Vec<u8>, StreamError> {
        let mut buf = vec![0_u8; count];
        self.read_exact(&mut buf).map_err(StreamError::from_io)?;
        Ok(buf)
    }

    /// Accumulates bytes until a CRLF suffix appears and returns the line
    /// without the terminator.
    pub fn read_line(&mut self) -> Result<String, StreamError> {
        let mut line = Vec::with_capacity(64);
        loop {
            let byte = self.read_byte()?;
            line.push(byte);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                return String::from_utf8(line).map_err(|_| StreamError::MalformedLine);
            }
        }
    }

    fn read_raw_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::with_capacity(16);
        let mut byte = [0_u8; 1];
        loop {
            if self.inner.read(&mut byte)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                return Ok(line);
            }
        }
    }

    fn next_chunk_size(&mut self) -> io::Result<u64> {
        let line = self.read_raw_line()?;
        match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => Ok(size),
            Ok(httparse::Status::Partial) | Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk size",
            )),
        }
    }

    fn consume_chunk_terminator(&mut self) -> io::Result<()> {
        let mut crlf = [0_u8; 2];
        self.inner.read_exact(&mut crlf)?;
        if crlf != *b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk is missing its CRLF terminator",
            ));
        }
        Ok(())
    }

    // The zero chunk may be followed by trailer lines; everything up to the
    // blank line belongs to this body.
    fn consume_chunk_trailers(&mut self) -> io::Result<()> {
        loop {
            let line = self.read_raw_line()?;
            if line == b"\r\n" {
                return Ok(());
            }
        }
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut self.framing {
            Framing::Unframed => {
                let read = self.inner.read(buf);
                if read.is_err() {
                    self.connected = false;
                }
                read
            }
            Framing::Fixed { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let max = buf.len().min(*remaining as usize);
                match self.inner.read(&mut buf[..max]) {
                    Ok(0) => {
                        self.connected = false;
                        Err(io::ErrorKind::UnexpectedEof.into())
                    }
                    Ok(n) => {
                        *remaining -= n as u64;
                        Ok(n)
                    }
                    Err(err) => {
                        self.connected = false;
                        Err(err)
                    }
                }
            }
            Framing::Chunked(_) => loop {
                match &mut self.framing {
                    Framing::Chunked(ChunkState::Done) => return Ok(0),
                    Framing::Chunked(ChunkState::Size) => {
                        let size = self.next_chunk_size()?;
                        if size == 0 {
                            self.consume_chunk_trailers()?;
                            self.framing = Framing::Chunked(ChunkState::Done);
                            return Ok(0);
                        }
                        self.framing = Framing::Chunked(ChunkState::Data { remaining: size });
                    }
                    Framing::Chunked(ChunkState::Data { remaining }) => {
                        let max = buf.len().min(*remaining as usize);
                        let n = self.inner.read(&mut buf[..max])?;
                        if n == 0 {
                            self.connected = false;
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                        *remaining -= n as u64;
                        if *remaining == 0 {
                            self.consume_chunk_terminator()?;
                            self.framing = Framing::Chunked(ChunkState::Size);
                        }
                        return Ok(n);
                    }
                    Framing::Unframed | Framing::Fixed { .. } => unreachable!(),
                }
            },
        }
    }
}

/// Writing half of a connection.
///
/// In chunked mode every write is framed as a hex-sized chunk; the zero
/// chunk terminator is written exactly once no matter how often
/// [`OutputStream::finish_chunked_body`] is called.
pub struct OutputStream {
    inner: Box<dyn Write + Send>,
    chunked: bool,
    chunks_finished: bool,
    head_written: bool,
    connected: bool,
}

impl OutputStream {
    pub fn new(writer: impl Write + Send + 'static) -> OutputStream {
        OutputStream {
            inner: Box::new(writer),
            chunked: false,
            chunks_finished: false,
            head_written: false,
            connected: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a response head already reached the wire since the last
    /// [`OutputStream::reset_for_response`]. Guards error recovery: once
    /// the head is out, a failure can only close the connection.
    pub(crate) fn head_written(&self) -> bool {
        self.head_written
    }

    pub(crate) fn mark_head_written(&mut self) {
        self.head_written = true;
    }

    pub(crate) fn reset_for_response(&mut self) {
        self.chunked = false;
        self.chunks_finished = false;
        self.head_written = false;
    }

    pub(crate) fn begin_chunked_body(&mut self) {
        self.chunked = true;
        self.chunks_finished = false;
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Terminates a chunked body with the zero chunk. Idempotent.
    pub(crate) fn finish_chunked_body(&mut self) -> io::Result<()> {
        if self.chunked && !self.chunks_finished {
            self.chunks_finished = true;
            self.write_raw(b"0\r\n\r\n")?;
            self.flush()?;
        }
        self.chunked = false;
        Ok(())
    }

    /// Writes a line of text followed by CRLF, outside of any chunk framing.
    /// Used for heads, which are always written before a body begins.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.write_raw(line.as_bytes())?;
        self.write_raw(b"\r\n")
    }

    /// Writes bytes through the current framing. In chunked mode an empty
    /// write is dropped rather than emitting a premature terminator.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.chunked {
            if bytes.is_empty() || self.chunks_finished {
                return Ok(());
            }
            self.write_raw(format!("{:x}\r\n", bytes.len()).as_bytes())?;
            self.write_raw(bytes)?;
            self.write_raw(b"\r\n")?;
            self.flush()
        } else {
            self.write_raw(bytes)
        }
    }

    /// Streams `len` bytes of `file` starting at `start`, pacing each
    /// buffer as directed by the limiter.
    pub fn write_file_range(
        &mut self,
        file: &mut File,
        start: u64,
        len: u64,
        limiter: &RateLimiter,
    ) -> io::Result<()> {
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0_u8; limiter.buffer_size()];
        let mut left = len;
        while left > 0 {
            let take = buf.len().min(left as usize);
            file.read_exact(&mut buf[..take])?;
            self.write_bytes(&buf[..take])?;
            left -= take as u64;
            if left > 0 && !limiter.pause().is_zero() {
                thread::sleep(limiter.pause());
            }
        }
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.inner.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                ) {
                    self.connected = false;
                }
                Err(err)
            }
        }
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn reads_lines_without_their_terminator() {
        let mut input = InputStream::new(Cursor::new(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()));
        assert_eq!(input.read_line().unwrap(), "GET / HTTP/1.1");
        assert_eq!(input.read_line().unwrap(), "Host: h");
        assert_eq!(input.read_line().unwrap(), "");
    }

    #[test]
    fn line_reading_fails_on_invalid_utf8() {
        let mut input = InputStream::new(Cursor::new(b"\xff\xfe\r\n".to_vec()));
        assert!(matches!(
            input.read_line(),
            Err(StreamError::MalformedLine)
        ));
    }

    #[test]
    fn fixed_body_yields_exactly_the_reported_bytes() {
        let mut input = InputStream::new(Cursor::new(b"lolwut ignored".to_vec()));
        input.begin_fixed_body(6);

        let mut body = Vec::new();
        input.read_to_end(&mut body).unwrap();

        assert_eq!(body, b"lolwut");
        assert!(input.body_exhausted());
        assert_eq!(input.reported_content_length(), Some(6));
    }

    #[test]
    fn chunked_body_ends_after_the_zero_chunk() {
        let wire = b"3\r\nlol\r\n3\r\nwut\r\n0\r\n\r\nnext request".to_vec();
        let mut input = InputStream::new(Cursor::new(wire));
        input.begin_chunked_body();

        let mut body = Vec::new();
        input.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"lolwut");
        assert!(input.body_exhausted());

        // The stream position is byte-exact after the terminator.
        input.end_body();
        let mut rest = Vec::new();
        input.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"next request");
    }

    #[test]
    fn chunked_body_accepts_extensions_and_trailers() {
        let wire = b"3;extension\r\nlol\r\n0\r\nx-trailer: 1\r\n\r\n".to_vec();
        let mut input = InputStream::new(Cursor::new(wire));
        input.begin_chunked_body();

        let mut body = Vec::new();
        input.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"lol");
    }

    #[test]
    fn chunked_body_rejects_a_missing_terminator() {
        let mut input = InputStream::new(Cursor::new(b"3\r\nlolXX0\r\n\r\n".to_vec()));
        input.begin_chunked_body();

        let mut body = Vec::new();
        let err = input.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn draining_skips_the_rest_of_the_body() {
        let mut input = InputStream::new(Cursor::new(b"0123456789rest".to_vec()));
        input.begin_fixed_body(10);

        let mut taken = [0_u8; 4];
        input.read_exact(&mut taken).unwrap();
        assert_eq!(input.drain_body().unwrap(), 6);

        input.end_body();
        assert_eq!(input.read_line().unwrap_err().is_disconnect(), true);
    }

    #[test]
    fn chunked_writes_are_framed_and_terminated_once() {
        let sink = crate::test_support::SharedBuf::new();
        let mut output = OutputStream::new(sink.clone());
        output.begin_chunked_body();
        output.write_bytes(b"chunk1").unwrap();
        output.write_bytes(b"").unwrap();
        output.write_bytes(b"chunk2").unwrap();
        output.finish_chunked_body().unwrap();
        output.finish_chunked_body().unwrap();

        assert_eq!(sink.bytes(), b"6\r\nchunk1\r\n6\r\nchunk2\r\n0\r\n\r\n");
    }

    #[test]
    fn unframed_writes_pass_through() {
        let sink = crate::test_support::SharedBuf::new();
        let mut output = OutputStream::new(sink.clone());
        output.write_line("HTTP/1.1 200 OK").unwrap();
        output.write_bytes(b"body").unwrap();

        assert_eq!(sink.bytes(), b"HTTP/1.1 200 OK\r\nbody");
    }

    #[test]
    fn file_ranges_are_written_in_limiter_buffers() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&(0..100).collect::<Vec<u8>>()).unwrap();

        let sink = crate::test_support::SharedBuf::new();
        let mut output = OutputStream::new(sink.clone());
        let limiter = RateLimiter::new(7, Duration::ZERO);
        output
            .write_file_range(&mut file, 20, 10, &limiter)
            .unwrap();

        assert_eq!(sink.bytes(), (20..30).collect::<Vec<u8>>());
    }
}
