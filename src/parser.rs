//! Byte-exact parsing of the request head, header block, and body framing
//! selection.

use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};

use crate::{
    error::{BodyDecodeError, Error, MalformedRequest},
    headers,
    query::{self, QueryItems},
    stream::InputStream,
};

/// The parsed request line plus the derived path and query items.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub path: String,
    pub raw_query: Option<String>,
    pub query: QueryItems,
    pub version: Version,
}

pub(crate) fn read_request_head(input: &mut InputStream) -> Result<RequestHead, Error> {
    let line = input.read_line().map_err(Error::Stream)?;
    parse_request_line(&line)
}

fn parse_request_line(line: &str) -> Result<RequestHead, Error> {
    let tokens: Vec<&str> = line.split(' ').collect();
    let (method, target, version) = match tokens.as_slice() {
        [method, target, version] if !method.is_empty() && !target.is_empty() => {
            (*method, *target, *version)
        }
        _ => {
            return Err(MalformedRequest::InvalidRequestHead(line.to_owned()).into());
        }
    };

    if !version.starts_with("HTTP/") {
        return Err(MalformedRequest::InvalidRequestHead(line.to_owned()).into());
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(MalformedRequest::UnsupportedVersion(version.to_owned()).into()),
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| MalformedRequest::InvalidRequestHead(line.to_owned()))?;

    let (raw_path, raw_query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (target, None),
    };
    let path = query::decode_component(raw_path, false)
        .ok_or_else(|| MalformedRequest::InvalidRequestHead(line.to_owned()))?;
    let query = raw_query
        .as_deref()
        .map(QueryItems::parse)
        .unwrap_or_default();

    Ok(RequestHead {
        method,
        path,
        raw_query,
        query,
        version,
    })
}

/// Reads header lines until the empty line. Duplicates accumulate in the
/// map; lines without a `": "` separator are stored with an empty value.
pub(crate) fn read_header_block(input: &mut InputStream) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    loop {
        let line = input.read_line().map_err(Error::Stream)?;
        if line.is_empty() {
            return Ok(headers);
        }

        let (name, value) = match line.split_once(": ") {
            Some((name, value)) => (name, value),
            None => (line.as_str(), ""),
        };

        if value.chars().any(|c| c.is_control() && c != '\t') {
            return Err(MalformedRequest::MalformedHeader(line.clone()).into());
        }

        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| MalformedRequest::MalformedHeader(line.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| MalformedRequest::MalformedHeader(line.clone()))?;
        headers.append(name, value);
    }
}

/// How the body of the current request is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Chunked,
    Fixed(u64),
    None,
}

/// Selection rules, in order: chunked transfer encoding, then
/// Content-Length, otherwise no body. Content-Length combined with chunked
/// is rejected.
pub(crate) fn body_framing(headers: &HeaderMap) -> Result<BodyFraming, MalformedRequest> {
    let encodings = headers::transfer_encodings(headers);
    if !encodings.is_empty() {
        if encodings != ["chunked"] {
            return Err(MalformedRequest::InvalidTransferEncoding);
        }
        if headers::content_length(headers)?.is_some() {
            return Err(MalformedRequest::InvalidTransferEncoding);
        }
        return Ok(BodyFraming::Chunked);
    }
    match headers::content_length(headers)? {
        Some(len) => Ok(BodyFraming::Fixed(len)),
        None => Ok(BodyFraming::None),
    }
}

/// Applies the framing decision to the input stream.
pub(crate) fn begin_body(input: &mut InputStream, framing: BodyFraming) {
    match framing {
        BodyFraming::Chunked => input.begin_chunked_body(),
        BodyFraming::Fixed(len) => input.begin_fixed_body(len),
        BodyFraming::None => input.end_body(),
    }
}

/// Reads an urlencoded form body and parses it into query items. The body
/// is bounded by its framing, or by a CRLF-CRLF terminator when no framing
/// was declared.
pub(crate) fn read_urlencoded_body(
    input: &mut InputStream,
    framing: BodyFraming,
    max_size: usize,
) -> Result<QueryItems, Error> {
    let bytes = match framing {
        BodyFraming::Fixed(len) if len as usize > max_size => {
            return Err(BodyDecodeError::PayloadTooLarge.into());
        }
        BodyFraming::Fixed(_) | BodyFraming::Chunked => {
            read_bounded(input, max_size)?
        }
        BodyFraming::None => read_until_blank_line(input, max_size)?,
    };
    Ok(query::parse_form(&bytes)?)
}

fn read_bounded(input: &mut InputStream, max_size: usize) -> Result<Vec<u8>, Error> {
    use std::io::Read;

    let mut bytes = Vec::new();
    let mut scratch = [0_u8; 8 * 1024];
    loop {
        match input.read(&mut scratch) {
            Ok(0) => return Ok(bytes),
            Ok(n) => {
                bytes.extend_from_slice(&scratch[..n]);
                if bytes.len() > max_size {
                    return Err(BodyDecodeError::PayloadTooLarge.into());
                }
            }
            Err(err) => return Err(Error::Stream(crate::error::StreamError::from_io(err))),
        }
    }
}

fn read_until_blank_line(input: &mut InputStream, max_size: usize) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();
    loop {
        match input.read_byte() {
            Ok(byte) => bytes.push(byte),
            Err(crate::error::StreamError::EndOfStream) => return Ok(bytes),
            Err(err) => return Err(err.into()),
        }
        if bytes.ends_with(b"\r\n\r\n") {
            bytes.truncate(bytes.len() - 4);
            return Ok(bytes);
        }
        if bytes.len() > max_size {
            return Err(BodyDecodeError::PayloadTooLarge.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use http::header;

    use super::*;

    fn input(wire: &[u8]) -> InputStream {
        InputStream::new(Cursor::new(wire.to_vec()))
    }

    #[test]
    fn parses_a_plain_request_line() {
        let mut input = input(b"GET /lolwut HTTP/1.1\r\n");
        let head = read_request_head(&mut input).unwrap();

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/lolwut");
        assert!(head.raw_query.is_none());
        assert_eq!(head.version, Version::HTTP_11);
    }

    #[test]
    fn decodes_the_path_and_splits_the_query() {
        let mut input = input(b"GET /a%20dir/file?x=1&x=2 HTTP/1.0\r\n");
        let head = read_request_head(&mut input).unwrap();

        assert_eq!(head.path, "/a dir/file");
        assert_eq!(head.raw_query.as_deref(), Some("x=1&x=2"));
        assert_eq!(head.query.get_all("x").collect::<Vec<_>>(), ["1", "2"]);
        assert_eq!(head.version, Version::HTTP_10);
    }

    #[test]
    fn rejects_request_lines_with_the_wrong_token_count() {
        for line in ["GET /", "GET / HTTP/1.1 extra", "GET  / HTTP/1.1", ""] {
            let wire = format!("{line}\r\n");
            let mut input = input(wire.as_bytes());
            assert!(matches!(
                read_request_head(&mut input),
                Err(Error::MalformedRequest(
                    MalformedRequest::InvalidRequestHead(_)
                )),
            ));
        }
    }

    #[test]
    fn rejects_non_http_versions() {
        let mut input1 = input(b"GET / SPDY/3\r\n");
        assert!(matches!(
            read_request_head(&mut input1),
            Err(Error::MalformedRequest(
                MalformedRequest::InvalidRequestHead(_)
            )),
        ));

        let mut input = input(b"GET / HTTP/2.0\r\n");
        assert!(matches!(
            read_request_head(&mut input),
            Err(Error::MalformedRequest(
                MalformedRequest::UnsupportedVersion(_)
            )),
        ));
    }

    #[test]
    fn header_block_accumulates_duplicates_in_order() {
        let mut input = input(b"Host: lol.com\r\nAccept: text/html\r\nAccept: text/plain\r\n\r\n");
        let headers = read_header_block(&mut input).unwrap();

        assert_eq!(headers.get(header::HOST).unwrap(), "lol.com");
        let accepts: Vec<_> = headers.get_all(header::ACCEPT).iter().collect();
        assert_eq!(accepts, ["text/html", "text/plain"]);
    }

    #[test]
    fn header_lines_without_separator_get_an_empty_value() {
        let mut input = input(b"x-flag\r\n\r\n");
        let headers = read_header_block(&mut input).unwrap();
        assert_eq!(headers.get("x-flag").unwrap(), "");
    }

    #[test]
    fn header_values_with_control_characters_are_rejected() {
        let mut input = input(b"x-bad: a\x07b\r\n\r\n");
        assert!(matches!(
            read_header_block(&mut input),
            Err(Error::MalformedRequest(MalformedRequest::MalformedHeader(_))),
        ));
    }

    #[test]
    fn framing_prefers_chunked_over_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        assert_eq!(body_framing(&headers).unwrap(), BodyFraming::Chunked);

        headers.insert(header::CONTENT_LENGTH, "5".parse().unwrap());
        assert!(matches!(
            body_framing(&headers),
            Err(MalformedRequest::InvalidTransferEncoding)
        ));
    }

    #[test]
    fn framing_rejects_unsupported_transfer_encodings() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, "gzip, chunked".parse().unwrap());
        assert!(matches!(
            body_framing(&headers),
            Err(MalformedRequest::InvalidTransferEncoding)
        ));
    }

    #[test]
    fn framing_defaults_to_an_empty_body() {
        let headers = HeaderMap::new();
        assert_eq!(body_framing(&headers).unwrap(), BodyFraming::None);

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, "42".parse().unwrap());
        assert_eq!(body_framing(&headers).unwrap(), BodyFraming::Fixed(42));
    }

    #[test]
    fn urlencoded_bodies_merge_into_query_items() {
        let mut input = input(b"msg=hello+world&n=1");
        input.begin_fixed_body(19);
        let items = read_urlencoded_body(&mut input, BodyFraming::Fixed(19), 1024).unwrap();

        assert_eq!(items.get("msg"), Some("hello world"));
        assert_eq!(items.get("n"), Some("1"));
    }

    #[test]
    fn unframed_urlencoded_bodies_stop_at_the_blank_line() {
        let mut input = input(b"a=1&b=2\r\n\r\nleftover");
        let items = read_urlencoded_body(&mut input, BodyFraming::None, 1024).unwrap();

        assert_eq!(items.get("a"), Some("1"));
        assert_eq!(items.get("b"), Some("2"));
    }
}
