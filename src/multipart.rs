//! Streaming `multipart/form-data` parsing with uploaded-file spillover.
//!
//! Part content is scanned byte-by-byte through a look-ahead window the
//! size of the part delimiter, so file uploads stream to disk without ever
//! buffering a whole part in memory.

use std::{
    collections::VecDeque,
    io::Write,
    path::{Path, PathBuf},
};

use mime::Mime;
use tempfile::NamedTempFile;

use crate::{
    error::{BodyDecodeError, Error},
    query::QueryItems,
    request::{UploadSet, UploadedFile},
    stream::InputStream,
};

#[derive(Debug, Default)]
struct PartHeaders {
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<Mime>,
}

enum PartSink {
    Text(Vec<u8>),
    File(NamedTempFile),
}

impl PartSink {
    fn push(&mut self, byte: u8) -> std::io::Result<()> {
        match self {
            PartSink::Text(buf) => {
                buf.push(byte);
                Ok(())
            }
            PartSink::File(file) => file.write_all(&[byte]),
        }
    }
}

/// Parses a multipart body framed on `input`. Text parts append to `query`;
/// file parts are streamed into unique temp files under `temp_dir` and
/// recorded in `uploads`, with cleanup tracked by `upload_set`.
pub(crate) fn parse_multipart(
    input: &mut InputStream,
    boundary: &str,
    temp_dir: &Path,
    query: &mut QueryItems,
    uploads: &mut Vec<UploadedFile>,
    upload_set: &mut UploadSet,
) -> Result<(), Error> {
    let opening = input.read_line().map_err(Error::Stream)?;
    if opening != format!("--{boundary}") {
        return Err(BodyDecodeError::BoundaryNotFound.into());
    }

    let delimiter = format!("\r\n--{boundary}").into_bytes();

    loop {
        let headers = read_part_headers(input)?;
        let part_name = headers.name.clone().unwrap_or_default();

        let mut sink = match headers.filename {
            // Temp files clean themselves up if an error aborts the part
            // before it is kept.
            Some(_) => PartSink::File(
                tempfile::Builder::new()
                    .prefix("upload-")
                    .tempfile_in(temp_dir)
                    .map_err(|cause| BodyDecodeError::Upload {
                        part: part_name.clone(),
                        cause,
                    })?,
            ),
            None => PartSink::Text(Vec::new()),
        };

        stream_part_content(input, &delimiter, &mut sink, &part_name)?;

        match sink {
            PartSink::Text(content) => {
                let text = String::from_utf8(content)
                    .map_err(|_| BodyDecodeError::InvalidTextPart {
                        part: part_name.clone(),
                    })?;
                query.push(part_name, text);
            }
            PartSink::File(file) => {
                let path = keep_upload(file, &part_name)?;
                upload_set.track(path.clone());
                uploads.push(UploadedFile::new(
                    part_name,
                    headers.filename.unwrap_or_default(),
                    path,
                    headers.content_type,
                ));
            }
        }

        match read_trailer(input)? {
            Trailer::MoreParts => continue,
            Trailer::End => return Ok(()),
        }
    }
}

fn read_part_headers(input: &mut InputStream) -> Result<PartHeaders, Error> {
    let mut headers = PartHeaders::default();
    let mut saw_disposition = false;

    loop {
        let line = input.read_line().map_err(Error::Stream)?;
        if line.is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(": ")
            .ok_or_else(|| BodyDecodeError::MalformedPartHeader(line.clone()))?;

        if name.eq_ignore_ascii_case("content-disposition") {
            let mut params = value.split(';').map(str::trim);
            if params.next() != Some("form-data") {
                return Err(BodyDecodeError::MalformedPartHeader(line.clone()).into());
            }
            for param in params {
                if let Some((key, raw)) = param.split_once('=') {
                    let unquoted = raw.trim_matches('"').to_owned();
                    match key {
                        "name" => headers.name = Some(unquoted),
                        "filename" => headers.filename = Some(unquoted),
                        _ => {}
                    }
                }
            }
            saw_disposition = true;
        } else if name.eq_ignore_ascii_case("content-type") {
            headers.content_type = value.parse().ok();
        }
    }

    if !saw_disposition {
        return Err(BodyDecodeError::MalformedPartHeader(
            "missing Content-Disposition".to_owned(),
        )
        .into());
    }
    Ok(headers)
}

/// Streams bytes into `sink` until the part delimiter appears, using a
/// look-ahead window the size of the delimiter so content bytes are only
/// emitted once they cannot be part of it.
fn stream_part_content(
    input: &mut InputStream,
    delimiter: &[u8],
    sink: &mut PartSink,
    part_name: &str,
) -> Result<(), Error> {
    let mut window: VecDeque<u8> = VecDeque::with_capacity(delimiter.len());

    loop {
        let byte = input.read_byte().map_err(Error::Stream)?;
        if window.len() == delimiter.len() {
            let out = window.pop_front().unwrap_or_default();
            sink.push(out).map_err(|cause| BodyDecodeError::Upload {
                part: part_name.to_owned(),
                cause,
            })?;
        }
        window.push_back(byte);
        if window.len() == delimiter.len() && window.iter().eq(delimiter.iter()) {
            return Ok(());
        }
    }
}

enum Trailer {
    MoreParts,
    End,
}

/// After each part the wire carries either CRLF (more parts follow) or
/// `--` CRLF (end of body).
fn read_trailer(input: &mut InputStream) -> Result<Trailer, Error> {
    let trailer = input.read_exact_count(2).map_err(Error::Stream)?;
    match trailer.as_slice() {
        b"\r\n" => Ok(Trailer::MoreParts),
        b"--" => {
            let terminator = input.read_exact_count(2).map_err(Error::Stream)?;
            if terminator != b"\r\n" {
                return Err(BodyDecodeError::UnexpectedBoundaryTrailer.into());
            }
            Ok(Trailer::End)
        }
        _ => Err(BodyDecodeError::UnexpectedBoundaryTrailer.into()),
    }
}

fn keep_upload(file: NamedTempFile, part_name: &str) -> Result<PathBuf, Error> {
    file.keep()
        .map(|(_, path)| path)
        .map_err(|err| {
            BodyDecodeError::Upload {
                part: part_name.to_owned(),
                cause: err.error,
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct Parsed {
        query: QueryItems,
        uploads: Vec<UploadedFile>,
        // Dropping this removes the temp files; tests keep it alive while
        // asserting on upload contents.
        _upload_set: UploadSet,
    }

    fn parse(body: &[u8], boundary: &str, dir: &Path) -> Result<Parsed, Error> {
        let mut input = InputStream::new(Cursor::new(body.to_vec()));
        input.begin_fixed_body(body.len() as u64);

        let mut query = QueryItems::new();
        let mut uploads = Vec::new();
        let mut upload_set = UploadSet::default();
        parse_multipart(
            &mut input,
            boundary,
            dir,
            &mut query,
            &mut uploads,
            &mut upload_set,
        )?;
        Ok(Parsed {
            query,
            uploads,
            _upload_set: upload_set,
        })
    }

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a str, &'a [u8]),
    }

    fn assemble(boundary: &str, parts: &[Part]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match part {
                Part::Text(name, text) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.extend_from_slice(text.as_bytes());
                }
                Part::File(name, filename, content_type, content) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                             Content-Type: {content_type}\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(content);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        // Replace the final part separator with the closing delimiter.
        body.truncate(body.len() - 2);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    #[test]
    fn parses_text_and_file_parts() {
        let dir = tempfile::tempdir().unwrap();
        let body = assemble(
            "b",
            &[
                Part::Text("msg", "hi"),
                Part::File("f", "a.bin", "application/octet-stream", &[1, 2, 3]),
            ],
        );

        let parsed = parse(&body, "b", dir.path()).unwrap();

        assert_eq!(parsed.query.get("msg"), Some("hi"));
        assert_eq!(parsed.uploads.len(), 1);

        let upload = &parsed.uploads[0];
        assert_eq!(upload.field(), "f");
        assert_eq!(upload.filename(), "a.bin");
        assert_eq!(
            upload.content_type().map(|m| m.essence_str().to_owned()),
            Some("application/octet-stream".to_owned())
        );
        assert_eq!(std::fs::read(upload.path()).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn content_may_contain_near_boundary_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let tricky = "line\r\n--not-quite\r\nmore";
        let body = assemble("bound", &[Part::Text("t", tricky)]);

        let parsed = parse(&body, "bound", dir.path()).unwrap();
        assert_eq!(parsed.query.get("t"), Some(tricky));
    }

    #[test]
    fn round_trips_an_assembled_body() {
        let dir = tempfile::tempdir().unwrap();
        let parts = [
            Part::Text("a", "first"),
            Part::File("f", "x.bin", "application/octet-stream", b"\x00\x01\x02\xff"),
            Part::Text("b", "second"),
        ];
        let body = assemble("XbOuNdX", &parts);

        let parsed = parse(&body, "XbOuNdX", dir.path()).unwrap();

        // Reassembling from the parsed parts reproduces the body bytes.
        let reassembled = assemble(
            "XbOuNdX",
            &[
                Part::Text("a", parsed.query.get("a").unwrap()),
                Part::File(
                    parsed.uploads[0].field(),
                    parsed.uploads[0].filename(),
                    "application/octet-stream",
                    &std::fs::read(parsed.uploads[0].path()).unwrap(),
                ),
                Part::Text("b", parsed.query.get("b").unwrap()),
            ],
        );
        assert_eq!(reassembled, body);
    }

    #[test]
    fn rejects_a_missing_opening_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"--wrong\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nx\r\n--b--\r\n";
        assert!(matches!(
            parse(body, "b", dir.path()),
            Err(Error::BodyDecode(BodyDecodeError::BoundaryNotFound))
        ));
    }

    #[test]
    fn rejects_garbage_after_a_part_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let body =
            b"--b\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nx\r\n--bXX\r\n".to_vec();
        assert!(matches!(
            parse(&body, "b", dir.path()),
            Err(Error::BodyDecode(BodyDecodeError::UnexpectedBoundaryTrailer))
        ));
    }

    #[test]
    fn requires_a_content_disposition_header() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"--b\r\nContent-Type: text/plain\r\n\r\nx\r\n--b--\r\n";
        assert!(matches!(
            parse(body, "b", dir.path()),
            Err(Error::BodyDecode(BodyDecodeError::MalformedPartHeader(_)))
        ));
    }

    #[test]
    fn failed_parts_leave_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        // File part whose content never reaches a boundary.
        let body = b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x\"\r\n\r\ntruncated";
        assert!(parse(body, "b", dir.path()).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
