//! Typed accessors over [`http::HeaderMap`].
//!
//! Wherever the `headers` crate models a field, these helpers go through
//! its typed decoding; the rest (ordered transfer encodings, q-value
//! lists) is decoded here with the same conventions.

use headers::{HeaderMapExt};
use http::{header, HeaderMap};
use mime::Mime;

use crate::error::MalformedRequest;

/// Duplicated headers accumulate as a comma-joined value. Set-Cookie is the
/// exception and must be read with `get_all` instead.
pub fn joined_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(&name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

pub fn content_type(headers: &HeaderMap) -> Option<Mime> {
    headers.typed_get::<headers::ContentType>().map(Mime::from)
}

pub fn is_urlencoded_form(headers: &HeaderMap) -> bool {
    content_type(headers)
        .map(|mime| {
            mime.type_() == mime::APPLICATION && mime.subtype() == mime::WWW_FORM_URLENCODED
        })
        .unwrap_or(false)
}

pub fn multipart_boundary(headers: &HeaderMap) -> Option<String> {
    let mime = content_type(headers)?;
    if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA {
        mime.get_param(mime::BOUNDARY)
            .map(|boundary| boundary.as_str().to_owned())
    } else {
        None
    }
}

pub fn charset(headers: &HeaderMap) -> Option<String> {
    content_type(headers)?
        .get_param(mime::CHARSET)
        .map(|charset| charset.as_str().to_owned())
}

/// The transfer encodings applied to the message, in application order.
/// The `headers` crate only answers "is it chunked", so the list itself is
/// decoded here.
pub fn transfer_encodings(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|encoding| encoding.trim().to_ascii_lowercase())
        .filter(|encoding| !encoding.is_empty())
        .collect()
}

pub fn is_chunked(headers: &HeaderMap) -> bool {
    transfer_encodings(headers)
        .iter()
        .any(|encoding| encoding == "chunked")
}

/// Typed Content-Length; duplicated values must agree.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, MalformedRequest> {
    headers
        .typed_try_get::<headers::ContentLength>()
        .map(|length| length.map(|length| length.0))
        .map_err(|_| MalformedRequest::InvalidContentLength)
}

pub fn host(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::HOST)?
        .to_str()
        .ok()
        .map(|host| host.trim().to_owned())
}

/// Host with any `:port` suffix removed, for route-controller lookup and
/// cookie domains.
pub fn host_name(headers: &HeaderMap) -> Option<String> {
    if let Some(host) = headers.typed_get::<headers::Host>() {
        return Some(host.hostname().to_owned());
    }
    host(headers)
}

pub fn connection_contains(headers: &HeaderMap, token: &str) -> bool {
    headers
        .typed_get::<headers::Connection>()
        .map(|connection| connection.contains(token))
        .unwrap_or(false)
}

pub fn upgrade_contains(headers: &HeaderMap, protocol: &str) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(protocol))
}

/// Request cookies as ordered name/value pairs.
pub fn request_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .typed_get::<headers::Cookie>()
        .map(|cookies| {
            cookies
                .iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// An Accept-style list ordered by descending q-value; order of equal
/// weights follows the wire.
pub fn q_ordered(headers: &HeaderMap, name: header::HeaderName) -> Vec<(String, f32)> {
    let mut entries: Vec<(String, f32)> = headers
        .get_all(&name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let mut parts = entry.split(';').map(str::trim);
            let item = parts.next()?.to_owned();
            let q = parts
                .filter_map(|param| param.strip_prefix("q="))
                .find_map(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((item, q))
        })
        .collect();
    entries.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    entries
}

pub fn accept(headers: &HeaderMap) -> Vec<(String, f32)> {
    q_ordered(headers, header::ACCEPT)
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn header_map(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn joins_duplicated_headers_with_commas() {
        let headers = header_map(&[
            (header::ACCEPT_ENCODING, "gzip"),
            (header::ACCEPT_ENCODING, "br"),
        ]);
        assert_eq!(
            joined_value(&headers, header::ACCEPT_ENCODING).as_deref(),
            Some("gzip, br")
        );
    }

    #[test]
    fn extracts_content_type_parameters() {
        let headers = header_map(&[(
            header::CONTENT_TYPE,
            "multipart/form-data; boundary=abc123",
        )]);
        assert_eq!(multipart_boundary(&headers).as_deref(), Some("abc123"));

        let headers = header_map(&[(header::CONTENT_TYPE, "text/plain; charset=utf-8")]);
        assert_eq!(charset(&headers).as_deref(), Some("utf-8"));
        assert!(multipart_boundary(&headers).is_none());
    }

    #[test]
    fn recognizes_urlencoded_forms() {
        let headers = header_map(&[(
            header::CONTENT_TYPE,
            "application/x-www-form-urlencoded; charset=utf-8",
        )]);
        assert!(is_urlencoded_form(&headers));

        let headers = header_map(&[(header::CONTENT_TYPE, "text/plain")]);
        assert!(!is_urlencoded_form(&headers));
    }

    #[test]
    fn transfer_encodings_keep_their_order() {
        let headers = header_map(&[(header::TRANSFER_ENCODING, "gzip, Chunked")]);
        assert_eq!(transfer_encodings(&headers), ["gzip", "chunked"]);
        assert!(is_chunked(&headers));
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let headers = header_map(&[
            (header::CONTENT_LENGTH, "5"),
            (header::CONTENT_LENGTH, "6"),
        ]);
        assert!(content_length(&headers).is_err());

        let headers = header_map(&[(header::CONTENT_LENGTH, "42")]);
        assert_eq!(content_length(&headers).unwrap(), Some(42));
    }

    #[test]
    fn strips_ports_from_hosts() {
        let headers = header_map(&[(header::HOST, "example.com:8080")]);
        assert_eq!(host_name(&headers).as_deref(), Some("example.com"));
        assert_eq!(host(&headers).as_deref(), Some("example.com:8080"));
    }

    #[test]
    fn connection_tokens_match_case_insensitively() {
        let headers = header_map(&[(header::CONNECTION, "keep-alive, Upgrade")]);
        assert!(connection_contains(&headers, "upgrade"));
        assert!(!connection_contains(&headers, "close"));
    }

    #[test]
    fn orders_accept_by_q_value() {
        let headers = header_map(&[(
            header::ACCEPT,
            "text/html;q=0.5, application/json, text/plain;q=0.8",
        )]);
        let accepted: Vec<String> = accept(&headers).into_iter().map(|(item, _)| item).collect();
        assert_eq!(accepted, ["application/json", "text/plain", "text/html"]);
    }

    #[test]
    fn parses_request_cookie_pairs() {
        let headers = header_map(&[(header::COOKIE, "a=1; session-id=abc")]);
        assert_eq!(
            request_cookies(&headers),
            [
                ("a".to_owned(), "1".to_owned()),
                ("session-id".to_owned(), "abc".to_owned()),
            ]
        );
    }
}
