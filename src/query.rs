//! Ordered query items and urlencoded form handling.
//!
//! Query items keep their wire order and preserve duplicated names, both for
//! the request-target query string and for `application/x-www-form-urlencoded`
//! bodies merged into it.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::BodyDecodeError;

// Everything outside the urlencoded-form safe set is escaped; spaces pass
// through here and become '+' afterwards.
const FORM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b' ');

/// An ordered list of `name=value` pairs, duplicates preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryItems {
    items: Vec<(String, String)>,
}

impl QueryItems {
    pub fn new() -> QueryItems {
        QueryItems::default()
    }

    /// Parses a raw query string. Undecodable components are kept verbatim
    /// rather than dropping the item.
    pub fn parse(raw: &str) -> QueryItems {
        let mut items = QueryItems::new();
        for pair in raw.split('&').filter(|pair| !pair.is_empty()) {
            let (name, value) = match pair.split_once('=') {
                Some((name, value)) => (name, value),
                None => (pair, ""),
            };
            items.push(
                decode_component(name, false).unwrap_or_else(|| name.to_owned()),
                decode_component(value, true).unwrap_or_else(|| value.to_owned()),
            );
        }
        items
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.push((name.into(), value.into()));
    }

    /// The first value under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value under `name`, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.items
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, String)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend_from(&mut self, other: QueryItems) {
        self.items.extend(other.items);
    }

    /// Re-encodes the items as an urlencoded form. Parsing the result
    /// reproduces the items, order and duplicates included.
    pub fn to_urlencoded(&self) -> String {
        self.items
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(name, FORM).to_string().replace(' ', "+"),
                    utf8_percent_encode(value, FORM).to_string().replace(' ', "+"),
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<'a> IntoIterator for &'a QueryItems {
    type Item = &'a (String, String);
    type IntoIter = std::slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Percent-decodes one component; `plus_as_space` applies the form rule of
/// turning `+` into a space first.
pub(crate) fn decode_component(component: &str, plus_as_space: bool) -> Option<String> {
    let component = if plus_as_space {
        component.replace('+', " ")
    } else {
        component.to_owned()
    };
    percent_decode_str(&component)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Strict parse of an `application/x-www-form-urlencoded` body.
pub(crate) fn parse_form(body: &[u8]) -> Result<QueryItems, BodyDecodeError> {
    let body = std::str::from_utf8(body).map_err(|_| BodyDecodeError::InvalidUrlencodedForm)?;
    let body = body.trim_end_matches(['\r', '\n']);

    let mut items = QueryItems::new();
    for pair in body.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        };
        let name = decode_component(name, false).ok_or(BodyDecodeError::InvalidUrlencodedForm)?;
        let value = decode_component(value, true).ok_or(BodyDecodeError::InvalidUrlencodedForm)?;
        items.push(name, value);
    }
    Ok(items)
}
