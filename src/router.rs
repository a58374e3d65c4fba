//! Compiled route path conditions.
//!
//! A pattern is compiled from its textual form once, at registration:
//!
//! ```text
//! path     := "/" segment ("/" segment)*
//! segment  := literal | "*" | "**" | ":" ident [ "{" regex "}" ]
//!             [ "<" transform ">" ] [ "{" params "}" ]
//! params   := param (";" param)*
//! param    := "@" name [ "?" ] [ "[" "{" regex "}" "]" ] [ "<" transform ">" ]
//! ```
//!
//! `*` matches a single segment, `**` the remaining path as one capture.
//! `:ident` captures the segment under `ident`, optionally constrained by a
//! regex the value must fully match and refined by a typed transform.
//! Parameter predicates constrain query items; a failing predicate or
//! transform makes the route a non-match rather than an error.

use std::{collections::HashMap, sync::Arc};

use regex::Regex;

use crate::{
    error::RouteError,
    query::QueryItems,
    request::{PathIdentities, PathIdentity, TypedValue},
};

/// Identity key under which a `**` tail is captured.
pub const TAIL_IDENTITY: &str = "**";

pub type TransformFn = Arc<dyn Fn(&str) -> Option<TypedValue> + Send + Sync>;

/// A typed transform applied to a captured string.
#[derive(Clone)]
pub enum Transform {
    Int,
    UInt,
    Custom(String, TransformFn),
}

impl Transform {
    fn apply(&self, raw: &str) -> Option<TypedValue> {
        match self {
            Transform::Int => raw.parse().ok().map(TypedValue::Int),
            Transform::UInt => raw.parse().ok().map(TypedValue::UInt),
            Transform::Custom(_, transform) => transform(raw),
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transform::Int => write!(f, "Int"),
            Transform::UInt => write!(f, "UInt"),
            Transform::Custom(name, _) => write!(f, "{name}"),
        }
    }
}

/// User-supplied transforms, looked up by the `<name>` that appears in
/// patterns. `Int` and `UInt` are built in.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    pub fn new() -> TransformRegistry {
        TransformRegistry::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        transform: impl Fn(&str) -> Option<TypedValue> + Send + Sync + 'static,
    ) {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    fn resolve(&self, name: &str) -> Result<Transform, RouteError> {
        match name {
            "Int" => Ok(Transform::Int),
            "UInt" => Ok(Transform::UInt),
            _ => self
                .transforms
                .get(name)
                .map(|transform| Transform::Custom(name.to_owned(), transform.clone()))
                .ok_or_else(|| RouteError::UnknownTransform(name.to_owned())),
        }
    }
}

#[derive(Debug)]
enum SegmentKind {
    Literal(String),
    Any,
    Tail,
    Pattern(Regex),
}

impl SegmentKind {
    // literal > regex-constrained identifier > identifier > * > **
    fn rank(&self, captured: bool) -> u8 {
        match self {
            SegmentKind::Literal(_) => 4,
            SegmentKind::Pattern(_) => 3,
            SegmentKind::Any if captured => 2,
            SegmentKind::Any => 1,
            SegmentKind::Tail => 0,
        }
    }
}

#[derive(Debug)]
struct ParamPredicate {
    name: String,
    required: bool,
    patterns: Vec<Regex>,
    transform: Option<Transform>,
}

#[derive(Debug)]
struct SegmentCondition {
    kind: SegmentKind,
    capture: Option<String>,
    transform: Option<Transform>,
    params: Vec<ParamPredicate>,
}

/// A compiled route path condition.
#[derive(Debug)]
pub struct RoutePattern {
    source: String,
    segments: Vec<SegmentCondition>,
}

impl RoutePattern {
    pub fn compile(pattern: &str, transforms: &TransformRegistry) -> Result<RoutePattern, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: reason.to_owned(),
        };

        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut segments = Vec::new();
        let mut seen_captures: Vec<String> = Vec::new();
        for text in split_path(pattern) {
            if matches!(segments.last(), Some(SegmentCondition { kind: SegmentKind::Tail, .. })) {
                return Err(invalid("'**' must be the last segment"));
            }
            let segment = parse_segment(text, transforms, pattern)?;
            if let Some(capture) = &segment.capture {
                if seen_captures.contains(capture) {
                    return Err(invalid("duplicate capture identifier"));
                }
                seen_captures.push(capture.clone());
            }
            segments.push(segment);
        }

        Ok(RoutePattern {
            source: pattern.to_owned(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Attempts to match a decoded path and its query items. Transform and
    /// parameter-predicate failures are non-matches.
    pub fn matches(&self, path: &str, query: &QueryItems) -> Option<PathIdentities> {
        let parts: Vec<&str> = split_path(path).collect();
        let has_tail = matches!(
            self.segments.last(),
            Some(SegmentCondition { kind: SegmentKind::Tail, .. })
        );
        if has_tail {
            if parts.len() < self.segments.len() - 1 {
                return None;
            }
        } else if parts.len() != self.segments.len() {
            return None;
        }

        let mut identities = PathIdentities::default();
        for (index, segment) in self.segments.iter().enumerate() {
            let raw = match segment.kind {
                SegmentKind::Tail => parts[index..].join("/"),
                _ => (*parts.get(index)?).to_owned(),
            };

            match &segment.kind {
                SegmentKind::Literal(literal) => {
                    if literal != &raw {
                        return None;
                    }
                }
                SegmentKind::Pattern(regex) => {
                    if !regex.is_match(&raw) {
                        return None;
                    }
                }
                SegmentKind::Any | SegmentKind::Tail => {}
            }

            for predicate in &segment.params {
                if !check_param(predicate, query, &mut identities) {
                    return None;
                }
            }

            let key = match (&segment.capture, &segment.kind) {
                (Some(capture), _) => Some(capture.clone()),
                (None, SegmentKind::Tail) => Some(TAIL_IDENTITY.to_owned()),
                _ => None,
            };
            if let Some(key) = key {
                let typed = match &segment.transform {
                    Some(transform) => Some(transform.apply(&raw)?),
                    None => None,
                };
                identities.insert(key, PathIdentity::new(raw, typed));
            }
        }

        Some(identities)
    }

    /// Per-segment specificity, compared lexicographically for tie-breaks.
    pub(crate) fn specificity(&self) -> Vec<u8> {
        self.segments
            .iter()
            .map(|segment| segment.kind.rank(segment.capture.is_some()))
            .collect()
    }
}

fn check_param(
    predicate: &ParamPredicate,
    query: &QueryItems,
    identities: &mut PathIdentities,
) -> bool {
    let value = match query.get(&predicate.name) {
        Some(value) => value,
        None => return !predicate.required,
    };
    if !predicate.patterns.is_empty()
        && !predicate.patterns.iter().any(|regex| regex.is_match(value))
    {
        return false;
    }
    let typed = match &predicate.transform {
        Some(transform) => match transform.apply(value) {
            Some(typed) => Some(typed),
            None => return false,
        },
        None => None,
    };
    if typed.is_some() {
        identities.insert(
            predicate.name.clone(),
            PathIdentity::new(value.to_owned(), typed),
        );
    }
    true
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn parse_segment(
    text: &str,
    transforms: &TransformRegistry,
    pattern: &str,
) -> Result<SegmentCondition, RouteError> {
    let invalid = |reason: String| RouteError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason,
    };

    let mut capture = None;

    let kind_end;
    let mut kind = if text.starts_with("**") {
        kind_end = 2;
        SegmentKind::Tail
    } else if text.starts_with('*') {
        kind_end = 1;
        SegmentKind::Any
    } else if let Some(ident) = text.strip_prefix(':') {
        let end = ident
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(ident.len());
        if end == 0 {
            return Err(invalid("empty capture identifier".to_owned()));
        }
        capture = Some(ident[..end].to_owned());
        kind_end = 1 + end;
        SegmentKind::Any
    } else {
        let end = text.find(['{', '<']).unwrap_or(text.len());
        kind_end = end;
        SegmentKind::Literal(text[..end].to_owned())
    };

    let rest = &text[kind_end..];
    let mut transform = None;
    let mut params = Vec::new();
    let mut cursor = 0;

    while cursor < rest.len() {
        match rest.as_bytes()[cursor] {
            b'{' => {
                let (block, consumed) = take_brace_block(&rest[cursor..])
                    .ok_or_else(|| invalid("unbalanced '{' in pattern".to_owned()))?;
                cursor += consumed;
                if block.starts_with('@') {
                    params = parse_params(block, transforms, pattern)?;
                } else {
                    if capture.is_none() {
                        return Err(invalid(
                            "regex condition requires a capture identifier".to_owned(),
                        ));
                    }
                    if !matches!(kind, SegmentKind::Any) {
                        return Err(invalid("duplicate regex condition".to_owned()));
                    }
                    let regex = Regex::new(&format!("^(?:{block})$"))
                        .map_err(|err| invalid(format!("invalid regex: {err}")))?;
                    kind = SegmentKind::Pattern(regex);
                }
            }
            b'<' => {
                let end = rest[cursor..]
                    .find('>')
                    .ok_or_else(|| invalid("unbalanced '<' in pattern".to_owned()))?;
                let name = &rest[cursor + 1..cursor + end];
                transform = Some(transforms.resolve(name)?);
                cursor += end + 1;
            }
            _ => {
                return Err(invalid(format!(
                    "unexpected {:?} after segment condition",
                    &rest[cursor..]
                )));
            }
        }
    }

    if transform.is_some() && capture.is_none() {
        return Err(invalid("transform requires a capture identifier".to_owned()));
    }

    Ok(SegmentCondition {
        kind,
        capture,
        transform,
        params,
    })
}

fn parse_params(
    block: &str,
    transforms: &TransformRegistry,
    pattern: &str,
) -> Result<Vec<ParamPredicate>, RouteError> {
    let invalid = |reason: String| RouteError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason,
    };

    let mut params = Vec::new();
    for part in split_params(block) {
        let part = part.trim();
        let rest = part
            .strip_prefix('@')
            .ok_or_else(|| invalid(format!("parameter {part:?} must start with '@'")))?;

        let name_end = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
            .unwrap_or(rest.len());
        if name_end == 0 {
            return Err(invalid("empty parameter name".to_owned()));
        }
        let name = rest[..name_end].to_owned();
        let mut rest = &rest[name_end..];

        let required = if let Some(after) = rest.strip_prefix('?') {
            rest = after;
            false
        } else {
            true
        };

        let mut patterns = Vec::new();
        if rest.starts_with('[') {
            let close = find_matching_bracket(rest)
                .ok_or_else(|| invalid("unbalanced '[' in parameter".to_owned()))?;
            let mut inner = &rest[1..close];
            while !inner.is_empty() {
                let (block, consumed) = take_brace_block(inner)
                    .ok_or_else(|| invalid("parameter patterns must be '{regex}' blocks".to_owned()))?;
                let regex = Regex::new(&format!("^(?:{block})$"))
                    .map_err(|err| invalid(format!("invalid regex: {err}")))?;
                patterns.push(regex);
                inner = &inner[consumed..];
            }
            rest = &rest[close + 1..];
        }

        let transform = if let Some(after) = rest.strip_prefix('<') {
            let end = after
                .find('>')
                .ok_or_else(|| invalid("unbalanced '<' in parameter".to_owned()))?;
            let transform = transforms.resolve(&after[..end])?;
            rest = &after[end + 1..];
            Some(transform)
        } else {
            None
        };

        if !rest.is_empty() {
            return Err(invalid(format!("unexpected {rest:?} in parameter")));
        }

        params.push(ParamPredicate {
            name,
            required,
            patterns,
            transform,
        });
    }
    Ok(params)
}

/// Takes a `{...}` block off the front of `text`, honoring nested and
/// escaped braces, and returns the content plus the bytes consumed.
fn take_brace_block(text: &str) -> Option<(&str, usize)> {
    if !text.starts_with('{') {
        return None;
    }
    let mut depth = 0_usize;
    let mut escaped = false;
    for (index, byte) in text.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' => escaped = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&text[1..index], index + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits a params block on `;` at depth zero, so regexes containing `;`
/// stay intact.
fn split_params(block: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut escaped = false;
    let mut start = 0;
    for (index, byte) in block.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' => escaped = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            b';' if depth == 0 => {
                parts.push(&block[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&block[start..]);
    parts
}

fn find_matching_bracket(text: &str) -> Option<usize> {
    let mut depth = 0_usize;
    let mut escaped = false;
    for (index, byte) in text.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' => escaped = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(pattern: &str) -> RoutePattern {
        RoutePattern::compile(pattern, &TransformRegistry::new()).unwrap()
    }

    fn matches(pattern: &str, path: &str) -> Option<PathIdentities> {
        compile(pattern).matches(path, &QueryItems::new())
    }

    #[test]
    fn literals_match_exactly() {
        assert!(matches("/users/all", "/users/all").is_some());
        assert!(matches("/users/all", "/users/one").is_none());
        assert!(matches("/users/all", "/users/all/x").is_none());
        assert!(matches("/", "/").is_some());
    }

    #[test]
    fn single_star_matches_one_segment() {
        assert!(matches("/files/*", "/files/report").is_some());
        assert!(matches("/files/*", "/files/a/b").is_none());
        assert!(matches("/files/*", "/files").is_none());
    }

    #[test]
    fn double_star_captures_the_remaining_path() {
        let identities = matches("/static/**", "/static/css/site.css").unwrap();
        assert_eq!(identities.raw(TAIL_IDENTITY), Some("css/site.css"));

        assert!(matches("/static/**", "/static").is_some());
        assert!(
            RoutePattern::compile("/static/**/more", &TransformRegistry::new()).is_err(),
            "tail segments must come last",
        );
    }

    #[test]
    fn identifiers_capture_their_segment() {
        let identities = matches("/users/:id", "/users/42").unwrap();
        assert_eq!(identities.raw("id"), Some("42"));
        assert!(identities.get("id").unwrap().typed().is_none());
    }

    #[test]
    fn uint_transforms_produce_typed_identities() {
        let pattern = compile("/users/:id<UInt>");

        let identities = pattern.matches("/users/42", &QueryItems::new()).unwrap();
        assert_eq!(identities.raw("id"), Some("42"));
        assert_eq!(identities.uint("id"), Some(42));

        // Transform failures are non-matches, not errors.
        assert!(pattern.matches("/users/abc", &QueryItems::new()).is_none());
        assert!(pattern.matches("/users/-1", &QueryItems::new()).is_none());
    }

    #[test]
    fn int_transform_accepts_negative_values() {
        let identities = matches("/delta/:n<Int>", "/delta/-17").unwrap();
        assert_eq!(identities.int("n"), Some(-17));
    }

    #[test]
    fn regex_conditions_must_fully_match() {
        let pattern = compile("/orders/:code{[a-z]{3}-\\d+}");
        assert!(pattern.matches("/orders/abc-123", &QueryItems::new()).is_some());
        assert!(pattern.matches("/orders/abcd-123", &QueryItems::new()).is_none());
        assert!(pattern.matches("/orders/xabc-123x", &QueryItems::new()).is_none());
    }

    #[test]
    fn custom_transforms_resolve_from_the_registry() {
        let mut transforms = TransformRegistry::new();
        transforms.register("Upper", |raw| {
            Some(TypedValue::Other(Arc::new(raw.to_uppercase())))
        });

        let pattern = RoutePattern::compile("/tags/:tag<Upper>", &transforms).unwrap();
        let identities = pattern.matches("/tags/rust", &QueryItems::new()).unwrap();
        let typed = identities.get("tag").unwrap().typed().unwrap();
        assert_eq!(typed.downcast_ref::<String>().unwrap(), "RUST");

        assert!(matches!(
            RoutePattern::compile("/tags/:tag<Nope>", &transforms),
            Err(RouteError::UnknownTransform(_))
        ));
    }

    #[test]
    fn required_params_gate_the_match() {
        let pattern = compile("/search{@q}");

        let mut query = QueryItems::new();
        assert!(pattern.matches("/search", &query).is_none());

        query.push("q", "rust");
        assert!(pattern.matches("/search", &query).is_some());
    }

    #[test]
    fn optional_params_only_constrain_when_present() {
        let pattern = compile("/list{@page?[{\\d+}]<UInt>}");

        let query = QueryItems::new();
        assert!(pattern.matches("/list", &query).is_some());

        let mut query = QueryItems::new();
        query.push("page", "3");
        let identities = pattern.matches("/list", &query).unwrap();
        assert_eq!(identities.uint("page"), Some(3));

        let mut query = QueryItems::new();
        query.push("page", "three");
        assert!(pattern.matches("/list", &query).is_none());
    }

    #[test]
    fn param_regex_lists_accept_any_alternative() {
        let pattern = compile("/feed{@format[{json}{xml}]}");

        for (value, expected) in [("json", true), ("xml", true), ("csv", false)] {
            let mut query = QueryItems::new();
            query.push("format", value);
            assert_eq!(pattern.matches("/feed", &query).is_some(), expected);
        }
    }

    #[test]
    fn specificity_ranks_literal_over_patterns_over_wildcards() {
        let literal = compile("/users/all");
        let pattern = compile("/users/:id{\\d+}");
        let ident = compile("/users/:id");
        let star = compile("/users/*");
        let tail = compile("/users/**");

        let mut ranked = [
            tail.specificity(),
            ident.specificity(),
            literal.specificity(),
            star.specificity(),
            pattern.specificity(),
        ];
        ranked.sort();
        ranked.reverse();
        assert_eq!(
            ranked,
            [
                literal.specificity(),
                pattern.specificity(),
                ident.specificity(),
                star.specificity(),
                tail.specificity(),
            ]
        );
    }

    #[test]
    fn duplicate_captures_are_rejected() {
        assert!(matches!(
            RoutePattern::compile("/a/:id/b/:id", &TransformRegistry::new()),
            Err(RouteError::InvalidPattern { .. })
        ));
    }
}
