use serde_json::{Map, Value};

use crate::error::{Result, SecretsError};

/// One token of a compiled path pattern.
///
/// Patterns are dot-separated. `*` matches any mapping key and captures it;
/// `name[]` matches any index of the array field `name` and captures the
/// index. Everything else is a literal segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
    Literal(String),
    Wildcard,
    Array(String),
}

impl PathToken {
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, PathToken::Literal(_))
    }
}

/// Compile a dot-path pattern into tokens. Empty segments are dropped.
pub fn parse_pattern(pattern: &str) -> Vec<PathToken> {
    pattern
        .split('.')
        .map(str::trim)
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            if seg == "*" {
                PathToken::Wildcard
            } else if let Some(name) = seg.strip_suffix("[]") {
                if name.is_empty() {
                    PathToken::Literal(seg.to_string())
                } else {
                    PathToken::Array(name.to_string())
                }
            } else {
                PathToken::Literal(seg.to_string())
            }
        })
        .collect()
}

/// Number of capturing tokens in a compiled pattern.
pub fn dynamic_token_count(tokens: &[PathToken]) -> usize {
    tokens.iter().filter(|t| t.is_dynamic()).count()
}

/// Split a concrete dot-path into segments.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .map(str::trim)
        .filter(|seg| !seg.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join concrete segments back into a dot-path.
pub fn join_path(segments: &[String]) -> String {
    segments.join(".")
}

/// Canonical non-negative array index, rejecting signs and leading zeros.
fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || (segment.len() > 1 && segment.starts_with('0')) {
        return None;
    }
    if !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Match compiled tokens against a concrete segment list.
///
/// Literals must be equal; wildcard tokens capture the mapping key; array
/// tokens consume the field name plus one index segment and capture the
/// index. Returns the captured strings in order, or `None` on mismatch.
pub fn match_segments(tokens: &[PathToken], segments: &[String]) -> Option<Vec<String>> {
    let mut captures = Vec::new();
    let mut pos = 0usize;
    for token in tokens {
        match token {
            PathToken::Literal(lit) => {
                if segments.get(pos)? != lit {
                    return None;
                }
                pos += 1;
            }
            PathToken::Wildcard => {
                captures.push(segments.get(pos)?.clone());
                pos += 1;
            }
            PathToken::Array(name) => {
                if segments.get(pos)? != name {
                    return None;
                }
                let index = segments.get(pos + 1)?;
                parse_index(index)?;
                captures.push(index.clone());
                pos += 2;
            }
        }
    }
    if pos == segments.len() { Some(captures) } else { None }
}

/// Substitute captures back into tokens, producing concrete segments.
/// Returns `None` when the capture count does not match the pattern.
pub fn materialize(tokens: &[PathToken], captures: &[String]) -> Option<Vec<String>> {
    if dynamic_token_count(tokens) != captures.len() {
        return None;
    }
    let mut out = Vec::new();
    let mut next = captures.iter();
    for token in tokens {
        match token {
            PathToken::Literal(lit) => out.push(lit.clone()),
            PathToken::Wildcard => out.push(next.next()?.clone()),
            PathToken::Array(name) => {
                out.push(name.clone());
                let index = next.next()?;
                parse_index(index)?;
                out.push(index.clone());
            }
        }
    }
    Some(out)
}

/// One concrete location produced by expanding a pattern over a tree.
#[derive(Debug, Clone)]
pub struct PatternHit {
    pub segments: Vec<String>,
    pub captures: Vec<String>,
    pub value: Value,
}

/// Expand compiled tokens against a tree, iterating mapping keys for
/// wildcards and array indices for array tokens. Non-container values along
/// the way are skipped silently.
pub fn expand(root: &Value, tokens: &[PathToken]) -> Vec<PatternHit> {
    let mut hits = Vec::new();
    expand_inner(root, tokens, &mut Vec::new(), &mut Vec::new(), &mut hits);
    hits
}

fn expand_inner(
    node: &Value,
    tokens: &[PathToken],
    segments: &mut Vec<String>,
    captures: &mut Vec<String>,
    hits: &mut Vec<PatternHit>,
) {
    let Some((token, rest)) = tokens.split_first() else {
        hits.push(PatternHit {
            segments: segments.clone(),
            captures: captures.clone(),
            value: node.clone(),
        });
        return;
    };
    match token {
        PathToken::Literal(lit) => {
            let child = match node {
                Value::Object(map) => map.get(lit),
                Value::Array(items) => parse_index(lit).and_then(|i| items.get(i)),
                _ => None,
            };
            if let Some(child) = child {
                segments.push(lit.clone());
                expand_inner(child, rest, segments, captures, hits);
                segments.pop();
            }
        }
        PathToken::Wildcard => {
            if let Value::Object(map) = node {
                for (key, child) in map {
                    segments.push(key.clone());
                    captures.push(key.clone());
                    expand_inner(child, rest, segments, captures, hits);
                    captures.pop();
                    segments.pop();
                }
            }
        }
        PathToken::Array(name) => {
            let Some(Value::Array(items)) = node.get(name) else {
                return;
            };
            for (index, child) in items.iter().enumerate() {
                let index = index.to_string();
                segments.push(name.clone());
                segments.push(index.clone());
                captures.push(index);
                expand_inner(child, rest, segments, captures, hits);
                captures.pop();
                segments.pop();
                segments.pop();
            }
        }
    }
}

/// Read the value at a concrete path, if present.
pub fn get_path<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(parse_index(segment)?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn path_error(segments: &[String], message: impl Into<String>) -> SecretsError {
    SecretsError::Path {
        path: join_path(segments),
        message: message.into(),
    }
}

enum SetMode {
    Create,
    Existing,
}

/// Write `value` at `segments`, creating intermediate containers whose type
/// matches the next segment (array when numeric, mapping otherwise).
/// Returns whether the tree changed.
pub fn set_path_create_strict(
    root: &mut Value,
    segments: &[String],
    value: Value,
) -> Result<bool> {
    set_path(root, segments, value, SetMode::Create)
}

/// Write `value` at `segments`, requiring every container and the leaf slot
/// to already exist. Returns whether the tree changed.
pub fn set_path_existing_strict(
    root: &mut Value,
    segments: &[String],
    value: Value,
) -> Result<bool> {
    set_path(root, segments, value, SetMode::Existing)
}

fn set_path(
    root: &mut Value,
    segments: &[String],
    value: Value,
    mode: SetMode,
) -> Result<bool> {
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(path_error(segments, "empty path"));
    };
    let mut node = root;
    for (depth, segment) in parents.iter().enumerate() {
        let next_is_index = parse_index(&segments[depth + 1]).is_some();
        node = descend_mut(node, segment, next_is_index, &mode, &segments[..=depth])?;
    }
    write_leaf(node, leaf, value, &mode, segments)
}

fn descend_mut<'a>(
    node: &'a mut Value,
    segment: &str,
    next_is_index: bool,
    mode: &SetMode,
    walked: &[String],
) -> Result<&'a mut Value> {
    match node {
        Value::Object(map) => {
            let child = match mode {
                SetMode::Create => map.entry(segment.to_string()).or_insert_with(|| {
                    if next_is_index {
                        Value::Array(Vec::new())
                    } else {
                        Value::Object(Map::new())
                    }
                }),
                SetMode::Existing => map
                    .get_mut(segment)
                    .ok_or_else(|| path_error(walked, "missing intermediate container"))?,
            };
            check_container(child, next_is_index, walked)?;
            Ok(child)
        }
        Value::Array(items) => {
            let index = parse_index(segment)
                .ok_or_else(|| path_error(walked, "array segment must be a non-negative index"))?;
            if index >= items.len() {
                match mode {
                    SetMode::Create if index == items.len() => {
                        items.push(if next_is_index {
                            Value::Array(Vec::new())
                        } else {
                            Value::Object(Map::new())
                        });
                    }
                    _ => return Err(path_error(walked, "array index out of bounds")),
                }
            }
            let child = &mut items[index];
            check_container(child, next_is_index, walked)?;
            Ok(child)
        }
        _ => Err(path_error(walked, "intermediate value is not a container")),
    }
}

fn check_container(node: &Value, expect_array: bool, walked: &[String]) -> Result<()> {
    match (node, expect_array) {
        (Value::Array(_), true) | (Value::Object(_), false) => Ok(()),
        (Value::Array(_), false) => Err(path_error(
            walked,
            "expected a mapping but found an array",
        )),
        (Value::Object(_), true) => Err(path_error(
            walked,
            "expected an array but found a mapping",
        )),
        _ => Err(path_error(walked, "intermediate value is not a container")),
    }
}

fn write_leaf(
    node: &mut Value,
    leaf: &str,
    value: Value,
    mode: &SetMode,
    segments: &[String],
) -> Result<bool> {
    match node {
        Value::Object(map) => {
            if matches!(mode, SetMode::Existing) && !map.contains_key(leaf) {
                return Err(path_error(segments, "path does not exist"));
            }
            match map.get(leaf) {
                Some(existing) if *existing == value => Ok(false),
                _ => {
                    map.insert(leaf.to_string(), value);
                    Ok(true)
                }
            }
        }
        Value::Array(items) => {
            let index = parse_index(leaf)
                .ok_or_else(|| path_error(segments, "array segment must be a non-negative index"))?;
            if index < items.len() {
                if items[index] == value {
                    return Ok(false);
                }
                items[index] = value;
                Ok(true)
            } else if index == items.len() && matches!(mode, SetMode::Create) {
                items.push(value);
                Ok(true)
            } else {
                Err(path_error(segments, "array index out of bounds"))
            }
        }
        _ => Err(path_error(segments, "parent is not a container")),
    }
}

/// Delete the value at `segments`. Array deletes splice-compact the array.
/// Returns whether the tree changed; a missing leaf is not an error.
pub fn delete_path_strict(root: &mut Value, segments: &[String]) -> Result<bool> {
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(path_error(segments, "empty path"));
    };
    let mut node = root;
    for (depth, segment) in parents.iter().enumerate() {
        let walked = &segments[..=depth];
        node = match node {
            Value::Object(map) => match map.get_mut(segment) {
                Some(child) => child,
                None => return Ok(false),
            },
            Value::Array(items) => {
                let index = parse_index(segment).ok_or_else(|| {
                    path_error(walked, "array segment must be a non-negative index")
                })?;
                match items.get_mut(index) {
                    Some(child) => child,
                    None => return Ok(false),
                }
            }
            _ => return Err(path_error(walked, "intermediate value is not a container")),
        };
    }
    match node {
        Value::Object(map) => Ok(map.remove(leaf).is_some()),
        Value::Array(items) => {
            let index = parse_index(leaf)
                .ok_or_else(|| path_error(segments, "array segment must be a non-negative index"))?;
            if index < items.len() {
                items.remove(index);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        _ => Err(path_error(segments, "parent is not a container")),
    }
}
