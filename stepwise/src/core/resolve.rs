//! `${...}` template resolution against a [`VariableStore`].
//!
//! A template that is exactly one reference yields the referenced value with its
//! type intact; anything else interpolates (strings raw, other values as compact
//! JSON). `$${...}` produces a literal `${...}`. Paths navigate with `.key`,
//! `[index]` and `["quoted key"]`.

use serde_json::{Map, Value};

use crate::core::variables::VariableStore;
use crate::error::ResolveError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'a> {
    Literal(&'a str),
    /// `$${...}` escape, emitted as `${...}`.
    Escaped(&'a str),
    Reference(&'a str),
}

/// Parse a reference path such as `result.fetch.json.items[0]["display name"]`.
pub fn parse_path(raw: &str) -> Result<Vec<Segment>, ResolveError> {
    let syntax = |reason: &str| ResolveError::Syntax {
        reference: raw.to_string(),
        reason: reason.to_string(),
    };
    let path = raw.trim();
    if path.is_empty() {
        return Err(syntax("empty reference"));
    }

    let chars: Vec<char> = path.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;
    let mut expect_key = true;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                if expect_key {
                    return Err(syntax("empty path segment"));
                }
                expect_key = true;
                i += 1;
            }
            '[' => {
                if segments.is_empty() {
                    return Err(syntax("path must start with a name"));
                }
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|offset| i + offset)
                    .ok_or_else(|| syntax("unclosed '['"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                let quoted = inner.len() >= 2
                    && ((inner.starts_with('"') && inner.ends_with('"'))
                        || (inner.starts_with('\'') && inner.ends_with('\'')));
                if quoted {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| syntax("bracket segment must be an index or quoted key"))?;
                    segments.push(Segment::Index(index));
                }
                expect_key = false;
                i = close + 1;
            }
            _ => {
                if !expect_key {
                    return Err(syntax("expected '.' or '[' between segments"));
                }
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                let key: String = chars[start..i].iter().collect();
                let key = key.trim();
                if key.is_empty() {
                    return Err(syntax("empty path segment"));
                }
                segments.push(Segment::Key(key.to_string()));
                expect_key = false;
            }
        }
    }
    if expect_key {
        return Err(syntax("path ends with '.'"));
    }
    Ok(segments)
}

/// Navigate `vars` along `segments`.
pub fn lookup(
    vars: &Map<String, Value>,
    raw: &str,
    segments: &[Segment],
) -> Result<Value, ResolveError> {
    let unresolved = |reason: String| ResolveError::Unresolved {
        path: raw.trim().to_string(),
        reason,
    };
    let Some((Segment::Key(first), rest)) = segments.split_first() else {
        return Err(unresolved("path must start with a name".to_string()));
    };
    let mut current = vars
        .get(first)
        .ok_or_else(|| unresolved(format!("no variable named '{first}'")))?;
    let mut walked = first.clone();
    for segment in rest {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map
                .get(key)
                .ok_or_else(|| unresolved(format!("'{walked}' has no key '{key}'")))?,
            (Segment::Index(index), Value::Array(items)) => items.get(*index).ok_or_else(|| {
                unresolved(format!(
                    "index {index} out of bounds for '{walked}' (length {})",
                    items.len()
                ))
            })?,
            (Segment::Key(key), other) => {
                return Err(unresolved(format!(
                    "cannot read key '{key}' of {} '{walked}'",
                    type_name(other)
                )));
            }
            (Segment::Index(index), other) => {
                return Err(unresolved(format!(
                    "cannot index [{index}] into {} '{walked}'",
                    type_name(other)
                )));
            }
        };
        match segment {
            Segment::Key(key) => {
                walked.push('.');
                walked.push_str(key);
            }
            Segment::Index(index) => walked.push_str(&format!("[{index}]")),
        }
    }
    Ok(current.clone())
}

/// Resolve one reference path against the store.
pub fn resolve_reference(raw: &str, store: &VariableStore) -> Result<Value, ResolveError> {
    let segments = parse_path(raw)?;
    store.read(|vars| lookup(vars, raw, &segments))
}

fn scan(template: &str) -> Result<Vec<Piece<'_>>, ResolveError> {
    let mut pieces = Vec::new();
    let mut rest = template;
    while let Some(pos) = rest.find("${") {
        let escaped = pos > 0 && rest.as_bytes()[pos - 1] == b'$';
        let literal_end = if escaped { pos - 1 } else { pos };
        if literal_end > 0 {
            pieces.push(Piece::Literal(&rest[..literal_end]));
        }
        let body_start = pos + 2;
        let Some(close) = rest[body_start..].find('}') else {
            if escaped {
                pieces.push(Piece::Literal(&rest[pos..]));
                return Ok(pieces);
            }
            return Err(ResolveError::Syntax {
                reference: rest[pos..].to_string(),
                reason: "unterminated '${'".to_string(),
            });
        };
        let body = &rest[body_start..body_start + close];
        if escaped {
            pieces.push(Piece::Escaped(body));
        } else {
            pieces.push(Piece::Reference(body));
        }
        rest = &rest[body_start + close + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Literal(rest));
    }
    Ok(pieces)
}

/// Reference paths in `template`, syntax-checked.
pub fn references(template: &str) -> Result<Vec<String>, ResolveError> {
    let mut out = Vec::new();
    for piece in scan(template)? {
        if let Piece::Reference(raw) = piece {
            parse_path(raw)?;
            out.push(raw.trim().to_string());
        }
    }
    Ok(out)
}

/// Resolve a template, keeping the type of a lone reference.
pub fn resolve_template(template: &str, store: &VariableStore) -> Result<Value, ResolveError> {
    let pieces = scan(template)?;
    match pieces.as_slice() {
        [] => Ok(Value::String(String::new())),
        [Piece::Reference(raw)] => resolve_reference(raw, store),
        _ if !pieces
            .iter()
            .any(|p| matches!(p, Piece::Reference(_) | Piece::Escaped(_))) =>
        {
            Ok(Value::String(template.to_string()))
        }
        _ => interpolate(&pieces, store).map(Value::String),
    }
}

/// Resolve a template to a string, rendering non-string values as JSON.
pub fn resolve_string(template: &str, store: &VariableStore) -> Result<String, ResolveError> {
    let pieces = scan(template)?;
    interpolate(&pieces, store)
}

/// Resolve every string inside a JSON value; other values pass through.
pub fn resolve_json(value: &Value, store: &VariableStore) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_template(s, store),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_json(item, store))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| Ok((key.clone(), resolve_json(item, store)?)))
            .collect::<Result<Map<_, _>, ResolveError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn interpolate(pieces: &[Piece<'_>], store: &VariableStore) -> Result<String, ResolveError> {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Escaped(body) => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            }
            Piece::Reference(raw) => out.push_str(&render(&resolve_reference(raw, store)?)),
        }
    }
    Ok(out)
}

/// Render a value for interpolation into a string.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(value: Value) -> VariableStore {
        let Value::Object(map) = value else {
            panic!("expected object");
        };
        VariableStore::new(map)
    }

    #[test]
    fn template_without_tokens_is_unchanged() {
        let store = store(json!({}));
        for template in ["", "plain text", "cost: $5 {braces}", "$ {x}"] {
            assert_eq!(
                resolve_template(template, &store).expect("resolve"),
                json!(template)
            );
        }
    }

    #[test]
    fn lone_reference_keeps_type() {
        let store = store(json!({"count": 3, "items": [1, 2]}));
        assert_eq!(resolve_template("${count}", &store).unwrap(), json!(3));
        assert_eq!(resolve_template("${items}", &store).unwrap(), json!([1, 2]));
        assert_eq!(
            resolve_template("n=${count} ${items}", &store).unwrap(),
            json!("n=3 [1,2]")
        );
    }

    #[test]
    fn navigates_nested_results() {
        let store = store(json!({
            "result": {"fetch": {"json": {"items": [{"name": "a"}, {"name": "b"}],
                                          "odd key": true}}}
        }));
        assert_eq!(
            resolve_template("${result.fetch.json.items[1].name}", &store).unwrap(),
            json!("b")
        );
        assert_eq!(
            resolve_template("${result.fetch.json[\"odd key\"]}", &store).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let store = store(json!({"items": [1]}));
        let err = resolve_string("value ${missing}", &store).unwrap_err();
        assert!(matches!(err, ResolveError::Unresolved { .. }));
        let err = resolve_template("${items[4]}", &store).unwrap_err();
        assert!(err.to_string().contains("out of bounds"), "{err}");
    }

    #[test]
    fn escape_produces_literal_token() {
        let store = store(json!({"x": 1}));
        assert_eq!(
            resolve_template("echo $${HOME} ${x}", &store).unwrap(),
            json!("echo ${HOME} 1")
        );
        assert!(references("$${HOME}").unwrap().is_empty());
    }

    #[test]
    fn syntax_errors_are_detected_without_a_store() {
        assert!(references("${unterminated").is_err());
        assert!(references("${a..b}").is_err());
        assert!(references("${a[x]}").is_err());
        assert_eq!(
            references("${a.b[0]} and ${c}").unwrap(),
            vec!["a.b[0]".to_string(), "c".to_string()]
        );
    }
}
