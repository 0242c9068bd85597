//! Path-expression edits over JSON documents.
//!
//! The expression language is the usual dotted/bracketed form rooted at `$`:
//! `$.messages[0].content`, `$.choices[*].delta`, `$['odd key']`,
//! `$.tools[?(@.type == "function")]`, `$.messages[?(@.name)]`.

use crate::config::{JsonOp, JsonOpKind};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
    Filter(Filter),
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    key: String,
    /// `None` is a bare existence test `[?(@.key)]`.
    expected: Option<Value>,
}

impl Filter {
    fn matches(&self, value: &Value) -> bool {
        match (value.get(&self.key), &self.expected) {
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
            (None, _) => false,
        }
    }
}

/// Applies each operation in declared order. Individual failures are logged
/// and skipped; the document proceeds to the next op.
pub fn apply_ops(doc: &mut Value, ops: &[JsonOp]) {
    for op in ops {
        let segments = match parse(&op.path) {
            Ok(segments) => segments,
            Err(err) => {
                tracing::warn!("skipping json op with invalid path {:?}: {}", op.path, err);
                continue;
            }
        };
        match op.op {
            JsonOpKind::Remove => remove(doc, &segments),
            JsonOpKind::Add => {
                let value = op.value.clone().unwrap_or(Value::Null);
                if let Err(err) = add(doc, &segments, value) {
                    tracing::warn!("skipping ADD {:?}: {}", op.path, err);
                }
            }
        }
    }
}

/// Deletes every node the path matches; missing paths are silent no-ops.
fn remove(doc: &mut Value, segments: &[Segment]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    for_each_match(doc, parents, &mut |parent| match (parent, last) {
        (Value::Object(map), Segment::Key(key)) => {
            map.remove(key);
        }
        (Value::Object(map), Segment::Wildcard) => map.clear(),
        (Value::Array(items), Segment::Index(index)) => {
            if *index < items.len() {
                items.remove(*index);
            }
        }
        (Value::Array(items), Segment::Wildcard) => items.clear(),
        (Value::Array(items), Segment::Filter(filter)) => {
            items.retain(|item| !filter.matches(item));
        }
        _ => {}
    });
}

/// Sets the referenced node, creating a missing terminal key in its parent
/// object. Fails when no parent matches.
fn add(doc: &mut Value, segments: &[Segment], value: Value) -> Result<(), String> {
    let Some((last, parents)) = segments.split_last() else {
        *doc = value;
        return Ok(());
    };
    let mut matched = false;
    for_each_match(doc, parents, &mut |parent| {
        match (parent, last) {
            (Value::Object(map), Segment::Key(key)) => {
                map.insert(key.clone(), value.clone());
                matched = true;
            }
            (Value::Object(map), Segment::Wildcard) => {
                for slot in map.values_mut() {
                    *slot = value.clone();
                }
                matched = true;
            }
            (Value::Array(items), Segment::Index(index)) => {
                if *index < items.len() {
                    items[*index] = value.clone();
                    matched = true;
                } else if *index == items.len() {
                    items.push(value.clone());
                    matched = true;
                }
            }
            (Value::Array(items), Segment::Wildcard) => {
                for slot in items.iter_mut() {
                    *slot = value.clone();
                }
                matched = true;
            }
            (Value::Array(items), Segment::Filter(filter)) => {
                for slot in items.iter_mut() {
                    if filter.matches(slot) {
                        *slot = value.clone();
                        matched = true;
                    }
                }
            }
            _ => {}
        }
    });
    if matched {
        Ok(())
    } else {
        Err("no parent matched the path".to_string())
    }
}

fn for_each_match(node: &mut Value, segments: &[Segment], apply: &mut impl FnMut(&mut Value)) {
    let Some((segment, rest)) = segments.split_first() else {
        apply(node);
        return;
    };
    match (node, segment) {
        (Value::Object(map), Segment::Key(key)) => {
            if let Some(child) = map.get_mut(key) {
                for_each_match(child, rest, apply);
            }
        }
        (Value::Object(map), Segment::Wildcard) => {
            for child in map.values_mut() {
                for_each_match(child, rest, apply);
            }
        }
        (Value::Array(items), Segment::Index(index)) => {
            if let Some(child) = items.get_mut(*index) {
                for_each_match(child, rest, apply);
            }
        }
        (Value::Array(items), Segment::Wildcard) => {
            for child in items.iter_mut() {
                for_each_match(child, rest, apply);
            }
        }
        (Value::Array(items), Segment::Filter(filter)) => {
            for child in items.iter_mut() {
                if filter.matches(child) {
                    for_each_match(child, rest, apply);
                }
            }
        }
        _ => {}
    }
}

fn parse(path: &str) -> Result<Vec<Segment>, String> {
    let mut chars = path.chars().peekable();
    let mut segments = Vec::new();

    if chars.peek() == Some(&'$') {
        chars.next();
    }

    while let Some(&c) = chars.peek() {
        match c {
            '.' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    segments.push(Segment::Wildcard);
                    continue;
                }
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '.' || c == '[' {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                if name.is_empty() {
                    return Err("empty segment after '.'".to_string());
                }
                segments.push(Segment::Key(name));
            }
            '[' => {
                chars.next();
                let mut inner = String::new();
                let mut depth = 1usize;
                for c in chars.by_ref() {
                    match c {
                        '[' => depth += 1,
                        ']' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    inner.push(c);
                }
                if depth != 0 {
                    return Err("unterminated '['".to_string());
                }
                segments.push(parse_bracket(inner.trim())?);
            }
            _ => return Err(format!("unexpected character {:?}", c)),
        }
    }
    Ok(segments)
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(quoted) = strip_quotes(inner) {
        return Ok(Segment::Key(quoted.to_string()));
    }
    if let Some(expr) = inner.strip_prefix("?(").and_then(|e| e.strip_suffix(')')) {
        return parse_filter(expr.trim());
    }
    inner
        .parse::<usize>()
        .map(Segment::Index)
        .map_err(|_| format!("invalid bracket segment {:?}", inner))
}

fn parse_filter(expr: &str) -> Result<Segment, String> {
    let key_expr = expr
        .strip_prefix("@.")
        .ok_or_else(|| format!("filter must reference '@.': {:?}", expr))?;
    match key_expr.split_once("==") {
        Some((key, literal)) => {
            let expected = parse_literal(literal.trim())?;
            Ok(Segment::Filter(Filter {
                key: key.trim().to_string(),
                expected: Some(expected),
            }))
        }
        None => Ok(Segment::Filter(Filter {
            key: key_expr.trim().to_string(),
            expected: None,
        })),
    }
}

fn parse_literal(literal: &str) -> Result<Value, String> {
    if let Some(quoted) = strip_quotes(literal) {
        return Ok(Value::String(quoted.to_string()));
    }
    serde_json::from_str(literal).map_err(|_| format!("invalid filter literal {:?}", literal))
}

fn strip_quotes(text: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}
