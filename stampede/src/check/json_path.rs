use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A minimal JSON path: `$`, `.field`, `['field']`, `["field"]`, `[index]`.
///
/// Parsing never fails eagerly. A malformed expression is kept together with
/// its parse error so it can be reported by
/// [`Scenario::validate`](crate::scenario::Scenario::validate) before the run,
/// and selects nothing if it is evaluated anyway.
#[derive(Clone, PartialEq, Eq)]
pub struct JsonPath {
    source: String,
    segments: Result<Vec<Segment>, String>,
}

impl JsonPath {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let segments = parse(&source);
        Self { source, segments }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parse error, if the expression is malformed.
    pub fn error(&self) -> Option<&str> {
        self.segments.as_ref().err().map(String::as_str)
    }

    /// The value addressed by this path, if any.
    pub fn select<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let segments = self.segments.as_ref().ok()?;
        segments.iter().try_fold(root, |value, segment| match segment {
            Segment::Key(key) => value.get(key.as_str()),
            Segment::Index(index) => value.get(*index),
        })
    }
}

impl fmt::Debug for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JsonPath").field(&self.source).finish()
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse(source: &str) -> Result<Vec<Segment>, String> {
    let mut rest = source
        .trim()
        .strip_prefix('$')
        .ok_or_else(|| "path must start with '$'".to_string())?;
    let mut segments = Vec::new();

    while let Some(c) = rest.chars().next() {
        match c {
            '.' => {
                let key_len = rest[1..]
                    .find(['.', '['])
                    .unwrap_or(rest.len() - 1);
                let key = &rest[1..1 + key_len];
                if key.is_empty() {
                    return Err("empty field name".into());
                }
                segments.push(Segment::Key(key.to_owned()));
                rest = &rest[1 + key_len..];
            }
            '[' => {
                let close = rest
                    .find(']')
                    .ok_or_else(|| "unclosed '['".to_string())?;
                let inner = rest[1..close].trim();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                let segment = match quoted {
                    Some(key) => Segment::Key(key.to_owned()),
                    None => Segment::Index(
                        inner
                            .parse()
                            .map_err(|_| format!("invalid index '{inner}'"))?,
                    ),
                };
                segments.push(segment);
                rest = &rest[close + 1..];
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(segments)
}
