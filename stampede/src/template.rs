use std::fmt;

use crate::{error::StepError, session::Session};

/// A string with `#{name}` placeholders, parsed once and rendered against many
/// sessions.
///
/// Placeholders are resolved from the session at render time. String values
/// are inserted verbatim, every other value as its JSON text. An opening `#{`
/// without a closing `}` is kept as literal text.
///
/// ```rust
/// use stampede::{Session, Template};
///
/// let template = Template::parse("Bearer #{jwtToken}");
/// let session = Session::new().set("jwtToken", "abc");
/// assert_eq!(template.render(&session).unwrap(), "Bearer abc");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Part {
    Literal(String),
    Variable(String),
}

impl Template {
    pub fn parse(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut parts = Vec::new();
        let mut rest = source.as_str();

        while let Some(open) = rest.find("#{") {
            let after = &rest[open + 2..];
            let Some(close) = after.find('}') else {
                break;
            };
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_owned()));
            }
            parts.push(Part::Variable(after[..close].trim().to_owned()));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_owned()));
        }

        Self { source, parts }
    }

    /// The text the template was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// `true` when rendering never consults the session.
    pub fn is_static(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Names of every variable the template references, in order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Variable(name) => Some(name.as_str()),
            Part::Literal(_) => None,
        })
    }

    pub fn render(&self, session: &Session) -> Result<String, StepError> {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Variable(name) => {
                    let value = session
                        .get(name)
                        .ok_or_else(|| StepError::unresolved(name.as_str()))?;
                    match value {
                        serde_json::Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Template").field(&self.source).finish()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl From<&str> for Template {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for Template {
    fn from(value: String) -> Self {
        Self::parse(value)
    }
}
