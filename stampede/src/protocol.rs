//! Protocol defaults and request templates.
//!
//! An [`HttpProtocol`] holds what every request of a run shares (base URL,
//! default headers). An [`HttpRequest`] is one templated call inside a
//! scenario. Both are immutable once built; rendering them against a
//! [`Session`] yields a [`PreparedRequest`] ready for the [`Transport`].
//!
//! [`Transport`]: crate::transport::Transport

use std::fmt;

use typed_builder::TypedBuilder;

use crate::{check::Check, error::StepError, session::Session, template::Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared defaults applied to every request of a run.
///
/// ```rust
/// use stampede::HttpProtocol;
///
/// let protocol = HttpProtocol::builder()
///     .base_url("https://videogamedb.uk/api")
///     .build()
///     .accept("application/json")
///     .content_type("application/json");
/// assert_eq!(protocol.url_for("/videogame"), "https://videogamedb.uk/api/videogame");
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct HttpProtocol {
    #[builder(setter(into))]
    pub base_url: String,
    /// Default headers; request headers with the same name win.
    #[builder(default)]
    pub headers: Vec<(String, Template)>,
}

impl HttpProtocol {
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Template>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn accept(self, value: &str) -> Self {
        self.header("Accept", value)
    }

    #[must_use]
    pub fn content_type(self, value: &str) -> Self {
        self.header("Content-Type", value)
    }

    #[must_use]
    pub fn user_agent(self, value: &str) -> Self {
        self.header("User-Agent", value)
    }

    /// Joins `path` onto the base URL. Absolute URLs are returned unchanged.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            base.to_owned()
        } else if base.is_empty() {
            format!("/{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Rendered against the session at send time.
    Template(Template),
    /// Sent as-is.
    Raw(Vec<u8>),
}

/// One templated HTTP call of a scenario.
///
/// The name, path, header values and a templated body may all reference
/// session variables.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub name: Template,
    pub method: Method,
    pub path: Template,
    pub headers: Vec<(String, Template)>,
    pub body: Option<Body>,
    pub checks: Vec<Check>,
}

impl HttpRequest {
    pub fn new(name: impl Into<Template>, method: Method, path: impl Into<Template>) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            checks: Vec::new(),
        }
    }

    pub fn get(name: impl Into<Template>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Get, path)
    }

    pub fn post(name: impl Into<Template>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Post, path)
    }

    pub fn put(name: impl Into<Template>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Put, path)
    }

    pub fn delete(name: impl Into<Template>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Delete, path)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Template>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Templated body, rendered against the session at send time.
    #[must_use]
    pub fn body(mut self, body: impl Into<Template>) -> Self {
        self.body = Some(Body::Template(body.into()));
        self
    }

    #[must_use]
    pub fn raw_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(Body::Raw(body.into()));
        self
    }

    /// Marks the body as JSON by setting `Content-Type` unless already set.
    #[must_use]
    pub fn as_json(self) -> Self {
        if self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            return self;
        }
        self.header("Content-Type", "application/json")
    }

    #[must_use]
    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    /// Whether any attached check inspects the status code. Requests without
    /// one get the engine's implicit status check.
    pub fn has_status_check(&self) -> bool {
        self.checks.iter().any(Check::is_status_check)
    }

    /// Name used for stats; falls back to the raw template when the session
    /// lacks a referenced variable.
    pub fn display_name(&self, session: &Session) -> String {
        self.name
            .render(session)
            .unwrap_or_else(|_| self.name.source().to_owned())
    }

    /// Renders protocol defaults and this request against `session`.
    pub fn prepare(
        &self,
        protocol: &HttpProtocol,
        session: &Session,
    ) -> Result<PreparedRequest, StepError> {
        let url = protocol.url_for(&self.path.render(session)?);

        let mut headers: Vec<(String, String)> = Vec::new();
        for (name, value) in protocol.headers.iter().chain(&self.headers) {
            let value = value.render(session)?;
            match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some(slot) => slot.1 = value,
                None => headers.push((name.clone(), value)),
            }
        }

        let body = match &self.body {
            None => None,
            Some(Body::Raw(bytes)) => Some(bytes.clone()),
            Some(Body::Template(t)) => Some(t.render(session)?.into_bytes()),
        };

        Ok(PreparedRequest {
            method: self.method,
            url,
            headers,
            body,
        })
    }
}

/// A request with every template resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl PreparedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
