//! The boundary between the engine and whatever actually talks HTTP.

use std::{future::Future, time::Duration};

use thiserror::Error;

use crate::protocol::PreparedRequest;

/// A response as seen by checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub status: u16,
    /// Header names are matched case-insensitively by checks.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Time from sending the request to receiving the full body.
    pub latency: Duration,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// First header named `name`, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

/// A request that produced no response at all.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("transport error ({kind:?}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }
}

/// Sends fully rendered requests.
///
/// Implementations are shared by every virtual user, so they should be cheap
/// to call concurrently (a pooled client, not one connection per call).
/// Failures are reported as [`TransportError`]; the engine records them as KO
/// and never treats them as fatal.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: PreparedRequest,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

#[cfg(feature = "reqwest")]
pub use http::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod http {
    use super::*;
    use tokio::time::Instant;

    /// [`Transport`] backed by a shared [`reqwest::Client`].
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl From<reqwest::Error> for TransportError {
        fn from(err: reqwest::Error) -> Self {
            let kind = if err.is_timeout() {
                TransportErrorKind::Timeout
            } else if err.is_connect() {
                TransportErrorKind::Connect
            } else {
                TransportErrorKind::Other
            };
            Self::new(kind, err.to_string())
        }
    }

    impl Transport for ReqwestTransport {
        async fn send(&self, request: PreparedRequest) -> Result<Response, TransportError> {
            let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
                .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let start = Instant::now();
            let res = builder.send().await?;
            let status = res.status().as_u16();
            let headers = res
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
                .collect();
            let body = res.bytes().await?.to_vec();

            Ok(Response {
                status,
                headers,
                body,
                latency: start.elapsed(),
            })
        }
    }
}
