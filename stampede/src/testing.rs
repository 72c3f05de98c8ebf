//! In-memory transport for unit tests.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{
    protocol::PreparedRequest,
    transport::{Response, Transport, TransportError},
};

type Handler = dyn Fn(&PreparedRequest) -> Result<Response, TransportError> + Send + Sync;

/// Answers every request with `handler` and remembers what was sent.
pub(crate) struct MockTransport {
    handler: Box<Handler>,
    delay: Duration,
    calls: Arc<Mutex<Vec<PreparedRequest>>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&PreparedRequest) -> Result<Response, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    /// Every response takes `delay` to arrive.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<PreparedRequest>>> {
        Arc::clone(&self.calls)
    }
}

impl Transport for MockTransport {
    async fn send(&self, request: PreparedRequest) -> Result<Response, TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = (self.handler)(&request);
        self.calls.lock().push(request);
        response
    }
}
