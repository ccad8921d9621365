//! Blocking HTTP transport for Api steps.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// The request never produced a response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Network(String),
}

/// Sends one request. Any status code is a response, not an error.
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request)
    }
}

/// Real transport backed by a shared `ureq` agent.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(user_agent: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().user_agent(user_agent).build(),
        }
    }
}

impl HttpTransport for UreqTransport {
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut call = self
            .agent
            .request(&request.method, &request.url)
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            call = call.set(key, value);
        }

        let result = match &request.body {
            Some(body) => call.send_string(body),
            None => call.call(),
        };
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                let message = transport.to_string();
                return Err(if message.contains("timed out") {
                    TransportError::Timeout(request.timeout)
                } else {
                    TransportError::Network(message)
                });
            }
        };

        let status = response.status();
        let content_type = Some(response.content_type().to_string()).filter(|ct| !ct.is_empty());
        let body = response
            .into_string()
            .map_err(|err| TransportError::Network(format!("read body: {err}")))?;
        debug!(status, bytes = body.len(), "response received");
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}
