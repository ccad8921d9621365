//! Api steps: one HTTP request through an [`HttpTransport`].
//!
//! Api calls are never recorded in the transaction. Transport failures and
//! 429/5xx statuses are retryable; any other rejected status is final.

use serde_json::Value;
use tracing::{debug, instrument};

use super::{ExecContext, Handler, StepAttempt, StepFailure, StepOutput};
use crate::core::resolve::{resolve_json, resolve_string};
use crate::error::StepError;
use crate::io::http::{HttpRequest, HttpTransport, TransportError};
use crate::plan::ApiParams;

pub struct ApiHandler {
    transport: Box<dyn HttpTransport>,
}

impl ApiHandler {
    pub fn new(transport: Box<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

impl Handler<ApiParams> for ApiHandler {
    #[instrument(skip_all, fields(step_id = %ctx.step.id))]
    fn run(&self, params: &ApiParams, ctx: &ExecContext<'_>) -> StepAttempt {
        let url = resolve_string(&params.url, ctx.store)?;
        let method = resolve_string(&params.method, ctx.store)?.to_ascii_uppercase();
        let mut headers = params
            .headers
            .iter()
            .map(|(key, value)| Ok((key.clone(), resolve_string(value, ctx.store)?)))
            .collect::<Result<Vec<_>, StepFailure>>()?;
        let body = match &params.body {
            None => None,
            Some(template) => match resolve_json(template, ctx.store)? {
                Value::String(text) => Some(text),
                structured => {
                    if !headers
                        .iter()
                        .any(|(key, _)| key.eq_ignore_ascii_case("content-type"))
                    {
                        headers.push(("Content-Type".to_string(), "application/json".to_string()));
                    }
                    Some(structured.to_string())
                }
            },
        };

        if ctx.dry_run && !matches!(method.as_str(), "GET" | "HEAD") {
            debug!(%method, %url, "dry run: request not sent");
            return Ok(StepOutput::simulated()
                .field("method", method)
                .field("url", url));
        }

        let request = HttpRequest {
            method: method.clone(),
            url: url.clone(),
            headers,
            body,
            timeout: ctx.timeout,
        };
        let response = self.transport.send(&request).map_err(|err| match err {
            TransportError::Timeout(after) => StepError::Timeout { after },
            TransportError::Network(message) => StepError::execution(message),
        })?;

        let json = serde_json::from_str::<Value>(&response.body).unwrap_or(Value::Null);
        let mut out = StepOutput::success()
            .field("status", response.status)
            .field("body", response.body.clone())
            .field("json", json.clone())
            .field("content_type", response.content_type.clone());
        out.result.value = Some(if json.is_null() {
            Value::String(response.body)
        } else {
            json
        });

        if !params.accepts(response.status) {
            let message = format!("{method} {url} returned HTTP {}", response.status);
            let error = if response.status == 429 || response.status >= 500 {
                StepError::execution(message)
            } else {
                StepError::permanent(message)
            };
            return Err(StepFailure::with_output(error, out));
        }
        debug!(status = response.status, "request accepted");
        Ok(out)
    }
}
