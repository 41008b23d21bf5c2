//! HTTP plumbing shared by the adapters: auth headers, status checks and the
//! cancellation/deadline guard every network await goes through.

use crate::types::CallOptions;
use crate::{Error, Result};
use reqwest::{RequestBuilder, Response};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Races futures against the caller's cancellation token and the call deadline.
///
/// One guard covers one logical call: the request, the response headers and
/// every body read share the same deadline.
#[derive(Debug, Clone)]
pub struct CallGuard {
    cancel: CancellationToken,
    deadline: Instant,
}

impl CallGuard {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
        }
    }

    /// Guard for a call, using the per-call timeout when one is set.
    pub fn for_call(options: &CallOptions, default_timeout: Duration) -> Self {
        Self::new(options.cancel.clone(), options.timeout.unwrap_or(default_timeout))
    }

    /// Run `fut` unless cancellation or the deadline comes first.
    ///
    /// Cancellation wins ties so a cancelled call never reports a timeout.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Error::Timeout),
            out = fut => Ok(out),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Credential attached to outgoing requests.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `Authorization: Api-Key <key>`
    ApiKey(String),
}

impl Auth {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::ApiKey(key) => request.header("Authorization", format!("Api-Key {key}")),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Bearer(_) => f.write_str("Bearer(***)"),
            Auth::ApiKey(_) => f.write_str("ApiKey(***)"),
        }
    }
}

/// Send a request under the guard and reject non-2xx responses.
pub(crate) async fn send(guard: &CallGuard, request: RequestBuilder) -> Result<Response> {
    let response = guard.run(request.send()).await??;
    ensure_success(guard, response).await
}

/// Turn a non-2xx response into `Error::Api` carrying status and body.
pub(crate) async fn ensure_success(guard: &CallGuard, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = match guard.run(response.text()).await? {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "Failed to read error response body");
            String::new()
        }
    };
    Err(Error::api(status.as_u16(), body.trim()))
}

/// Backend request id from the usual tracing headers.
pub(crate) fn request_id(response: &Response) -> Option<String> {
    ["x-request-id", "x-req-id", "x-client-request-id"]
        .iter()
        .find_map(|name| response.headers().get(*name))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
