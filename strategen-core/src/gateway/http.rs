//! HTTP plumbing shared by the remote providers.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use super::GatewayError;

pub(crate) fn build_client(timeout: Duration) -> Result<Client, GatewayError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("strategen/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GatewayError::ProviderUnavailable(format!("failed to build HTTP client: {e}")))
}

/// Send a prepared request and decode the JSON body, mapping transport and
/// status failures onto gateway error kinds.
pub(crate) fn send_json(request: RequestBuilder, provider: &str) -> Result<serde_json::Value, GatewayError> {
    let resp = request.send().map_err(|e| map_send_error(e, provider))?;
    let status = resp.status();

    if !status.is_success() {
        let retry_after = retry_after(resp.headers());
        let body = resp.text().unwrap_or_default();
        return Err(map_status(status, retry_after, &body, provider));
    }

    resp.json::<serde_json::Value>().map_err(|e| {
        if e.is_timeout() {
            GatewayError::Timeout(format!("{provider}: {e}"))
        } else {
            GatewayError::ProviderUnavailable(format!("{provider}: unreadable response body: {e}"))
        }
    })
}

pub(crate) fn map_send_error(err: reqwest::Error, provider: &str) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(format!("{provider}: {err}"))
    } else {
        GatewayError::ProviderUnavailable(format!("{provider}: {err}"))
    }
}

pub(crate) fn map_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
    provider: &str,
) -> GatewayError {
    let message = format!("{provider}: HTTP {status}: {}", snippet(body));
    match status.as_u16() {
        401 | 402 | 403 => GatewayError::QuotaOrAuth(message),
        // OpenAI-compatible APIs report exhausted credit as 429.
        429 if body.contains("insufficient_quota") => GatewayError::QuotaOrAuth(message),
        429 | 529 => GatewayError::RateLimited {
            message,
            retry_after,
        },
        408 | 504 => GatewayError::Timeout(message),
        400 if looks_filtered(body) => GatewayError::ContentFiltered(message),
        _ => GatewayError::ProviderUnavailable(message),
    }
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn looks_filtered(body: &str) -> bool {
    body.contains("content_filter") || body.contains("content_policy")
}

fn snippet(body: &str) -> &str {
    const MAX: usize = 300;
    let body = body.trim();
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
