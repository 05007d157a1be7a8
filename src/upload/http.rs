use anyhow::{bail, Context, Result};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;

/// Send a request, retrying rate limiting and unavailability.
///
/// `build` is called once per attempt since request bodies are consumed.
/// Any other non-success status is returned as an error carrying the body.
pub async fn send_with_retry<F>(what: &str, mut build: F) -> Result<Response>
where
    F: FnMut() -> Result<RequestBuilder>,
{
    for attempt in 1..=MAX_ATTEMPTS {
        let response = build()?
            .send()
            .await
            .with_context(|| format!("{} request failed", what))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if is_retryable(status) && attempt < MAX_ATTEMPTS {
            let delay = retry_after(response.headers()).unwrap_or(Duration::from_secs(1));
            warn!(
                "{} returned {}, retrying in {}s (attempt {}/{})",
                what,
                status,
                delay.as_secs(),
                attempt,
                MAX_ATTEMPTS
            );
            let _ = response.bytes().await;
            tokio::time::sleep(delay).await;
            continue;
        }

        let body = response.text().await.unwrap_or_default();
        bail!("{} returned {}: {}", what, status, body.trim());
    }
    bail!("{} failed after {} attempts", what, MAX_ATTEMPTS);
}

pub(super) fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    )
}

pub(super) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
