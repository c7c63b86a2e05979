//! Shared HTTP plumbing for the adapters.

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::error;

use genforge_generation::ProviderId;

use crate::adapter::{PollError, SubmissionError};

pub(crate) fn join(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Send a submission request and decode a 2xx JSON body.
pub(crate) async fn send_submit<T: DeserializeOwned>(
    provider: ProviderId,
    request: RequestBuilder,
) -> Result<T, SubmissionError> {
    let response = request.send().await.map_err(|e| {
        error!(provider = %provider, error = ?e, "submit request failed");
        if e.is_timeout() {
            SubmissionError::Timeout
        } else {
            SubmissionError::Unavailable(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        error!(provider = %provider, status = %status, error = %message, "submit rejected");
        return Err(if status.is_server_error() {
            SubmissionError::Unavailable(format!("{status}: {message}"))
        } else {
            SubmissionError::Rejected {
                status: status.as_u16(),
                message,
            }
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|e| SubmissionError::InvalidResponse(e.to_string()))
}

/// Send a status request; returns the raw response so callers can read
/// provider-specific error statuses.
pub(crate) async fn send_poll(
    provider: ProviderId,
    request: RequestBuilder,
) -> Result<Response, PollError> {
    request.send().await.map_err(|e| {
        error!(provider = %provider, error = ?e, "poll request failed");
        if e.is_timeout() {
            PollError::Timeout
        } else {
            PollError::Transport(e.to_string())
        }
    })
}

pub(crate) async fn decode_poll<T: DeserializeOwned>(response: Response) -> Result<T, PollError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(PollError::Transport(format!("{status}: {message}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| PollError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_slashes() {
        assert_eq!(join("https://api.x/", "/v1/a"), "https://api.x/v1/a");
        assert_eq!(join("https://api.x", "v1/a"), "https://api.x/v1/a");
    }
}
