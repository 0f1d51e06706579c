//! Shared HTTP plumbing for the remote capability adapters.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use docket_core::{Error, Result};

/// Build a client with a per-request timeout.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Map a non-success response to an error.
///
/// Server errors, 408 and 429 are transient (`Unavailable`); other client
/// errors are permanent and built with `permanent`.
pub(crate) async fn status_error(
    service: &str,
    response: Response,
    permanent: fn(String) -> Error,
) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", service, status, body.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::Unavailable(message)
    } else {
        permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_cleanly() {
        assert_eq!(endpoint("http://h:1/", "/convert"), "http://h:1/convert");
        assert_eq!(endpoint("http://h:1", "convert"), "http://h:1/convert");
    }
}
