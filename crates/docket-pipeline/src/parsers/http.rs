//! Parser backed by a remote conversion service.
//!
//! `POST {base_url}/convert` with `{"locator": ...}`; the service answers
//! with a `ParsedRepresentation` document.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use docket_core::defaults::{HEALTH_CHECK_TIMEOUT_SECS, PARSE_TIMEOUT_SECS};
use docket_core::{Error, ParsedRepresentation, Parser, Result};
use docket_core::logging::SUBSYSTEM_PIPELINE;

use crate::http_client::{build_client, endpoint, status_error};

/// Tool name used when the service does not name itself.
pub const HTTP_PARSER_NAME: &str = "conversion-service";

#[derive(Serialize)]
struct ConvertRequest<'a> {
    locator: &'a str,
}

/// HTTP conversion-service parser.
#[derive(Debug, Clone)]
pub struct HttpConversionParser {
    client: Client,
    base_url: String,
}

impl HttpConversionParser {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        info!(subsystem = SUBSYSTEM_PIPELINE, component = "http_parser", %base_url, "Initializing conversion service parser");
        Ok(Self {
            client: build_client(timeout)?,
            base_url,
        })
    }

    /// Build from `CONVERSION_SERVICE_URL`; `None` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var("CONVERSION_SERVICE_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let timeout = std::env::var("PARSE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(PARSE_TIMEOUT_SECS);
                Self::new(url, Duration::from_secs(timeout)).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Parser for HttpConversionParser {
    fn name(&self) -> &str {
        HTTP_PARSER_NAME
    }

    async fn parse(&self, locator: &str) -> Result<ParsedRepresentation> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "convert"))
            .json(&ConvertRequest { locator })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("conversion service", response, Error::Parse).await);
        }

        let mut parsed: ParsedRepresentation = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("invalid conversion response: {}", e)))?;
        if parsed.parsing_tool.trim().is_empty() {
            parsed.parsing_tool = HTTP_PARSER_NAME.to_string();
        }

        debug!(
            subsystem = SUBSYSTEM_PIPELINE,
            component = "http_parser",
            locator,
            parsing_tool = %parsed.parsing_tool,
            "Conversion complete"
        );
        Ok(parsed)
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(endpoint(&self.base_url, "health"))
            .timeout(Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!("Conversion service health check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Conversion service health check error: {}", e);
                Ok(false)
            }
        }
    }
}
