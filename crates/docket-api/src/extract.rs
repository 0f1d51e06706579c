//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;

use docket_pipeline::Credential;

use crate::ApiError;

/// Header carrying an API key as an alternative to `Authorization: Bearer`.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Caller credential taken from `Authorization: Bearer <key>` or `X-API-Key`.
///
/// Requests with neither header are anonymous; the pipeline's authorizer
/// decides whether anonymous callers are allowed.
#[derive(Debug, Clone)]
pub struct Caller(pub Credential);

impl Caller {
    pub fn credential(&self) -> &Credential {
        &self.0
    }
}

fn credential_from_parts(parts: &Parts) -> Result<Credential, ApiError> {
    if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| ApiError::BadRequest("Authorization header is not valid text".into()))?;
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::BadRequest("Authorization must use the Bearer scheme".into()))?;
        return Ok(Credential::ApiKey(token.to_string()));
    }

    if let Some(value) = parts.headers.get(API_KEY_HEADER) {
        let key = value
            .to_str()
            .map_err(|_| ApiError::BadRequest("X-API-Key header is not valid text".into()))?
            .trim();
        if !key.is_empty() {
            return Ok(Credential::ApiKey(key.to_string()));
        }
    }

    Ok(Credential::Anonymous)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        credential_from_parts(parts).map(Caller)
    }
}
