//! Shared-secret authentication for the ingest endpoint.

use axum::http::HeaderMap;

use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Check the `X-API-Key` header: missing is `401`, mismatch is `403`.
pub fn verify_api_key(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let Some(value) = headers.get(API_KEY_HEADER) else {
        return Err(ApiError::Unauthorized);
    };
    let provided = value.to_str().map_err(|_| ApiError::Forbidden)?;
    if provided != expected {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_missing_key_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(matches!(
            verify_api_key(&headers, "secret"),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn test_wrong_key_is_forbidden() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("nope"));
        assert!(matches!(
            verify_api_key(&headers, "secret"),
            Err(ApiError::Forbidden)
        ));
    }

    #[test]
    fn test_valid_key_passes() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(verify_api_key(&headers, "secret").is_ok());
    }
}
