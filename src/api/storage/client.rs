use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use tracing::{debug, warn};

use super::models::{StorageErrorBody, UploadResponse};
use super::ObjectStorage;
use crate::config::StorageConfig;
use crate::utils::{EngineError, Result};

/// HTTP client for the object storage bucket holding transaction proofs
pub struct StorageClient {
    http_client: HttpClient,
    api_key: String,
    base_url: String,
    bucket: String,
}

impl StorageClient {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            http_client: HttpClient::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
        }
    }

    /// POST target for one object
    pub fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            path.trim_start_matches('/')
        )
    }

    /// Create headers with authorization and the upsert flag
    fn create_headers(
        &self,
        content_type: &str,
        overwrite: bool,
    ) -> std::result::Result<HeaderMap, String> {
        let mut headers = HeaderMap::new();

        let content_type = HeaderValue::from_str(content_type)
            .map_err(|e| format!("Invalid content type: {}", e))?;
        headers.insert(CONTENT_TYPE, content_type);

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| format!("Failed to create auth header: {}", e))?;
        headers.insert(AUTHORIZATION, auth_value);

        let api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| format!("Failed to create apikey header: {}", e))?;
        headers.insert(HeaderName::from_static("apikey"), api_key);

        headers.insert(
            HeaderName::from_static("x-upsert"),
            HeaderValue::from_static(if overwrite { "true" } else { "false" }),
        );

        Ok(headers)
    }

    /// Map a non-success upload response onto the engine taxonomy
    pub fn classify_failure(status: u16, body_text: &str, path: &str) -> EngineError {
        let body: StorageErrorBody = serde_json::from_str(body_text).unwrap_or_default();

        match status {
            409 => EngineError::UploadConflict { path: path.to_string() },
            400 if body.is_duplicate() => EngineError::UploadConflict { path: path.to_string() },
            401 | 403 => EngineError::Storage(format!(
                "Storage rejected credentials: {}",
                body.describe(body_text)
            )),
            500..=599 => {
                warn!("Storage server error {}: {}", status, body_text);
                EngineError::UploadFailure(format!("HTTP {}: {}", status, body.describe(body_text)))
            }
            _ => {
                EngineError::UploadFailure(format!("HTTP {}: {}", status, body.describe(body_text)))
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for StorageClient {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        overwrite: bool,
    ) -> Result<()> {
        let url = self.object_url(path);
        let headers = self
            .create_headers(content_type, overwrite)
            .map_err(EngineError::UploadFailure)?;

        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| EngineError::UploadFailure(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::classify_failure(status.as_u16(), &body_text, path));
        }

        match response.json::<UploadResponse>().await {
            Ok(uploaded) => debug!(key = %uploaded.key, "Proof uploaded"),
            Err(e) => debug!("Upload succeeded with unreadable body: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> StorageClient {
        StorageClient::new(&StorageConfig {
            base_url: "https://sacco.example.co/".to_string(),
            api_key: "service-key".to_string(),
            bucket: "transaction-proofs".to_string(),
        })
    }

    #[test]
    fn test_object_url_joins_bucket_and_path() {
        assert_eq!(
            client().object_url("user_42/777_1700000000000.jpg"),
            "https://sacco.example.co/storage/v1/object/transaction-proofs/user_42/777_1700000000000.jpg"
        );
    }

    #[test]
    fn test_headers_never_upsert_by_default() {
        let headers = client().create_headers("image/jpeg", false).expect("headers");
        assert_eq!(headers.get("x-upsert").and_then(|v| v.to_str().ok()), Some("false"));
        assert_eq!(headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()), Some("image/jpeg"));
    }

    #[test]
    fn test_conflict_statuses() {
        assert!(matches!(
            StorageClient::classify_failure(409, "", "a.jpg"),
            EngineError::UploadConflict { .. }
        ));
        let body = r#"{"statusCode":"409","error":"Duplicate","message":"The resource already exists"}"#;
        assert!(matches!(
            StorageClient::classify_failure(400, body, "a.jpg"),
            EngineError::UploadConflict { path } if path == "a.jpg"
        ));
    }

    #[test]
    fn test_server_errors_are_retryable() {
        let err = StorageClient::classify_failure(503, "unavailable", "a.jpg");
        assert!(matches!(err, EngineError::UploadFailure(_)));
        assert!(err.is_retryable());
    }
}
