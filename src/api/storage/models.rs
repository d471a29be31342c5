use serde::{Deserialize, Serialize};

/// Successful upload response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(rename = "Key", alias = "key")]
    pub key: String,
}

/// Error body returned by the storage API
///
/// Duplicate objects come back either as HTTP 409 or as a 400 whose body
/// carries `"statusCode": "409"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageErrorBody {
    pub status_code: Option<String>,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl StorageErrorBody {
    pub fn is_duplicate(&self) -> bool {
        self.status_code.as_deref() == Some("409")
            || self.error.as_deref() == Some("Duplicate")
    }

    pub fn describe(&self, fallback: &str) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| fallback.to_string())
    }
}
