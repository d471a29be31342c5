pub mod client;
pub mod models;

pub use client::StorageClient;
pub use models::StorageErrorBody;

use async_trait::async_trait;

use crate::utils::Result;

/// Durable object storage for proof images
///
/// With `overwrite` false an existing object at `path` must make the upload
/// fail with `UploadConflict` instead of replacing it.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        overwrite: bool,
    ) -> Result<()>;
}
