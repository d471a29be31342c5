//! On-device text recognition seam

use async_trait::async_trait;

use crate::utils::Result;

/// Outcome of a recognition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognition {
    Blocks(Vec<String>),
    /// The platform has no recognizer
    Unavailable,
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn detect_text(&self, image_uri: &str) -> Result<Recognition>;
}

/// Recognizer for hosts without text recognition
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecognizer;

#[async_trait]
impl TextRecognizer for NoRecognizer {
    async fn detect_text(&self, _image_uri: &str) -> Result<Recognition> {
        Ok(Recognition::Unavailable)
    }
}
