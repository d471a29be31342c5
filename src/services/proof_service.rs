//! Proof capture: recognize, extract, upload
//!
//! Recognition problems never abort a capture, they only push the member to
//! manual reference entry. Upload problems always do.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::api::{ObjectStorage, Recognition, TextRecognizer};
use crate::models::{CapturedImage, ExtractedReference, TransactionProof};
use crate::services::reference_service;
use crate::utils::{EngineError, Result};

/// A stored proof plus whether the member still has to type the reference
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub proof: TransactionProof,
    pub manual_entry_required: bool,
}

impl CaptureOutcome {
    pub fn reference(&self) -> Result<&ExtractedReference> {
        self.proof.reference.as_ref().ok_or(EngineError::ExtractionMiss)
    }
}

/// Storage path for a proof image: `user_<member>/<request>_<epoch ms>.<ext>`
pub fn proof_path(
    member_id: i64,
    request_id: i64,
    captured_at: DateTime<Utc>,
    extension: &str,
) -> String {
    format!(
        "user_{}/{}_{}.{}",
        member_id,
        request_id,
        captured_at.timestamp_millis(),
        extension
    )
}

pub struct ProofService {
    recognizer: Arc<dyn TextRecognizer>,
    storage: Arc<dyn ObjectStorage>,
}

impl ProofService {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { recognizer, storage }
    }

    pub async fn capture(
        &self,
        image: &CapturedImage,
        member_id: i64,
        request_id: i64,
    ) -> Result<CaptureOutcome> {
        self.capture_at(image, member_id, request_id, Utc::now()).await
    }

    pub async fn capture_at(
        &self,
        image: &CapturedImage,
        member_id: i64,
        request_id: i64,
        captured_at: DateTime<Utc>,
    ) -> Result<CaptureOutcome> {
        let raw_text = self.recognize(image, request_id).await;

        let reference = raw_text.as_deref().and_then(reference_service::extract);
        match (&raw_text, &reference) {
            (Some(_), Some(found)) => debug!(request_id, kind = %found.kind, "Reference extracted"),
            (Some(_), None) => info!(request_id, "{}", EngineError::ExtractionMiss),
            (None, _) => {}
        }

        let path = proof_path(member_id, request_id, captured_at, image.extension());
        if let Err(e) = self
            .storage
            .upload(&path, &image.bytes, &image.content_type, false)
            .await
        {
            match &e {
                EngineError::UploadConflict { .. } => {
                    error!(request_id, member_id, path = %path, "Proof path collision")
                }
                _ => warn!(request_id, member_id, "Proof upload failed: {}", e),
            }
            return Err(e);
        }

        let manual_entry_required = reference.is_none();
        Ok(CaptureOutcome {
            proof: TransactionProof {
                request_id,
                member_id,
                storage_path: path,
                content_type: image.content_type.clone(),
                raw_text,
                reference,
                captured_at,
            },
            manual_entry_required,
        })
    }

    async fn recognize(&self, image: &CapturedImage, request_id: i64) -> Option<String> {
        match self.recognizer.detect_text(&image.uri).await {
            Ok(Recognition::Blocks(blocks)) => {
                let text = reference_service::join_blocks(&blocks);
                (!text.is_empty()).then_some(text)
            }
            Ok(Recognition::Unavailable) => {
                debug!(request_id, "Text recognition unavailable, manual entry required");
                None
            }
            Err(e) => {
                warn!(request_id, "Text recognition failed, falling back to manual entry: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReferenceKind;
    use crate::test_utils::{jpeg, FakeRecognizer, FakeStorage};
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()
    }

    #[tokio::test]
    async fn test_capture_extracts_and_stores() {
        let storage = Arc::new(FakeStorage::new());
        let recognizer = FakeRecognizer::text("M-PESA\nRef: XZ9981");
        let service = ProofService::new(Arc::new(recognizer), storage.clone());

        let outcome = service.capture_at(&jpeg(), 42, 777, at()).await.expect("capture");

        assert!(!outcome.manual_entry_required);
        let reference = outcome.reference().expect("reference");
        assert_eq!(reference.kind, ReferenceKind::Reference);
        assert_eq!(reference.value, "XZ9981");
        assert_eq!(outcome.proof.storage_path, "user_42/777_1700000000123.jpg");
        assert_eq!(storage.paths(), vec!["user_42/777_1700000000123.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_unavailable_recognizer_requires_manual_entry() {
        let storage = Arc::new(FakeStorage::new());
        let service = ProofService::new(Arc::new(FakeRecognizer::Unavailable), storage.clone());

        let outcome = service.capture_at(&jpeg(), 5, 9, at()).await.expect("capture");

        assert!(outcome.manual_entry_required);
        assert_eq!(outcome.proof.raw_text, None);
        assert!(matches!(outcome.reference(), Err(EngineError::ExtractionMiss)));
        assert_eq!(storage.paths().len(), 1);
    }

    #[tokio::test]
    async fn test_recognizer_error_degrades_to_manual_entry() {
        let service =
            ProofService::new(Arc::new(FakeRecognizer::Broken), Arc::new(FakeStorage::new()));

        let outcome = service.capture_at(&jpeg(), 5, 9, at()).await.expect("capture");

        assert!(outcome.manual_entry_required);
    }

    #[tokio::test]
    async fn test_text_without_reference_keeps_raw_text() {
        let service = ProofService::new(
            Arc::new(FakeRecognizer::text("Thank you for banking with us")),
            Arc::new(FakeStorage::new()),
        );

        let outcome = service.capture_at(&jpeg(), 5, 9, at()).await.expect("capture");

        assert!(outcome.manual_entry_required);
        assert_eq!(outcome.proof.raw_text.as_deref(), Some("Thank you for banking with us"));
    }

    #[tokio::test]
    async fn test_upload_failure_is_surfaced() {
        let service = ProofService::new(
            Arc::new(FakeRecognizer::text("REF: AB123")),
            Arc::new(FakeStorage::failing(1)),
        );

        let err = service.capture_at(&jpeg(), 5, 9, at()).await.unwrap_err();

        assert!(matches!(err, EngineError::UploadFailure(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_path_collision_is_a_conflict_not_an_overwrite() {
        let storage = Arc::new(FakeStorage::new());
        storage.put("user_5/9_1700000000123.jpg", b"earlier");
        let service = ProofService::new(Arc::new(FakeRecognizer::Unavailable), storage.clone());

        let err = service.capture_at(&jpeg(), 5, 9, at()).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::UploadConflict { path } if path == "user_5/9_1700000000123.jpg"
        ));
    }
}
