//! Proof-of-payment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which label pattern produced an extracted reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    #[serde(rename = "TID")]
    Tid,
    #[serde(rename = "REFERENCE")]
    Reference,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Tid => "TID",
            ReferenceKind::Reference => "REFERENCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TID" => Some(ReferenceKind::Tid),
            "REFERENCE" => Some(ReferenceKind::Reference),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized external reference pulled out of receipt text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedReference {
    pub kind: ReferenceKind,
    pub value: String,
}

/// A captured receipt image as handed over by the camera or picker
#[derive(Debug, Clone)]
pub struct CapturedImage {
    /// Platform URI the recognizer reads from
    pub uri: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl CapturedImage {
    /// File extension used in the storage path
    pub fn extension(&self) -> &str {
        match self.content_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            "image/heic" => "heic",
            "application/pdf" => "pdf",
            _ => "jpg",
        }
    }
}

/// Row of `transaction_proofs`. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionProof {
    pub request_id: i64,
    #[serde(rename = "user_id")]
    pub member_id: i64,
    pub storage_path: String,
    pub content_type: String,
    pub raw_text: Option<String>,
    pub reference: Option<ExtractedReference>,
    pub captured_at: DateTime<Utc>,
}
