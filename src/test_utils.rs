//! Fakes for the recognition and storage seams

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::api::{ObjectStorage, Recognition, TextRecognizer};
use crate::models::CapturedImage;
use crate::utils::{EngineError, Result};

/// Recognizer that returns a fixed answer
pub enum FakeRecognizer {
    Text(Vec<String>),
    Unavailable,
    Broken,
}

impl FakeRecognizer {
    pub fn text(text: &str) -> Self {
        FakeRecognizer::Text(text.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl TextRecognizer for FakeRecognizer {
    async fn detect_text(&self, _image_uri: &str) -> Result<Recognition> {
        match self {
            FakeRecognizer::Text(blocks) => Ok(Recognition::Blocks(blocks.clone())),
            FakeRecognizer::Unavailable => Ok(Recognition::Unavailable),
            FakeRecognizer::Broken => {
                Err(EngineError::InvalidData("recognizer crashed".to_string()))
            }
        }
    }
}

/// Bucket kept in memory, refusing overwrites like the real one
#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failures_left: AtomicUsize,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` uploads with `UploadFailure`
    pub fn failing(count: usize) -> Self {
        let storage = Self::default();
        storage.failures_left.store(count, Ordering::SeqCst);
        storage
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        self.objects.lock().unwrap().insert(path.to_string(), bytes.to_vec());
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
        overwrite: bool,
    ) -> Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::UploadFailure("connection reset".to_string()));
        }

        let mut objects = self.objects.lock().unwrap();
        if !overwrite && objects.contains_key(path) {
            return Err(EngineError::UploadConflict { path: path.to_string() });
        }
        objects.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

pub fn jpeg() -> CapturedImage {
    CapturedImage {
        uri: "file:///tmp/receipt.jpg".to_string(),
        bytes: vec![0xFF, 0xD8, 0xFF, 0xE0],
        content_type: "image/jpeg".to_string(),
    }
}
