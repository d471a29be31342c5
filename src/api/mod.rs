pub mod recognition;
pub mod storage;

pub use recognition::{NoRecognizer, Recognition, TextRecognizer};
pub use storage::{ObjectStorage, StorageClient};
