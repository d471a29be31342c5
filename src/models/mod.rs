//! Data models for the reconciliation engine
//!
//! Records mirror the rows of the backing store tables. Amounts are integer
//! minor currency units throughout.

pub mod request;
pub mod proof;
pub mod ledger;
pub mod notification;
pub mod feed;

// Re-export commonly used types for convenience
pub use request::{NewRequest, RequestStatus, TransactionKind, TransactionRequest};
pub use proof::{CapturedImage, ExtractedReference, ReferenceKind, TransactionProof};
pub use ledger::{Direction, MemberTransaction, NewLedgerEntry};
pub use notification::Notification;
pub use feed::{ChangeEvent, ChangeKind, ChangeNotice, Table};
