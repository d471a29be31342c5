pub mod errors;
pub mod backoff;
pub mod table;

pub use errors::{extract_clean_error, EngineError, Result};
pub use backoff::ReconnectBackoff;
pub use table::{format_amount, TextTable};
