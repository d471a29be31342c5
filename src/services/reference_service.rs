//! Reference extraction from recognized receipt text

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{ExtractedReference, ReferenceKind};

lazy_static! {
    static ref TID_PATTERN: Regex =
        Regex::new(r"\b(?:TRANSACTION ID|TXN ID|T ID)\b[\s:#.\-]*([A-Z0-9]{6,})")
            .expect("valid TID pattern");
    static ref REFERENCE_PATTERN: Regex =
        Regex::new(r"\b(?:REFERENCE|REF NO|REF)\b[\s:#.\-]*([A-Z0-9]{5,})")
            .expect("valid reference pattern");
}

/// Pull the first transaction id or reference out of `raw_text`.
///
/// Text is upper-cased before matching, so values come back upper-cased.
/// A transaction id label wins over a reference label wherever they appear.
/// `None` means nothing extractable, which callers handle as manual entry.
pub fn extract(raw_text: &str) -> Option<ExtractedReference> {
    let normalized = raw_text.to_uppercase();

    [
        (ReferenceKind::Tid, &*TID_PATTERN),
        (ReferenceKind::Reference, &*REFERENCE_PATTERN),
    ]
    .into_iter()
    .find_map(|(kind, pattern)| {
        pattern.captures(&normalized).map(|caps| ExtractedReference {
            kind,
            value: caps[1].to_string(),
        })
    })
}

/// Join recognized text blocks the way they are fed to [`extract`]
pub fn join_blocks(blocks: &[String]) -> String {
    blocks
        .iter()
        .map(|block| block.trim())
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
