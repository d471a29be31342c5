use sqlx::mysql::MySqlPool;
use sqlx::Row;

use crate::models::{ExtractedReference, ReferenceKind, TransactionProof};

/// Store proof metadata. Proof rows are never updated.
pub async fn create_proof(pool: &MySqlPool, proof: &TransactionProof) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO transaction_proofs \
         (request_id, user_id, storage_path, content_type, raw_text, \
          reference_kind, reference_value, captured_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    )
    .bind(proof.request_id)
    .bind(proof.member_id)
    .bind(&proof.storage_path)
    .bind(&proof.content_type)
    .bind(proof.raw_text.as_deref())
    .bind(proof.reference.as_ref().map(|r| r.kind.as_str()))
    .bind(proof.reference.as_ref().map(|r| r.value.as_str()))
    .bind(proof.captured_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get the proof attached to a request
pub async fn get_proof(
    pool: &MySqlPool,
    request_id: i64,
) -> Result<Option<TransactionProof>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT request_id, user_id, storage_path, content_type, raw_text, \
         reference_kind, reference_value, captured_at \
         FROM transaction_proofs WHERE request_id = ?"
    )
    .bind(request_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let kind: Option<String> = r.try_get("reference_kind")?;
    let value: Option<String> = r.try_get("reference_value")?;
    let reference = match (kind.as_deref().and_then(ReferenceKind::parse), value) {
        (Some(kind), Some(value)) => Some(ExtractedReference { kind, value }),
        _ => None,
    };

    Ok(Some(TransactionProof {
        request_id: r.try_get("request_id")?,
        member_id: r.try_get("user_id")?,
        storage_path: r.try_get("storage_path")?,
        content_type: r.try_get("content_type")?,
        raw_text: r.try_get("raw_text")?,
        reference,
        captured_at: r.try_get("captured_at")?,
    }))
}
