use super::{describe, ConsoleContext};
use crate::cache::QueryKey;
use crate::models::{RequestStatus, Table};
use crate::utils::{format_amount, TextTable};

const DEFAULT_LIMIT: u32 = 20;

/// Most requests the console keeps in its queue view
const QUEUE_LIMIT: u32 = 200;

pub fn queue_key() -> QueryKey {
    QueryKey::new(Table::TransactionRequests.as_str())
        .with("status", RequestStatus::Pending.as_str())
        .with("limit", QUEUE_LIMIT)
}

pub async fn execute(ctx: &ConsoleContext, args: &[&str]) -> Result<String, String> {
    let limit = match args.first() {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| format!("Invalid limit '{}'. Usage: `$pending [limit]`", raw))?,
        None => DEFAULT_LIMIT,
    };

    let requests = ctx.requests.clone();
    let queue = ctx
        .queue
        .fetch(&queue_key(), || async move {
            requests.list_pending(Some(QUEUE_LIMIT)).await
        })
        .await
        .map_err(|e| describe(&e))?;
    if queue.is_empty() {
        return Ok("✅ No pending requests".to_string());
    }

    let shown = &queue[..queue.len().min(limit as usize)];
    let mut table = TextTable::new(&["ID", "Member", "Kind", "Amount", "Reference", "Submitted"])
        .align_right(3);
    for request in shown {
        table.add_row(vec![
            request.id.to_string(),
            request.member_id.to_string(),
            request.kind.to_string(),
            format_amount(request.amount),
            request.external_reference.clone().unwrap_or_else(|| "-".to_string()),
            request.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }

    Ok(format!("📋 {} pending request(s)\n{}", shown.len(), table.render()))
}
