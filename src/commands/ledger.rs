use super::{describe, parse_id, ConsoleContext};
use crate::utils::{format_amount, TextTable};

const USAGE: &str = "$ledger <member_id>";

pub async fn execute(ctx: &ConsoleContext, args: &[&str]) -> Result<String, String> {
    let member_id = parse_id(args, 0, "member id", USAGE)?;

    let entries = ctx
        .requests
        .ledger(member_id)
        .await
        .map_err(|e| describe(&e))?;
    if entries.is_empty() {
        return Ok(format!("Member {} has no ledger entries", member_id));
    }

    let mut table = TextTable::new(&["Entry", "Request", "Amount", "Balance", "Posted"])
        .align_right(2)
        .align_right(3);
    for entry in &entries {
        table.add_row(vec![
            entry.id.to_string(),
            entry.request_id.to_string(),
            format_amount(entry.signed_amount()),
            format_amount(entry.balance_after),
            entry.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }

    let balance = entries.last().map_or(0, |entry| entry.balance_after);
    Ok(format!(
        "💰 Member {} balance: {}\n{}",
        member_id,
        format_amount(balance),
        table.render()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{console, submit, ADMIN};

    #[tokio::test]
    async fn test_ledger_shows_running_balance() {
        let ctx = console();
        for amount in [10_000, 2_550] {
            let request_id = submit(&ctx, 42, amount).await;
            ctx.requests.verify(request_id, ADMIN).await.expect("verify");
            ctx.requests.post(request_id).await.expect("post");
        }

        let output = execute(&ctx, &["42"]).await.expect("output");
        assert!(output.starts_with("💰 Member 42 balance: 125.50"), "{}", output);
        assert!(output.contains("100.00"));
    }

    #[tokio::test]
    async fn test_member_without_entries() {
        let ctx = console();
        assert_eq!(execute(&ctx, &["9"]).await, Ok("Member 9 has no ledger entries".to_string()));
    }
}
