use super::{describe, parse_id, ConsoleContext};
use crate::utils::format_amount;

const USAGE: &str = "$post <request_id>";

pub async fn execute(ctx: &ConsoleContext, args: &[&str]) -> Result<String, String> {
    let request_id = parse_id(args, 0, "request id", USAGE)?;

    let entry = ctx
        .requests
        .post(request_id)
        .await
        .map_err(|e| describe(&e))?;

    Ok(format!(
        "📒 Request #{} posted as entry #{}: {} {} for member {}, balance {}",
        request_id,
        entry.id,
        entry.direction.as_str(),
        format_amount(entry.amount),
        entry.member_id,
        format_amount(entry.balance_after)
    ))
}
