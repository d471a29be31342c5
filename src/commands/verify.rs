use super::{describe, parse_id, ConsoleContext};

const USAGE: &str = "$verify <request_id>";

pub async fn execute(ctx: &ConsoleContext, args: &[&str]) -> Result<String, String> {
    let request_id = parse_id(args, 0, "request id", USAGE)?;

    let request = ctx
        .requests
        .verify(request_id, ctx.admin_id)
        .await
        .map_err(|e| describe(&e))?;
    ctx.queue_changed();

    Ok(format!("✅ Request #{} is now {}", request.id, request.status))
}
