use super::{describe, parse_id, ConsoleContext};

const USAGE: &str = "$reject <request_id> <reason>";

pub async fn execute(ctx: &ConsoleContext, args: &[&str]) -> Result<String, String> {
    let request_id = parse_id(args, 0, "request id", USAGE)?;
    let reason = args.get(1..).unwrap_or_default().join(" ");
    if reason.trim().is_empty() {
        return Err(format!("A reason is required. Usage: `{}`", USAGE));
    }

    let request = ctx
        .requests
        .reject(request_id, ctx.admin_id, &reason)
        .await
        .map_err(|e| describe(&e))?;
    ctx.queue_changed();

    Ok(format!("🚫 Request #{} rejected: {}", request.id, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{console, submit};

    #[tokio::test]
    async fn test_reject_needs_reason() {
        let ctx = console();
        let request_id = submit(&ctx, 42, 100).await;
        let id = request_id.to_string();
        let id = id.as_str();

        assert!(execute(&ctx, &[id]).await.unwrap_err().contains("reason is required"));

        let output = execute(&ctx, &[id, "photo", "unreadable"]).await.expect("reject");
        assert_eq!(output, format!("🚫 Request #{} rejected: photo unreadable", request_id));
    }
}
