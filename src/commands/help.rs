pub fn execute() -> String {
    [
        "📖 SACCO admin console",
        "",
        "Requests",
        "  $pending [limit]            - Pending requests, newest first",
        "  $verify <request_id>        - Verify a pending request",
        "  $reject <request_id> <why>  - Reject a pending request",
        "  $post <request_id>          - Post a verified request to the ledger (safe to repeat)",
        "",
        "Members",
        "  $ledger <member_id>         - Ledger entries and current balance",
        "",
        "  $help                       - Show this message",
    ]
    .join("\n")
}
