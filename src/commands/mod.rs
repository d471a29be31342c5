pub mod help;
pub mod pending;
pub mod verify;
pub mod reject;
pub mod post;
pub mod ledger;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::models::{Table, TransactionRequest};
use crate::services::request_service::RequestService;
use crate::utils::{extract_clean_error, EngineError, Result as EngineResult};

/// What every console command runs against
pub struct ConsoleContext {
    pub requests: Arc<RequestService>,
    /// Acting administrator for dispositions
    pub admin_id: i64,
    /// Pending queue as last fetched, see [`pending::queue_key`]
    pub queue: QueryCache<Vec<TransactionRequest>>,
}

impl ConsoleContext {
    pub fn new(
        requests: Arc<RequestService>,
        admin_id: i64,
        queue: QueryCache<Vec<TransactionRequest>>,
    ) -> Self {
        Self {
            requests,
            admin_id,
            queue,
        }
    }

    /// Re-fetch the queue whenever any request row changes, on any client
    pub fn watch_queue(&self) -> EngineResult<()> {
        self.queue
            .watch(&pending::queue_key(), Table::TransactionRequests, None)
    }

    /// Our own dispositions show up on the next `$pending` even before the
    /// feed reports them
    pub(crate) fn queue_changed(&self) {
        self.queue.invalidate(&pending::queue_key());
    }
}

/// Run one console line. `None` for lines that are not commands.
pub async fn handle_line(ctx: &ConsoleContext, line: &str) -> Option<String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let (&command, args) = parts.split_first()?;
    if !command.starts_with('$') {
        return None;
    }

    let result = match command {
        "$help" | "$h" => Ok(help::execute()),
        "$pending" | "$queue" => pending::execute(ctx, args).await,
        "$verify" | "$approve" => verify::execute(ctx, args).await,
        "$reject" | "$deny" => reject::execute(ctx, args).await,
        "$post" => post::execute(ctx, args).await,
        "$ledger" | "$statement" => ledger::execute(ctx, args).await,
        _ => Err(format!("Unknown command `{}`. Try `$help`.", command)),
    };

    Some(match result {
        Ok(output) => {
            debug!(command, "Console command completed");
            output
        }
        Err(e) => {
            warn!(command, "Console command failed: {}", e);
            format!("❌ {}", e)
        }
    })
}

/// Console wording for engine errors
pub(crate) fn describe(error: &EngineError) -> String {
    match error {
        EngineError::InvalidTransition { .. } => format!("{} (already handled?)", error),
        EngineError::Forbidden { .. } => format!("{}. Check ADMIN_ID.", error),
        _ => extract_clean_error(&error.to_string()),
    }
}

/// Parse a positional id argument
pub(crate) fn parse_id(
    args: &[&str],
    index: usize,
    name: &str,
    usage: &str,
) -> Result<i64, String> {
    let raw = args
        .get(index)
        .ok_or_else(|| format!("Missing {}. Usage: `{}`", name, usage))?;
    raw.trim_start_matches('#')
        .parse::<i64>()
        .map_err(|_| format!("Invalid {} '{}'. Usage: `{}`", name, raw, usage))
}
