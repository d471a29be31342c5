//! Ledger models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }

    /// Apply the direction to a non-negative amount
    pub fn sign(&self, amount: i64) -> i64 {
        match self {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Row of `member_transactions`. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTransaction {
    pub id: i64,
    #[serde(rename = "user_id")]
    pub member_id: i64,
    pub request_id: i64,
    /// Always non-negative; `direction` carries the sign
    pub amount: i64,
    pub direction: Direction,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

impl MemberTransaction {
    pub fn signed_amount(&self) -> i64 {
        self.direction.sign(self.amount)
    }
}

/// Entry about to be appended to a member's ledger
///
/// `prior_entry_id` is the id of the entry `balance_after` was computed from.
/// The store refuses the append if that is no longer the member's latest entry.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub member_id: i64,
    pub request_id: i64,
    pub amount: i64,
    pub direction: Direction,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
    pub prior_entry_id: Option<i64>,
}
