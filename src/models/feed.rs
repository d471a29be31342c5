//! Change feed models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tables the change feed covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    TransactionRequests,
    MemberTransactions,
    TransactionProofs,
    LoanApplications,
    LoanGuarantors,
    Users,
    MemberLimits,
    Notifications,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::TransactionRequests,
        Table::MemberTransactions,
        Table::TransactionProofs,
        Table::LoanApplications,
        Table::LoanGuarantors,
        Table::Users,
        Table::MemberLimits,
        Table::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::TransactionRequests => "transaction_requests",
            Table::MemberTransactions => "member_transactions",
            Table::TransactionProofs => "transaction_proofs",
            Table::LoanApplications => "loan_applications",
            Table::LoanGuarantors => "loan_guarantors",
            Table::Users => "users",
            Table::MemberLimits => "member_limits",
            Table::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction_requests" => Ok(Table::TransactionRequests),
            "member_transactions" => Ok(Table::MemberTransactions),
            "transaction_proofs" => Ok(Table::TransactionProofs),
            "loan_applications" => Ok(Table::LoanApplications),
            "loan_guarantors" => Ok(Table::LoanGuarantors),
            "users" => Ok(Table::Users),
            "member_limits" => Ok(Table::MemberLimits),
            "notifications" => Ok(Table::Notifications),
            other => Err(format!("table '{}' is not on the change feed", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// The feed reconnected or fell behind; anything may have changed
    Resync,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Resync => "resync",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            "resync" => Ok(ChangeKind::Resync),
            other => Err(format!("unknown change kind '{}'", other)),
        }
    }
}

/// A committed row change as it travels over the transport
///
/// `row` is only used to evaluate subscription filters. It is never handed to
/// subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub row: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind, row: serde_json::Value) -> Self {
        Self { table, kind, row }
    }
}

/// What a subscriber is told: this query may be stale, go re-fetch it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    pub table: Table,
    pub kind: ChangeKind,
}
