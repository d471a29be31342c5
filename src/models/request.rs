//! Transaction request models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a transaction request
///
/// `pending -> verified -> posted` or `pending -> rejected`. `posted` and
/// `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Verified,
    Rejected,
    Posted,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Verified => "verified",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Posted => "posted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Posted)
    }

    /// Whether `self -> next` is a legal single step
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Verified)
                | (RequestStatus::Pending, RequestStatus::Rejected)
                | (RequestStatus::Verified, RequestStatus::Posted)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "verified" => Ok(RequestStatus::Verified),
            "rejected" => Ok(RequestStatus::Rejected),
            "posted" => Ok(RequestStatus::Posted),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

/// What the member wants to do with the money
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Repayment,
    SharePurchase,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
            TransactionKind::Repayment => "repayment",
            TransactionKind::SharePurchase => "share_purchase",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdraw" | "withdrawal" => Ok(TransactionKind::Withdraw),
            "repayment" => Ok(TransactionKind::Repayment),
            "share_purchase" => Ok(TransactionKind::SharePurchase),
            other => Err(format!("unknown transaction kind '{}'", other)),
        }
    }
}

/// Row of `transaction_requests`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub id: i64,
    #[serde(rename = "user_id")]
    pub member_id: i64,
    pub amount: i64,
    pub kind: TransactionKind,
    pub external_reference: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub acted_by: Option<i64>,
    pub acted_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

/// Fields a member supplies when submitting a request
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub member_id: i64,
    pub amount: i64,
    pub kind: TransactionKind,
    pub external_reference: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_forward_transitions_are_legal() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Verified));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Verified.can_transition_to(Posted));

        assert!(!Verified.can_transition_to(Pending));
        assert!(!Verified.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Posted));
        for terminal in [Rejected, Posted] {
            assert!(terminal.is_terminal());
            for next in [Pending, Verified, Rejected, Posted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_parses_its_own_string() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Verified,
            RequestStatus::Rejected,
            RequestStatus::Posted,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>(), Ok(status));
        }
        assert!("reopened".parse::<RequestStatus>().is_err());
    }
}
