//! Deposit, account and audit records shared by the observer, the store and
//! the reconciliation loop.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Primary key of the `deposits` table
pub type DepositId = i64;

/// Deposit lifecycle status
///
/// ```text
/// PENDING ──▶ CREDITED ──▶ REVERSED   (reversal is operator-only)
///    │
///    └──────▶ REORGED                 (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Credited,
    Reorged,
    Reversed,
}

impl DepositStatus {
    /// Value stored in the `deposits.status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Credited => "credited",
            DepositStatus::Reorged => "reorged",
            DepositStatus::Reversed => "reversed",
        }
    }

    /// No automatic transition leaves a terminal status.
    /// `Credited` is not terminal: an operator may still reverse it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositStatus::Reorged | DepositStatus::Reversed)
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown deposit status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for DepositStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DepositStatus::Pending),
            "credited" => Ok(DepositStatus::Credited),
            "reorged" => Ok(DepositStatus::Reorged),
            "reversed" => Ok(DepositStatus::Reversed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Where a transaction was seen on chain.
///
/// Block number and block hash are only ever learned together from a
/// receipt, so they travel as one value. A deposit that has never been
/// observed carries `None`, which is distinct from "observed in block 0".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainObservation {
    pub block: u64,
    pub block_hash: String,
}

impl ChainObservation {
    pub fn new(block: u64, block_hash: impl Into<String>) -> Self {
        Self {
            block,
            block_hash: block_hash.into(),
        }
    }

    /// Block hashes from different RPC nodes may differ in hex case.
    pub fn same_block_hash(&self, other: &str) -> bool {
        self.block_hash.eq_ignore_ascii_case(other)
    }
}

/// A deposit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deposit {
    pub id: DepositId,
    pub tx_hash: String,
    pub address: String,
    /// Smallest unit of the asset (e.g. wei)
    pub amount: i64,
    /// Last observed confirmation count
    pub confirmations: u64,
    pub observation: Option<ChainObservation>,
    pub status: DepositStatus,
    pub received_at: DateTime<Utc>,
    pub credited_at: Option<DateTime<Utc>>,
}

impl Deposit {
    pub fn tx_block(&self) -> Option<u64> {
        self.observation.as_ref().map(|o| o.block)
    }

    pub fn block_hash(&self) -> Option<&str> {
        self.observation.as_ref().map(|o| o.block_hash.as_str())
    }
}

/// Input for seeding a new deposit. Detection itself happens elsewhere;
/// deposits always start `pending` and unobserved.
#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub tx_hash: String,
    pub address: String,
    pub amount: i64,
    pub received_at: DateTime<Utc>,
}

impl NewDeposit {
    pub fn new(tx_hash: impl Into<String>, address: impl Into<String>, amount: i64) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            address: address.into(),
            amount,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub address: String,
    pub balance: i64,
}

/// Audit action label stored in `audits.action`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Credited,
    Reorged,
    Reversed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Credited => "credited",
            AuditAction::Reorged => "reorged",
            AuditAction::Reversed => "reversed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credited" => Ok(AuditAction::Credited),
            "reorged" => Ok(AuditAction::Reorged),
            "reversed" => Ok(AuditAction::Reversed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Append-only audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub deposit_id: DepositId,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
}
