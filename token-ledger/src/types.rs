//! Core types for the token ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal for token amounts)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Account identifier (wallet address or player id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Balance-holding account
///
/// The `version` field is the concurrency token: it increments on every
/// committed transaction and is compared on write to detect stale writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier
    pub id: AccountId,

    /// Current token balance (never negative)
    pub balance: Decimal,

    /// Concurrency token, increments on every commit
    pub version: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Timestamp of last successful mutation
    pub last_updated: DateTime<Utc>,
}

impl Account {
    /// Create a fresh zero-balance account
    pub fn new(id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            last_updated: now,
        }
    }
}

/// Transaction kind (direction of the balance change)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionKind {
    /// Tokens earned through gameplay
    Earned = 1,
    /// Bonus tokens (daily bonus, admin grant)
    Bonus = 2,
    /// Tokens spent by the player
    Spent = 3,
    /// Penalty deduction (admin revoke)
    Penalty = 4,
    /// Peer transfer; the amount carries the sign of the direction
    Transferred = 5,
}

impl TransactionKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Earned => "earned",
            TransactionKind::Bonus => "bonus",
            TransactionKind::Spent => "spent",
            TransactionKind::Penalty => "penalty",
            TransactionKind::Transferred => "transferred",
        }
    }

    /// Parse from wire name
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "earned" => Some(TransactionKind::Earned),
            "bonus" => Some(TransactionKind::Bonus),
            "spent" => Some(TransactionKind::Spent),
            "penalty" => Some(TransactionKind::Penalty),
            "transferred" => Some(TransactionKind::Transferred),
            _ => None,
        }
    }

    /// Compute the post-transaction balance
    ///
    /// Debits clamp at zero instead of rejecting insufficient funds; the
    /// un-covered portion of the amount is discarded.
    pub fn apply(&self, balance_before: Decimal, amount: Decimal) -> Decimal {
        match self {
            TransactionKind::Earned | TransactionKind::Bonus => balance_before + amount,
            TransactionKind::Spent | TransactionKind::Penalty => {
                (balance_before - amount).max(Decimal::ZERO)
            }
            // Amount may be negative for outgoing transfers
            TransactionKind::Transferred => (balance_before + amount).max(Decimal::ZERO),
        }
    }

    /// Whether this kind credits the account
    pub fn is_credit(&self) -> bool {
        matches!(self, TransactionKind::Earned | TransactionKind::Bonus)
    }

    /// Whether this kind debits the account
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionKind::Spent | TransactionKind::Penalty)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Business reason for a transaction
///
/// The transport layer authorizes the source before submission; the engine
/// trusts it as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionSource {
    /// Level completion reward
    LevelCompletion = 1,
    /// Achievement payout
    Achievement = 2,
    /// Daily login bonus
    DailyBonus = 3,
    /// Referral reward
    Referral = 4,
    /// In-game purchase
    Purchase = 5,
    /// Administrative grant or revoke
    Admin = 6,
    /// Penalty enforcement
    Penalty = 7,
}

impl TransactionSource {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::LevelCompletion => "level_completion",
            TransactionSource::Achievement => "achievement",
            TransactionSource::DailyBonus => "daily_bonus",
            TransactionSource::Referral => "referral",
            TransactionSource::Purchase => "purchase",
            TransactionSource::Admin => "admin",
            TransactionSource::Penalty => "penalty",
        }
    }

    /// Parse from wire name
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "level_completion" => Some(TransactionSource::LevelCompletion),
            "achievement" => Some(TransactionSource::Achievement),
            "daily_bonus" => Some(TransactionSource::DailyBonus),
            "referral" => Some(TransactionSource::Referral),
            "purchase" => Some(TransactionSource::Purchase),
            "admin" => Some(TransactionSource::Admin),
            "penalty" => Some(TransactionSource::Penalty),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request to apply one balance change
///
/// The `transaction_id` doubles as the idempotency key: resubmitting the
/// same id returns the originally committed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Idempotency key (caller-supplied or generated)
    pub transaction_id: Uuid,

    /// Target account
    pub account_id: AccountId,

    /// Transaction kind
    pub kind: TransactionKind,

    /// Requested change; positive magnitude, except `Transferred` where the
    /// sign carries the direction
    pub amount: Decimal,

    /// Business reason
    pub source: TransactionSource,

    /// Optional correlation id (achievement id, session id)
    pub source_id: Option<String>,

    /// Human-readable description
    pub description: Option<String>,

    /// Opaque annotation, not interpreted by the engine
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// On-chain transaction hash, when already known at submit time
    pub external_reference: Option<String>,
}

impl TransactionRequest {
    /// Create a request with a generated transaction id
    pub fn new(
        account_id: AccountId,
        kind: TransactionKind,
        amount: Decimal,
        source: TransactionSource,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            account_id,
            kind,
            amount,
            source,
            source_id: None,
            description: None,
            metadata: HashMap::new(),
            external_reference: None,
        }
    }
}

/// Immutable record of one applied balance transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Idempotency key of the originating request
    pub transaction_id: Uuid,

    /// Account this entry belongs to
    pub account_id: AccountId,

    /// Transaction kind
    pub kind: TransactionKind,

    /// Requested change as submitted (signed only for `Transferred`)
    pub amount: Decimal,

    /// Balance before the transition
    pub balance_before: Decimal,

    /// Balance after the transition
    pub balance_after: Decimal,

    /// Per-account commit sequence number (1-based)
    pub sequence: u64,

    /// Business reason
    pub source: TransactionSource,

    /// Optional correlation id
    pub source_id: Option<String>,

    /// Human-readable description
    pub description: Option<String>,

    /// Opaque annotation
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// On-chain transaction hash, attached later by the blockchain-sync
    /// collaborator
    pub external_reference: Option<String>,

    /// Commit timestamp
    pub created_at: DateTime<Utc>,
}

/// Committed balance change pushed to downstream subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    /// Account that changed
    pub account_id: AccountId,

    /// New balance
    pub balance: Decimal,

    /// Account version after the commit
    pub version: u64,

    /// Commit timestamp
    pub at: DateTime<Utc>,
}

/// Current balance view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier
    pub account_id: AccountId,

    /// Current balance
    pub balance: Decimal,

    /// Timestamp of last mutation
    pub last_updated: DateTime<Utc>,
}

/// History query filter; all fields are conjunctive
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Restrict to one transaction kind
    pub kind: Option<TransactionKind>,

    /// Restrict to one source
    pub source: Option<TransactionSource>,

    /// Entries committed at or after this instant
    pub from: Option<DateTime<Utc>>,

    /// Entries committed at or before this instant
    pub to: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    /// Whether an entry passes the filter
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }
        if let Some(source) = self.source {
            if entry.source != source {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.created_at > to {
                return false;
            }
        }
        true
    }
}

/// Offset/limit pagination
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Maximum number of entries returned
    pub limit: usize,

    /// Number of entries skipped (most recent first)
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Aggregates over the filtered history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    /// Sum of credited amounts (earned + bonus)
    pub total_earned: Decimal,

    /// Sum of debited amounts (spent + penalty)
    pub total_spent: Decimal,

    /// Number of matching entries
    pub total_entries: u64,
}

/// One page of transaction history, most recent first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Entries in this page
    pub entries: Vec<LedgerEntry>,

    /// Total number of matching entries
    pub total: u64,

    /// Page limit applied
    pub limit: usize,

    /// Page offset applied
    pub offset: usize,

    /// Whether more entries follow this page
    pub has_more: bool,

    /// Aggregates over the full filtered set
    pub summary: HistorySummary,
}

/// Whole-ledger statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Number of live accounts
    pub total_accounts: u64,

    /// Number of committed entries (approximate)
    pub total_entries: u64,

    /// Sum of all live account balances
    pub tokens_in_circulation: Decimal,
}
