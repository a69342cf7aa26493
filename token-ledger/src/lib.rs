//! BoomChain Token Ledger
//!
//! Per-account token balances mutated by many concurrent producers, backed
//! by an immutable, append-only transaction log.
//!
//! # Architecture
//!
//! - **Single atomic unit**: each commit writes the ledger entry and the
//!   updated account row in one storage batch
//! - **Optimistic concurrency**: a per-account version token detects stale
//!   writers; contended submits retry with a bounded backoff budget
//! - **Idempotency**: the transaction id is a replay-safe key enforced
//!   inside the commit unit
//! - **Fire-and-forget notification**: downstream caches and leaderboards
//!   learn of balance changes off the commit path
//!
//! # Invariants
//!
//! - Balances never go negative; debits clamp at zero
//! - Entries are never modified or deleted after commit
//! - Per-account entries form a gapless chain: each `balance_before`
//!   equals the previous `balance_after`
//! - The account row always equals the last committed entry

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::Ledger;
pub use error::{Error, Result};
pub use notify::{BalanceSubscriber, ChangeNotifier, ChannelSubscriber};
pub use storage::Storage;
pub use types::{
    Account, AccountBalance, AccountId, BalanceUpdate, HistoryFilter, HistoryPage, LedgerEntry,
    LedgerStats, Page, TransactionKind, TransactionRequest, TransactionSource,
};
