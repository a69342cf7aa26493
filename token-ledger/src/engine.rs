//! Main ledger orchestration layer
//!
//! This module ties together storage, notification, and metrics components
//! into a high-level API for token transaction processing.
//!
//! # Example
//!
//! ```no_run
//! use token_ledger::{Config, Ledger};
//! use token_ledger::types::{AccountId, TransactionKind, TransactionRequest, TransactionSource};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> token_ledger::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::open(config).await?;
//!
//!     let request = TransactionRequest::new(
//!         AccountId::new("0xabc"),
//!         TransactionKind::Earned,
//!         Decimal::new(10000, 2),
//!         TransactionSource::LevelCompletion,
//!     );
//!     let entry = ledger.submit(request).await?;
//!     println!("balance: {}", entry.balance_after);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    metrics::Metrics,
    notify::{BalanceSubscriber, ChangeNotifier},
    types::{
        Account, AccountBalance, AccountId, BalanceUpdate, HistoryFilter, HistoryPage,
        HistorySummary, LedgerEntry, LedgerStats, Page, TransactionKind, TransactionRequest,
    },
    Config, Error, Result, Storage,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use uuid::Uuid;

/// Main ledger interface
///
/// Safe to share across tasks: submits for different accounts proceed in
/// parallel, submits for the same account serialize through the storage
/// commit and a bounded optimistic retry loop.
pub struct Ledger {
    /// Storage backend
    storage: Arc<Storage>,

    /// Change notifier (dispatches off the commit path)
    notifier: ChangeNotifier,

    /// Metrics collector
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;
        let notifier = ChangeNotifier::spawn(config.notifier.clone(), metrics.clone());

        Ok(Self {
            storage,
            notifier,
            metrics,
            config,
        })
    }

    /// Register a downstream subscriber (cache invalidation, leaderboard)
    pub fn subscribe(&self, subscriber: Arc<dyn BalanceSubscriber>) {
        self.notifier.subscribe(subscriber);
    }

    /// Submit a transaction and return the committed entry
    ///
    /// Safe to retry with the same `transaction_id`: a replay returns the
    /// originally committed entry without reapplying it.
    pub async fn submit(&self, request: TransactionRequest) -> Result<LedgerEntry> {
        let start = Instant::now();
        let result = self.submit_inner(request).await;
        self.metrics
            .record_submit_duration(start.elapsed().as_secs_f64());
        result
    }

    async fn submit_inner(&self, request: TransactionRequest) -> Result<LedgerEntry> {
        // Idempotency guard first: a replayed id answers from the log even
        // if the caller mangled the rest of the request
        if let Some(existing) = self
            .storage
            .find_entry(&request.account_id, request.transaction_id)?
        {
            self.metrics.record_idempotent_replay();
            tracing::debug!(
                transaction_id = %request.transaction_id,
                account_id = %request.account_id,
                "Idempotent replay, returning committed entry"
            );
            return Ok(existing);
        }

        self.validate(&request)?;

        let mut backoff = Duration::from_millis(self.config.retry.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.retry.max_backoff_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (created, account) = self.resolve_account(&request.account_id)?;

            let balance_before = account.balance;
            let balance_after = request.kind.apply(balance_before, request.amount);
            let now = Utc::now();

            let committed = Account {
                balance: balance_after,
                version: account.version + 1,
                last_updated: now,
                ..account.clone()
            };

            let entry = LedgerEntry {
                transaction_id: request.transaction_id,
                account_id: request.account_id.clone(),
                kind: request.kind,
                amount: request.amount,
                balance_before,
                balance_after,
                sequence: committed.version,
                source: request.source,
                source_id: request.source_id.clone(),
                description: request.description.clone(),
                metadata: request.metadata.clone(),
                external_reference: request.external_reference.clone(),
                created_at: now,
            };

            match self.storage.commit(account.version, &committed, &entry) {
                Ok(()) => {
                    if created {
                        self.metrics.record_account_created();
                    }
                    self.metrics.record_transaction(request.kind.as_str());

                    // Off the critical path; failures never unwind the commit
                    self.notifier.notify(BalanceUpdate {
                        account_id: entry.account_id.clone(),
                        balance: balance_after,
                        version: committed.version,
                        at: now,
                    });

                    return Ok(entry);
                }

                // Lost the race against a submit with the same id: the
                // committed entry is the answer, not an error.
                Err(Error::DuplicateTransaction(_)) => {
                    let existing = self
                        .storage
                        .find_entry(&request.account_id, request.transaction_id)?
                        .ok_or_else(|| {
                            Error::InvariantViolation(format!(
                                "duplicate reported but entry missing for {}",
                                request.transaction_id
                            ))
                        })?;
                    self.metrics.record_idempotent_replay();
                    return Ok(existing);
                }

                Err(Error::Conflict(msg)) => {
                    self.metrics.record_conflict_retry();

                    if attempt >= self.config.retry.max_attempts {
                        tracing::warn!(
                            account_id = %request.account_id,
                            attempts = attempt,
                            "Commit retry budget exhausted"
                        );
                        return Err(Error::Conflict(msg));
                    }

                    tracing::debug!(
                        account_id = %request.account_id,
                        attempt,
                        "Write conflict, retrying with fresh state"
                    );

                    let jitter = {
                        use rand::Rng;
                        let half = (backoff.as_millis() as u64 / 2).max(1);
                        rand::thread_rng().gen_range(0..half)
                    };
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                    backoff = (backoff * 2).min(max_backoff);
                }

                Err(e) => return Err(e),
            }
        }
    }

    /// Validate request invariants
    fn validate(&self, request: &TransactionRequest) -> Result<()> {
        match request.kind {
            // Sign carries the transfer direction, zero is meaningless
            TransactionKind::Transferred => {
                if request.amount == Decimal::ZERO {
                    return Err(Error::Validation(
                        "Transfer amount must be non-zero".to_string(),
                    ));
                }
            }
            _ => {
                if request.amount <= Decimal::ZERO {
                    return Err(Error::Validation("Amount must be positive".to_string()));
                }
            }
        }

        Ok(())
    }

    /// Look up the target account, creating it on first touch when allowed
    fn resolve_account(&self, account_id: &AccountId) -> Result<(bool, Account)> {
        if self.storage.is_tombstoned(account_id)? {
            return Err(Error::AccountNotFound(format!(
                "{} has been deleted",
                account_id
            )));
        }

        match self.storage.get_account(account_id)? {
            Some(account) => Ok((false, account)),
            None if self.config.require_registration => {
                Err(Error::AccountNotFound(account_id.to_string()))
            }
            // First-touch: persisted by the commit itself
            None => Ok((true, Account::new(account_id.clone()))),
        }
    }

    /// Current balance and last mutation time
    pub fn get_balance(&self, account_id: &AccountId) -> Result<AccountBalance> {
        let account = self
            .storage
            .get_account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;

        Ok(AccountBalance {
            account_id: account.id,
            balance: account.balance,
            last_updated: account.last_updated,
        })
    }

    /// Transaction history, most recent first
    ///
    /// The summary aggregates over the full filtered set, not just the
    /// returned page. History remains queryable for tombstoned accounts.
    pub fn get_history(
        &self,
        account_id: &AccountId,
        filter: &HistoryFilter,
        page: Page,
    ) -> Result<HistoryPage> {
        let mut matching: Vec<LedgerEntry> = self
            .storage
            .entries_for_account(account_id)?
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect();

        let mut total_earned = Decimal::ZERO;
        let mut total_spent = Decimal::ZERO;
        for entry in &matching {
            if entry.kind.is_credit() {
                total_earned += entry.amount;
            } else if entry.kind.is_debit() {
                total_spent += entry.amount;
            }
        }

        let total = matching.len() as u64;

        // Commit order ascending on disk; flip for most-recent-first
        matching.reverse();
        let entries: Vec<LedgerEntry> = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();

        let has_more = page.offset + page.limit < total as usize;

        Ok(HistoryPage {
            entries,
            total,
            limit: page.limit,
            offset: page.offset,
            has_more,
            summary: HistorySummary {
                total_earned,
                total_spent,
                total_entries: total,
            },
        })
    }

    /// Pre-create an account (Player Directory path)
    ///
    /// Registration is idempotent; a pre-registered account behaves exactly
    /// like a first-touch one.
    pub fn register_account(&self, account_id: &AccountId) -> Result<Account> {
        if let Some(existing) = self.storage.get_account(account_id)? {
            return Ok(existing);
        }

        let account = Account::new(account_id.clone());
        match self.storage.create_account(&account) {
            Ok(()) => {
                self.metrics.record_account_created();
                tracing::info!(account_id = %account_id, "Account registered");
                Ok(account)
            }
            // A racing registration won; return its row
            Err(Error::Conflict(_)) => self.storage.get_account(account_id)?.ok_or_else(|| {
                Error::Conflict(format!("registration race for {}", account_id))
            }),
            Err(e) => Err(e),
        }
    }

    /// Attach an on-chain transaction hash to a committed entry
    ///
    /// Metadata-only annotation for the blockchain-sync collaborator; it
    /// cannot change balances and is rejected once set.
    pub fn attach_external_reference(
        &self,
        account_id: &AccountId,
        transaction_id: Uuid,
        tx_hash: &str,
    ) -> Result<LedgerEntry> {
        self.storage
            .annotate_external_reference(account_id, transaction_id, tx_hash)
    }

    /// Administrative account deletion
    ///
    /// Removes the account row; the entry history is tombstoned, never
    /// deleted, so the audit chain survives.
    pub fn delete_account(&self, account_id: &AccountId) -> Result<()> {
        self.storage.tombstone_account(account_id)
    }

    /// Whole-ledger statistics
    pub fn stats(&self) -> Result<LedgerStats> {
        self.storage.stats()
    }

    /// Audit walk over one account's entry chain
    ///
    /// Verifies that sequences are gapless, each entry's `balance_before`
    /// equals the previous entry's `balance_after`, every transition matches
    /// the delta function, and the account row agrees with the last entry.
    pub fn verify_chain(&self, account_id: &AccountId) -> Result<()> {
        let entries = self.storage.entries_for_account(account_id)?;

        let mut prev_after = Decimal::ZERO;
        let mut prev_sequence = 0u64;

        for entry in &entries {
            if entry.sequence != prev_sequence + 1 {
                return Err(Error::InvariantViolation(format!(
                    "sequence gap for {}: {} follows {}",
                    account_id, entry.sequence, prev_sequence
                )));
            }
            if entry.balance_before != prev_after {
                return Err(Error::InvariantViolation(format!(
                    "broken chain for {} at sequence {}: before {} != prior after {}",
                    account_id, entry.sequence, entry.balance_before, prev_after
                )));
            }
            if entry.balance_after != entry.kind.apply(entry.balance_before, entry.amount) {
                return Err(Error::InvariantViolation(format!(
                    "transition mismatch for {} at sequence {}",
                    account_id, entry.sequence
                )));
            }
            if entry.balance_after.is_sign_negative() {
                return Err(Error::InvariantViolation(format!(
                    "negative balance for {} at sequence {}",
                    account_id, entry.sequence
                )));
            }

            prev_after = entry.balance_after;
            prev_sequence = entry.sequence;
        }

        if let Some(account) = self.storage.get_account(account_id)? {
            if account.balance != prev_after || account.version != prev_sequence {
                return Err(Error::InvariantViolation(format!(
                    "account row for {} disagrees with its entry chain",
                    account_id
                )));
            }
        }

        Ok(())
    }

    /// Get metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Shutdown ledger, draining queued notifications
    pub async fn shutdown(self) {
        self.notifier.shutdown().await;
        tracing::info!("Ledger shut down");
    }
}
