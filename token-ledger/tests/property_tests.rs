//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Non-negativity: balance >= 0 after every committed entry
//! - Delta correctness: transitions follow the kind's balance function
//! - Idempotency: replaying a transaction id applies the change once
//! - Causal chaining: each entry's balance_before equals the prior
//!   entry's balance_after

use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;
use token_ledger::{
    types::{
        AccountId, HistoryFilter, Page, TransactionKind, TransactionRequest, TransactionSource,
    },
    Config, Ledger,
};

/// Strategy for generating valid amounts (positive decimals, two places)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000_00i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Strategy for generating transaction kinds
fn kind_strategy() -> impl Strategy<Value = TransactionKind> {
    prop_oneof![
        Just(TransactionKind::Earned),
        Just(TransactionKind::Bonus),
        Just(TransactionKind::Spent),
        Just(TransactionKind::Penalty),
        Just(TransactionKind::Transferred),
    ]
}

/// Strategy for generating sources
fn source_strategy() -> impl Strategy<Value = TransactionSource> {
    prop_oneof![
        Just(TransactionSource::LevelCompletion),
        Just(TransactionSource::Achievement),
        Just(TransactionSource::DailyBonus),
        Just(TransactionSource::Referral),
        Just(TransactionSource::Purchase),
        Just(TransactionSource::Admin),
        Just(TransactionSource::Penalty),
    ]
}

/// Strategy for generating wallet-style account IDs
fn account_id_strategy() -> impl Strategy<Value = AccountId> {
    "0x[0-9a-f]{40}".prop_map(AccountId::new)
}

/// One random balance mutation; transfers may be outgoing (negative)
fn operation_strategy() -> impl Strategy<Value = (TransactionKind, Decimal)> {
    (kind_strategy(), amount_strategy(), any::<bool>()).prop_map(|(kind, amount, negate)| {
        let amount = if kind == TransactionKind::Transferred && negate {
            -amount
        } else {
            amount
        };
        (kind, amount)
    })
}

/// Create test ledger with temp directory
async fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    (Ledger::open(config).await.unwrap(), temp_dir)
}

fn request(
    account: &AccountId,
    kind: TransactionKind,
    amount: Decimal,
    source: TransactionSource,
) -> TransactionRequest {
    TransactionRequest::new(account.clone(), kind, amount, source)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: balances never go negative, whatever the sequence
    #[test]
    fn prop_non_negative_balances(ops in prop::collection::vec(operation_strategy(), 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let account = AccountId::new("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

            for (kind, amount) in ops {
                let entry = ledger
                    .submit(request(&account, kind, amount, TransactionSource::Admin))
                    .await
                    .unwrap();
                prop_assert!(entry.balance_after >= Decimal::ZERO);
            }

            prop_assert!(ledger.get_balance(&account).unwrap().balance >= Decimal::ZERO);
            ledger.verify_chain(&account).unwrap();

            ledger.shutdown().await;
            Ok(())
        })?;
    }

    /// Property: every transition follows the kind's balance function
    #[test]
    fn prop_delta_correctness(
        opening in amount_strategy(),
        (kind, amount) in operation_strategy(),
        source in source_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let account = AccountId::new("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

            ledger
                .submit(request(&account, TransactionKind::Earned, opening, TransactionSource::LevelCompletion))
                .await
                .unwrap();

            let entry = ledger
                .submit(request(&account, kind, amount, source))
                .await
                .unwrap();

            prop_assert_eq!(entry.balance_before, opening);
            let expected = match kind {
                TransactionKind::Earned | TransactionKind::Bonus => opening + amount,
                TransactionKind::Spent | TransactionKind::Penalty => {
                    (opening - amount).max(Decimal::ZERO)
                }
                TransactionKind::Transferred => (opening + amount).max(Decimal::ZERO),
            };
            prop_assert_eq!(entry.balance_after, expected);

            ledger.shutdown().await;
            Ok(())
        })?;
    }

    /// Property: replaying a transaction id yields the original entry and
    /// the balance changes exactly once
    #[test]
    fn prop_idempotent_replay(
        (kind, amount) in operation_strategy(),
        source in source_strategy(),
        account in account_id_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            let req = request(&account, kind, amount, source);
            let first = ledger.submit(req.clone()).await.unwrap();
            let second = ledger.submit(req).await.unwrap();

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(
                ledger.get_balance(&account).unwrap().balance,
                first.balance_after
            );

            let history = ledger
                .get_history(&account, &HistoryFilter::default(), Page::default())
                .unwrap();
            prop_assert_eq!(history.total, 1);

            ledger.shutdown().await;
            Ok(())
        })?;
    }

    /// Property: per-account entries form a gapless causal chain starting
    /// from a zero balance
    #[test]
    fn prop_causal_chain(ops in prop::collection::vec(operation_strategy(), 1..25)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let account = AccountId::new("0xcccccccccccccccccccccccccccccccccccccccc");

            for (kind, amount) in &ops {
                ledger
                    .submit(request(&account, *kind, *amount, TransactionSource::Admin))
                    .await
                    .unwrap();
            }

            // Oldest first for the walk
            let history = ledger
                .get_history(
                    &account,
                    &HistoryFilter::default(),
                    Page { limit: ops.len(), offset: 0 },
                )
                .unwrap();
            let mut entries = history.entries;
            entries.reverse();

            let mut prev_after = Decimal::ZERO;
            for (i, entry) in entries.iter().enumerate() {
                prop_assert_eq!(entry.sequence, i as u64 + 1);
                prop_assert_eq!(entry.balance_before, prev_after);
                prev_after = entry.balance_after;
            }
            prop_assert_eq!(ledger.get_balance(&account).unwrap().balance, prev_after);

            ledger.verify_chain(&account).unwrap();

            ledger.shutdown().await;
            Ok(())
        })?;
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Arc;

    /// N concurrent submits with distinct ids on one account converge to
    /// the sum with no lost updates.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_convergence() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        // Heavy single-account contention needs a deeper retry budget than
        // the production default
        config.retry.max_attempts = 64;
        config.retry.initial_backoff_ms = 1;

        let ledger = Arc::new(Ledger::open(config).await.unwrap());
        let account = AccountId::new("0xdddddddddddddddddddddddddddddddddddddddd");

        let mut handles = Vec::new();
        let mut expected = Decimal::ZERO;
        for i in 1..=16i64 {
            let amount = Decimal::new(100 * i, 2);
            expected += amount;

            let ledger = ledger.clone();
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .submit(request(
                        &account,
                        TransactionKind::Earned,
                        amount,
                        TransactionSource::LevelCompletion,
                    ))
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.get_balance(&account).unwrap().balance, expected);

        let history = ledger
            .get_history(&account, &HistoryFilter::default(), Page { limit: 100, offset: 0 })
            .unwrap();
        assert_eq!(history.total, 16);

        ledger.verify_chain(&account).unwrap();

        if let Ok(ledger) = Arc::try_unwrap(ledger) {
            ledger.shutdown().await;
        }
    }

    /// Submits against different accounts never contend with each other.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_accounts_in_parallel() {
        let (ledger, _temp) = create_test_ledger().await;
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let account = AccountId::new(format!("0x{:040x}", i));
                for _ in 0..4 {
                    ledger
                        .submit(request(
                            &account,
                            TransactionKind::Earned,
                            Decimal::new(250, 2),
                            TransactionSource::LevelCompletion,
                        ))
                        .await
                        .unwrap();
                }
                account
            }));
        }

        for handle in handles {
            let account = handle.await.unwrap();
            assert_eq!(
                ledger.get_balance(&account).unwrap().balance,
                Decimal::new(1000, 2)
            );
            ledger.verify_chain(&account).unwrap();
        }

        // Zero conflicts expected across disjoint accounts
        assert_eq!(ledger.metrics().conflict_retries_total.get(), 0);

        if let Ok(ledger) = Arc::try_unwrap(ledger) {
            ledger.shutdown().await;
        }
    }

    /// The worked example: earn 100, overspend 150 clamps to zero, replay
    /// of the first transaction returns the original entry unchanged.
    #[tokio::test]
    async fn test_clamp_and_replay_scenario() {
        let (ledger, _temp) = create_test_ledger().await;
        let account = AccountId::new("0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");

        let t1 = request(
            &account,
            TransactionKind::Earned,
            Decimal::new(10000, 2),
            TransactionSource::LevelCompletion,
        );
        let first = ledger.submit(t1.clone()).await.unwrap();
        assert_eq!(first.balance_before, Decimal::ZERO);
        assert_eq!(first.balance_after, Decimal::new(10000, 2));

        let t2 = request(
            &account,
            TransactionKind::Spent,
            Decimal::new(15000, 2),
            TransactionSource::Purchase,
        );
        let second = ledger.submit(t2).await.unwrap();
        assert_eq!(second.balance_before, Decimal::new(10000, 2));
        assert_eq!(second.balance_after, Decimal::ZERO);

        let replay = ledger.submit(t1).await.unwrap();
        assert_eq!(replay, first);
        assert_eq!(ledger.get_balance(&account).unwrap().balance, Decimal::ZERO);

        ledger.shutdown().await;
    }
}
