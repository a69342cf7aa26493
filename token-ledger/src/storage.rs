//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Account rows (key: account id)
//! - `entries` - Append-only transaction log (key: account id || 0x00 || sequence)
//! - `tx_index` - Idempotency index (key: account id || 0x00 || transaction id)
//! - `tombstones` - Deleted accounts whose history is retained for audit
//!
//! A commit writes the ledger entry, its idempotency index row, and the
//! updated account as one `WriteBatch` under a per-account lock, so the
//! account row and its owning entry are never persisted separately. The
//! version check and the idempotency uniqueness check happen under the same
//! lock, which makes both linearizable per account.

use crate::{
    error::{Error, Result},
    types::{Account, AccountId, LedgerEntry, LedgerStats},
    Config,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_TX_INDEX: &str = "tx_index";
const CF_TOMBSTONES: &str = "tombstones";

/// Separator between the account id and the key suffix
const KEY_SEP: u8 = 0x00;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,

    /// Per-account commit locks (stripe map, grown on first touch)
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        // Column family descriptors
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_accounts()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_TX_INDEX, Self::cf_options_tx_index()),
            ColumnFamilyDescriptor::new(CF_TOMBSTONES, Self::cf_options_tombstones()),
        ];

        // Open database
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!("Opened RocksDB at {:?}", path);

        Ok(Self {
            db: Arc::new(db),
            locks: DashMap::new(),
        })
    }

    // Column family options

    fn cf_options_accounts() -> Options {
        let mut opts = Options::default();
        // Accounts are frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_tx_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Point lookups on every submit benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_tombstones() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Per-account lock, created on first touch
    fn account_lock(&self, account_id: &AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Key encoding

    fn account_key(account_id: &AccountId) -> Vec<u8> {
        account_id.as_str().as_bytes().to_vec()
    }

    fn entry_key(account_id: &AccountId, sequence: u64) -> Vec<u8> {
        let mut key = account_id.as_str().as_bytes().to_vec();
        key.push(KEY_SEP);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn entry_prefix(account_id: &AccountId) -> Vec<u8> {
        let mut key = account_id.as_str().as_bytes().to_vec();
        key.push(KEY_SEP);
        key
    }

    fn tx_index_key(account_id: &AccountId, transaction_id: Uuid) -> Vec<u8> {
        let mut key = account_id.as_str().as_bytes().to_vec();
        key.push(KEY_SEP);
        key.extend_from_slice(transaction_id.as_bytes());
        key
    }

    // Account operations

    /// Get account by id
    pub fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;

        match self.db.get_cf(cf, Self::account_key(account_id))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Create a zero-balance account row (registration path)
    ///
    /// Fails with `Conflict` if the account already exists so a racing
    /// registration cannot overwrite committed state.
    pub fn create_account(&self, account: &Account) -> Result<()> {
        let lock = self.account_lock(&account.id);
        let _guard = lock.lock();

        if self.is_tombstoned(&account.id)? {
            return Err(Error::AccountNotFound(format!(
                "{} has been deleted",
                account.id
            )));
        }

        if self.get_account(&account.id)?.is_some() {
            return Err(Error::Conflict(format!(
                "Account {} already exists",
                account.id
            )));
        }

        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let value = bincode::serialize(account)?;
        self.db.put_cf(cf, Self::account_key(&account.id), value)?;

        tracing::debug!(account_id = %account.id, "Account created");

        Ok(())
    }

    /// Whether the account was administratively deleted
    pub fn is_tombstoned(&self, account_id: &AccountId) -> Result<bool> {
        let cf = self.cf_handle(CF_TOMBSTONES)?;
        Ok(self.db.get_cf(cf, Self::account_key(account_id))?.is_some())
    }

    // Commit path

    /// Apply one transaction as an all-or-nothing unit
    ///
    /// `expected_version` is the concurrency token read by the caller;
    /// `account` is the post-transaction row and `entry` the owning log
    /// record. Under the per-account lock the stored version is re-read and
    /// compared, the idempotency index is checked, and only then the batch
    /// (entry + index + account) is written.
    pub fn commit(
        &self,
        expected_version: u64,
        account: &Account,
        entry: &LedgerEntry,
    ) -> Result<()> {
        // Defensive last line: the engine computes the clamp, but a negative
        // balance must never reach disk.
        if account.balance.is_sign_negative() || entry.balance_after.is_sign_negative() {
            return Err(Error::InvariantViolation(format!(
                "negative balance for account {}",
                account.id
            )));
        }
        if account.balance != entry.balance_after || account.version != entry.sequence {
            return Err(Error::InvariantViolation(format!(
                "account row does not match its entry for {}",
                account.id
            )));
        }

        let lock = self.account_lock(&account.id);
        let _guard = lock.lock();

        if self.is_tombstoned(&account.id)? {
            return Err(Error::AccountNotFound(format!(
                "{} has been deleted",
                account.id
            )));
        }

        // Concurrency token check
        let current_version = self
            .get_account(&account.id)?
            .map(|a| a.version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Err(Error::Conflict(format!(
                "version mismatch for {}: expected {}, found {}",
                account.id, expected_version, current_version
            )));
        }

        // Idempotency uniqueness, enforced inside the commit unit
        let cf_index = self.cf_handle(CF_TX_INDEX)?;
        let index_key = Self::tx_index_key(&account.id, entry.transaction_id);
        if self.db.get_cf(cf_index, &index_key)?.is_some() {
            return Err(Error::DuplicateTransaction(entry.transaction_id.to_string()));
        }

        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_entries,
            Self::entry_key(&account.id, entry.sequence),
            bincode::serialize(entry)?,
        );
        batch.put_cf(cf_index, &index_key, entry.sequence.to_be_bytes());
        batch.put_cf(
            cf_accounts,
            Self::account_key(&account.id),
            bincode::serialize(account)?,
        );

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            account_id = %account.id,
            transaction_id = %entry.transaction_id,
            sequence = entry.sequence,
            balance_after = %entry.balance_after,
            "Transaction committed"
        );

        Ok(())
    }

    // Entry operations

    /// Look up an entry by its idempotency key
    pub fn find_entry(
        &self,
        account_id: &AccountId,
        transaction_id: Uuid,
    ) -> Result<Option<LedgerEntry>> {
        let cf_index = self.cf_handle(CF_TX_INDEX)?;

        let value = match self
            .db
            .get_cf(cf_index, Self::tx_index_key(account_id, transaction_id))?
        {
            Some(value) => value,
            None => return Ok(None),
        };

        let sequence_bytes: [u8; 8] = value
            .as_slice()
            .try_into()
            .map_err(|_| Error::Storage("malformed tx_index value".to_string()))?;
        let sequence = u64::from_be_bytes(sequence_bytes);

        Ok(Some(self.get_entry(account_id, sequence)?))
    }

    /// Get entry by account and sequence number
    pub fn get_entry(&self, account_id: &AccountId, sequence: u64) -> Result<LedgerEntry> {
        let cf = self.cf_handle(CF_ENTRIES)?;

        let value = self
            .db
            .get_cf(cf, Self::entry_key(account_id, sequence))?
            .ok_or_else(|| {
                Error::EntryNotFound(format!("{} sequence {}", account_id, sequence))
            })?;

        Ok(bincode::deserialize(&value)?)
    }

    /// All entries for an account in commit order (ascending sequence)
    pub fn entries_for_account(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let prefix = Self::entry_prefix(account_id);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }

    /// Attach an on-chain transaction hash to a committed entry
    ///
    /// This is the only mutation entries ever see: the annotation must not
    /// already be set and the balance fields are untouched.
    pub fn annotate_external_reference(
        &self,
        account_id: &AccountId,
        transaction_id: Uuid,
        tx_hash: &str,
    ) -> Result<LedgerEntry> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock();

        let mut entry = self
            .find_entry(account_id, transaction_id)?
            .ok_or_else(|| {
                Error::EntryNotFound(format!("{} transaction {}", account_id, transaction_id))
            })?;

        if entry.external_reference.is_some() {
            return Err(Error::Validation(format!(
                "external reference already set for transaction {}",
                transaction_id
            )));
        }

        entry.external_reference = Some(tx_hash.to_string());

        let cf = self.cf_handle(CF_ENTRIES)?;
        self.db.put_cf(
            cf,
            Self::entry_key(account_id, entry.sequence),
            bincode::serialize(&entry)?,
        )?;

        tracing::debug!(
            account_id = %account_id,
            transaction_id = %transaction_id,
            "External reference attached"
        );

        Ok(entry)
    }

    // Account deletion

    /// Remove the account row and tombstone its history
    ///
    /// Entries are retained for audit; the tombstone marker prevents the
    /// account from being recreated by first-touch or registration.
    pub fn tombstone_account(&self, account_id: &AccountId) -> Result<()> {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock();

        if self.get_account(account_id)?.is_none() {
            return Err(Error::AccountNotFound(account_id.to_string()));
        }

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_tombstones = self.cf_handle(CF_TOMBSTONES)?;

        let deleted_at = Utc::now().timestamp_nanos_opt().unwrap_or(0);

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_accounts, Self::account_key(account_id));
        batch.put_cf(
            cf_tombstones,
            Self::account_key(account_id),
            deleted_at.to_be_bytes(),
        );
        self.db.write(batch)?;

        tracing::info!(account_id = %account_id, "Account tombstoned");

        Ok(())
    }

    // Statistics

    /// Whole-ledger statistics
    pub fn stats(&self) -> Result<LedgerStats> {
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;

        let mut total_accounts = 0u64;
        let mut tokens_in_circulation = rust_decimal::Decimal::ZERO;

        let iter = self.db.iterator_cf(cf_accounts, IteratorMode::Start);
        for item in iter {
            let (_, value) = item?;
            let account: Account = bincode::deserialize(&value)?;
            total_accounts += 1;
            tokens_in_circulation += account.balance;
        }

        let total_entries = self
            .db
            .property_int_value_cf(cf_entries, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(LedgerStats {
            total_accounts,
            total_entries,
            tokens_in_circulation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TransactionKind, TransactionSource};
    use crate::Config;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn committed_pair(
        account_id: &AccountId,
        version: u64,
        balance: Decimal,
        amount: Decimal,
    ) -> (Account, LedgerEntry) {
        let now = Utc::now();
        let account = Account {
            id: account_id.clone(),
            balance,
            version,
            created_at: now,
            last_updated: now,
        };
        let entry = LedgerEntry {
            transaction_id: Uuid::new_v4(),
            account_id: account_id.clone(),
            kind: TransactionKind::Earned,
            amount,
            balance_before: balance - amount,
            balance_after: balance,
            sequence: version,
            source: TransactionSource::LevelCompletion,
            source_id: None,
            description: None,
            metadata: HashMap::new(),
            external_reference: None,
            created_at: now,
        };
        (account, entry)
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        assert!(storage.db.cf_handle(CF_ACCOUNTS).is_some());
        assert!(storage.db.cf_handle(CF_ENTRIES).is_some());
        assert!(storage.db.cf_handle(CF_TX_INDEX).is_some());
    }

    #[test]
    fn test_create_and_get_account() {
        let (storage, _temp) = test_storage();
        let account = Account::new(AccountId::new("0xabc"));

        storage.create_account(&account).unwrap();

        let retrieved = storage.get_account(&account.id).unwrap().unwrap();
        assert_eq!(retrieved.id, account.id);
        assert_eq!(retrieved.balance, Decimal::ZERO);
        assert_eq!(retrieved.version, 0);

        // Second create is rejected
        assert!(matches!(
            storage.create_account(&account),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_commit_and_find_entry() {
        let (storage, _temp) = test_storage();
        let account_id = AccountId::new("0xabc");
        let (account, entry) = committed_pair(&account_id, 1, Decimal::new(10000, 2), Decimal::new(10000, 2));

        storage.commit(0, &account, &entry).unwrap();

        let stored = storage.get_account(&account_id).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.balance, Decimal::new(10000, 2));

        let found = storage
            .find_entry(&account_id, entry.transaction_id)
            .unwrap()
            .unwrap();
        assert_eq!(found, entry);
    }

    #[test]
    fn test_commit_version_conflict() {
        let (storage, _temp) = test_storage();
        let account_id = AccountId::new("0xabc");
        let (account, entry) = committed_pair(&account_id, 1, Decimal::new(100, 2), Decimal::new(100, 2));

        storage.commit(0, &account, &entry).unwrap();

        // Stale writer: expected version 0 again
        let (account2, entry2) = committed_pair(&account_id, 1, Decimal::new(200, 2), Decimal::new(100, 2));
        assert!(matches!(
            storage.commit(0, &account2, &entry2),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_commit_duplicate_transaction() {
        let (storage, _temp) = test_storage();
        let account_id = AccountId::new("0xabc");
        let (account, entry) = committed_pair(&account_id, 1, Decimal::new(100, 2), Decimal::new(100, 2));

        storage.commit(0, &account, &entry).unwrap();

        // Same transaction id at the next version
        let (account2, mut entry2) =
            committed_pair(&account_id, 2, Decimal::new(200, 2), Decimal::new(100, 2));
        entry2.transaction_id = entry.transaction_id;
        assert!(matches!(
            storage.commit(1, &account2, &entry2),
            Err(Error::DuplicateTransaction(_))
        ));
    }

    #[test]
    fn test_commit_rejects_negative_balance() {
        let (storage, _temp) = test_storage();
        let account_id = AccountId::new("0xabc");
        let (mut account, mut entry) =
            committed_pair(&account_id, 1, Decimal::new(-100, 2), Decimal::new(100, 2));
        entry.balance_after = Decimal::new(-100, 2);
        account.balance = Decimal::new(-100, 2);

        assert!(matches!(
            storage.commit(0, &account, &entry),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_entries_for_account_in_commit_order() {
        let (storage, _temp) = test_storage();
        let account_id = AccountId::new("0xabc");

        let mut balance = Decimal::ZERO;
        for version in 1..=5u64 {
            let amount = Decimal::new(100 * version as i64, 2);
            balance += amount;
            let (account, entry) = committed_pair(&account_id, version, balance, amount);
            storage.commit(version - 1, &account, &entry).unwrap();
        }

        let entries = storage.entries_for_account(&account_id).unwrap();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
        }

        // A different account with a prefix-sharing id stays isolated
        let other = AccountId::new("0xabcd");
        let (account, entry) = committed_pair(&other, 1, Decimal::new(100, 2), Decimal::new(100, 2));
        storage.commit(0, &account, &entry).unwrap();
        assert_eq!(storage.entries_for_account(&account_id).unwrap().len(), 5);
        assert_eq!(storage.entries_for_account(&other).unwrap().len(), 1);
    }

    #[test]
    fn test_tombstone_blocks_commit_and_create() {
        let (storage, _temp) = test_storage();
        let account_id = AccountId::new("0xabc");
        let (account, entry) = committed_pair(&account_id, 1, Decimal::new(100, 2), Decimal::new(100, 2));
        storage.commit(0, &account, &entry).unwrap();

        storage.tombstone_account(&account_id).unwrap();
        assert!(storage.is_tombstoned(&account_id).unwrap());
        assert!(storage.get_account(&account_id).unwrap().is_none());

        // History survives for audit
        assert_eq!(storage.entries_for_account(&account_id).unwrap().len(), 1);

        // Neither commit nor registration may resurrect it
        let (account2, entry2) = committed_pair(&account_id, 1, Decimal::new(100, 2), Decimal::new(100, 2));
        assert!(matches!(
            storage.commit(0, &account2, &entry2),
            Err(Error::AccountNotFound(_))
        ));
        assert!(matches!(
            storage.create_account(&Account::new(account_id)),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_annotate_external_reference_once() {
        let (storage, _temp) = test_storage();
        let account_id = AccountId::new("0xabc");
        let (account, entry) = committed_pair(&account_id, 1, Decimal::new(100, 2), Decimal::new(100, 2));
        storage.commit(0, &account, &entry).unwrap();

        let annotated = storage
            .annotate_external_reference(&account_id, entry.transaction_id, "0xdeadbeef")
            .unwrap();
        assert_eq!(annotated.external_reference.as_deref(), Some("0xdeadbeef"));
        assert_eq!(annotated.balance_after, entry.balance_after);

        // Second annotation is rejected
        assert!(matches!(
            storage.annotate_external_reference(&account_id, entry.transaction_id, "0xfeed"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_stats() {
        let (storage, _temp) = test_storage();

        for (i, id) in ["0xaaa", "0xbbb", "0xccc"].iter().enumerate() {
            let account_id = AccountId::new(*id);
            let amount = Decimal::new(100 * (i as i64 + 1), 2);
            let (account, entry) = committed_pair(&account_id, 1, amount, amount);
            storage.commit(0, &account, &entry).unwrap();
        }

        let stats = storage.stats().unwrap();
        assert_eq!(stats.total_accounts, 3);
        assert_eq!(stats.tokens_in_circulation, Decimal::new(600, 2));
    }
}
