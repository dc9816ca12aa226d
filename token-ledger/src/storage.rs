//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `entries` - Append-only ledger log (key: user_id || seq)
//! - `pools` - Token pools (key: pool_id)
//! - `pool_index` - User -> pool index (key: user_id || pool_id)
//! - `balances` - Materialized latest balance per user (key: user_id)
//! - `idempotency` - Dedup keys -> entry key (key: raw key bytes)
//!
//! # Commit protocol
//!
//! Every mutation goes through [`Storage::commit`], which holds a per-user
//! mutex while it re-validates the caller's optimistic reads (idempotency
//! key absent, pool `remaining` values unchanged, latest `seq` unchanged)
//! and then applies one atomic `WriteBatch`. A pool decrement without its
//! matching ledger entry is therefore unreachable, even across crashes.

use crate::{
    error::{Error, Result},
    types::{LedgerEntry, TokenPool, UserBalance},
    Config,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ENTRIES: &str = "entries";
const CF_POOLS: &str = "pools";
const CF_POOL_INDEX: &str = "pool_index";
const CF_BALANCES: &str = "balances";
const CF_IDEMPOTENCY: &str = "idempotency";

/// A pool state to persist as part of a commit
#[derive(Debug, Clone)]
pub struct PoolWrite {
    /// The pool in its post-commit state
    pub pool: TokenPool,

    /// `remaining` observed when the commit was planned; `None` means the
    /// pool is new and must not already exist
    pub expected_remaining: Option<i64>,
}

/// One atomic unit of ledger work: entries appended, pools written
#[derive(Debug, Clone)]
pub struct Commit {
    /// Owning user (all entries and pools must belong to them)
    pub user_id: Uuid,

    /// Latest entry `seq` observed when the commit was planned (0 = none)
    pub expected_seq: u64,

    /// Entries to append, with consecutive `seq` from `expected_seq + 1`
    pub entries: Vec<LedgerEntry>,

    /// Pool states to persist
    pub pools: Vec<PoolWrite>,

    /// Increment to the user's monotone lifetime-spent accumulator
    pub lifetime_spent_delta: i64,
}

/// Outcome of a commit attempt
#[derive(Debug)]
pub enum CommitResult {
    /// The batch was applied
    Committed,

    /// An optimistic expectation no longer held; re-plan and retry
    Conflict,

    /// A concurrent retry with the same idempotency key already committed;
    /// here is its entry
    Replayed(LedgerEntry),
}

/// Storage wrapper for RocksDB
#[derive(Debug)]
pub struct Storage {
    db: Arc<DB>,

    /// Per-user commit locks (serializes the validate-then-write section)
    user_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Universal compaction for the append-heavy entry log
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_POOLS, Self::cf_options_pools()),
            ColumnFamilyDescriptor::new(CF_POOL_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_balances()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_index()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = %path.display(), "Opened RocksDB");

        Ok(Self {
            db: Arc::new(db),
            user_locks: DashMap::new(),
        })
    }

    // Column family options

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_pools() -> Options {
        let mut opts = Options::default();
        // Pools are read on every debit, favor decompression speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_balances() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Key helpers

    fn entry_key(user_id: Uuid, seq: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(user_id.as_bytes());
        key[16..].copy_from_slice(&seq.to_be_bytes());
        key
    }

    fn pool_index_key(user_id: Uuid, pool_id: Uuid) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(user_id.as_bytes());
        key[16..].copy_from_slice(pool_id.as_bytes());
        key
    }

    fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Reads

    /// Materialized balance record for a user, if any entry exists
    pub fn user_balance(&self, user_id: Uuid) -> Result<Option<UserBalance>> {
        let cf = self.cf(CF_BALANCES)?;
        match self.db.get_cf(&cf, user_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Balance record plus every pool for a user, read under the user lock
    /// so the two views are mutually consistent
    pub fn snapshot_user(&self, user_id: Uuid) -> Result<(Option<UserBalance>, Vec<TokenPool>)> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let balance = self.user_balance(user_id)?;
        let pools = self.pools_for_user(user_id)?;
        Ok((balance, pools))
    }

    /// Entry previously committed under this idempotency key, if any
    pub fn entry_by_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        let cf = self.cf(CF_IDEMPOTENCY)?;
        let entry_key = match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let cf_entries = self.cf(CF_ENTRIES)?;
        let value = self.db.get_cf(&cf_entries, &entry_key)?.ok_or_else(|| {
            Error::Storage(format!("Idempotency key {} points at a missing entry", key))
        })?;

        Ok(Some(bincode::deserialize(&value)?))
    }

    /// All ledger entries for a user in creation (seq) order
    pub fn entries_for_user(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf(CF_ENTRIES)?;
        let prefix = user_id.as_bytes();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix.as_slice() {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }

    /// Get pool by ID
    pub fn get_pool(&self, pool_id: Uuid) -> Result<Option<TokenPool>> {
        let cf = self.cf(CF_POOLS)?;
        match self.db.get_cf(&cf, pool_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All pools for a user (live and inert), via the user index
    pub fn pools_for_user(&self, user_id: Uuid) -> Result<Vec<TokenPool>> {
        let cf_index = self.cf(CF_POOL_INDEX)?;
        let prefix = user_id.as_bytes();

        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(prefix, Direction::Forward));

        let mut pools = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.len() < 32 || &key[..16] != prefix.as_slice() {
                break;
            }
            let pool_id_bytes: [u8; 16] = key[16..32]
                .try_into()
                .map_err(|_| Error::Storage("Malformed pool index key".to_string()))?;
            let pool_id = Uuid::from_bytes(pool_id_bytes);

            let pool = self
                .get_pool(pool_id)?
                .ok_or(Error::PoolNotFound(pool_id))?;
            pools.push(pool);
        }

        Ok(pools)
    }

    /// Full scan: pools with tokens left and an expiry at or before `now`
    ///
    /// Purchased pools never expire and are excluded here, not in the sweep.
    pub fn expirable_pools(&self, now: DateTime<Utc>) -> Result<Vec<TokenPool>> {
        let cf = self.cf(CF_POOLS)?;
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);

        let mut pools = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let pool: TokenPool = bincode::deserialize(&value)?;
            let lapsed = pool.expires_at.map_or(false, |t| t <= now);
            if pool.remaining > 0
                && lapsed
                && pool.source_type != crate::types::SourceType::Purchase
            {
                pools.push(pool);
            }
        }

        Ok(pools)
    }

    // Commit

    /// Validate and apply one atomic unit of ledger work
    ///
    /// Holds the user's commit lock across validation and the batched write.
    /// Returns [`CommitResult::Conflict`] when any optimistic expectation no
    /// longer holds, and [`CommitResult::Replayed`] when an idempotency key
    /// in the commit already won a concurrent race.
    pub fn commit(&self, commit: &Commit) -> Result<CommitResult> {
        let lock = self.user_lock(commit.user_id);
        let _guard = lock.lock();

        // Idempotency: a concurrent identical retry may have landed first
        for entry in &commit.entries {
            if let Some(key) = &entry.idempotency_key {
                if let Some(existing) = self.entry_by_key(key)? {
                    return Ok(CommitResult::Replayed(existing));
                }
            }
        }

        // Sequence: the planned read must still be the latest entry
        let current = self.user_balance(commit.user_id)?;
        let current_seq = current.as_ref().map_or(0, |b| b.seq);
        if current_seq != commit.expected_seq {
            return Ok(CommitResult::Conflict);
        }

        // Pools: conditional update, only if `remaining` is unchanged
        for write in &commit.pools {
            let stored = self.get_pool(write.pool.id)?;
            match (write.expected_remaining, stored) {
                (Some(expected), Some(stored)) => {
                    if stored.remaining != expected {
                        return Ok(CommitResult::Conflict);
                    }
                }
                (Some(_), None) => return Ok(CommitResult::Conflict),
                (None, Some(_)) => return Ok(CommitResult::Conflict),
                (None, None) => {}
            }
        }

        // Balance continuity across the appended entries
        let mut running = current.as_ref().map_or(0, |b| b.balance);
        let mut seq = current_seq;
        for entry in &commit.entries {
            seq += 1;
            running += entry.amount;
            if entry.seq != seq || entry.balance_after != running || entry.balance_after < 0 {
                return Err(Error::LedgerInconsistency {
                    user_id: commit.user_id,
                    detail: format!(
                        "Entry seq {} breaks the balance chain (amount {}, balance_after {})",
                        entry.seq, entry.amount, entry.balance_after
                    ),
                });
            }
        }

        let last = match commit.entries.last() {
            Some(entry) => entry,
            None => return Ok(CommitResult::Committed),
        };

        let mut batch = WriteBatch::default();

        let cf_pools = self.cf(CF_POOLS)?;
        let cf_index = self.cf(CF_POOL_INDEX)?;
        for write in &commit.pools {
            let value = bincode::serialize(&write.pool)?;
            batch.put_cf(&cf_pools, write.pool.id.as_bytes(), &value);
            if write.expected_remaining.is_none() {
                let idx = Self::pool_index_key(commit.user_id, write.pool.id);
                batch.put_cf(&cf_index, idx, b"");
            }
        }

        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_keys = self.cf(CF_IDEMPOTENCY)?;
        for entry in &commit.entries {
            let key = Self::entry_key(commit.user_id, entry.seq);
            let value = bincode::serialize(entry)?;
            batch.put_cf(&cf_entries, key, &value);

            if let Some(idem) = &entry.idempotency_key {
                batch.put_cf(&cf_keys, idem.as_bytes(), key);
            }
        }

        let balance = UserBalance {
            seq: last.seq,
            balance: last.balance_after,
            lifetime_spent: current.as_ref().map_or(0, |b| b.lifetime_spent)
                + commit.lifetime_spent_delta,
            updated_at: last.created_at,
        };
        let cf_balances = self.cf(CF_BALANCES)?;
        batch.put_cf(&cf_balances, commit.user_id.as_bytes(), bincode::serialize(&balance)?);

        self.db.write(batch)?;

        tracing::debug!(
            user_id = %commit.user_id,
            entries = commit.entries.len(),
            pools = commit.pools.len(),
            balance = balance.balance,
            "Commit applied"
        );

        Ok(CommitResult::Committed)
    }
}
