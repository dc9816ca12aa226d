//! Balance accounting engine
//!
//! This module ties together storage, policy, and metrics into the
//! four-operation surface consumers depend on: `get_balance`,
//! `check_balance`, `debit`, `credit` (sweepers live in [`crate::sweep`]).
//!
//! # Example
//!
//! ```no_run
//! use token_ledger::{Config, CreditOptions, DebitOptions, SourceType, TokenLedger};
//! use uuid::Uuid;
//!
//! fn main() -> token_ledger::Result<()> {
//!     let ledger = TokenLedger::open(Config::default())?;
//!     let user = Uuid::now_v7();
//!
//!     ledger.credit(user, 100, SourceType::Free, CreditOptions::default())?;
//!     let receipt = ledger.debit(user, "chat_message", DebitOptions::default())?;
//!     assert_eq!(receipt.new_balance, 99);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    metrics::Metrics,
    storage::{Commit, CommitResult, PoolWrite, Storage},
    types::{
        BalanceCheck, CreditOptions, CreditReceipt, DebitOptions, DebitReceipt, LedgerEntry,
        PoolDeduction, SourceType, TokenPool,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Main ledger interface
#[derive(Debug)]
pub struct TokenLedger {
    /// Storage backend
    storage: Arc<Storage>,

    /// Configuration (policy drives costs, priorities, retry bounds)
    config: Config,

    /// Prometheus metrics
    metrics: Metrics,
}

impl TokenLedger {
    /// Open the ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()?;

        Ok(Self {
            storage,
            config,
            metrics,
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prometheus metrics handle
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Storage handle (for sweepers and tests)
    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Current balance: the `balance_after` of the user's latest entry
    ///
    /// A single point lookup on the materialized balance record, never a
    /// pool summation or log scan. 0 when the user has no entries.
    pub fn get_balance(&self, user_id: Uuid) -> Result<i64> {
        Ok(self
            .storage
            .user_balance(user_id)?
            .map_or(0, |b| b.balance))
    }

    /// Monotone total of all debit costs ever charged to the user
    pub fn lifetime_spent(&self, user_id: Uuid) -> Result<i64> {
        Ok(self
            .storage
            .user_balance(user_id)?
            .map_or(0, |b| b.lifetime_spent))
    }

    /// Read-only affordability check; never mutates state
    pub fn check_balance(&self, user_id: Uuid, action: &str) -> Result<BalanceCheck> {
        let cost = self
            .config
            .policy
            .cost_of(action)
            .ok_or_else(|| Error::UnknownAction(action.to_string()))?;
        let balance = self.get_balance(user_id)?;

        Ok(BalanceCheck {
            can_afford: balance >= cost,
            balance,
            cost,
            shortfall: (cost - balance).max(0),
        })
    }

    /// Full ledger history for a user in creation order (audit display)
    pub fn history(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_for_user(user_id)
    }

    /// All pools for a user, live and inert
    pub fn pools(&self, user_id: Uuid) -> Result<Vec<TokenPool>> {
        self.storage.pools_for_user(user_id)
    }

    /// Charge a user for an action
    ///
    /// Consumes pools in policy priority order (soonest expiry first within
    /// a source type), appends one debit entry with the per-pool breakdown,
    /// and is safe to retry indefinitely under the same idempotency key.
    pub fn debit(&self, user_id: Uuid, action: &str, opts: DebitOptions) -> Result<DebitReceipt> {
        let timer = std::time::Instant::now();

        let cost = self
            .config
            .policy
            .cost_of(action)
            .ok_or_else(|| Error::UnknownAction(action.to_string()))?;
        if cost <= 0 {
            return Err(Error::InvalidAmount(cost));
        }

        let key = Self::resolve_key(&opts.idempotency_key, user_id, action, &opts.reference_id);
        if let Some(key) = &key {
            if let Some(entry) = self.storage.entry_by_key(key)? {
                self.metrics.record_replay();
                return Ok(Self::debit_replay(entry));
            }
        }

        let attempts = self.config.policy.max_commit_retries.max(1);
        for _ in 0..attempts {
            let (balance_rec, pools) = self.storage.snapshot_user(user_id)?;
            let balance = balance_rec.as_ref().map_or(0, |b| b.balance);
            let expected_seq = balance_rec.as_ref().map_or(0, |b| b.seq);

            if balance < cost {
                self.metrics.record_rejection();
                return Err(Error::InsufficientBalance {
                    required: cost,
                    balance,
                    shortfall: cost - balance,
                });
            }

            let now = Utc::now();
            let plan = self.plan_deductions(&pools, cost, now);
            let (writes, deductions) = match plan {
                Some(plan) => plan,
                None => {
                    // Ledger says the user can afford this but the pools
                    // cannot cover it. Fatal drift; surface, never repair.
                    self.metrics.record_inconsistency();
                    tracing::error!(
                        user_id = %user_id,
                        balance,
                        cost,
                        "Pool totals do not cover the ledger balance"
                    );
                    return Err(Error::LedgerInconsistency {
                        user_id,
                        detail: format!(
                            "Live pools cannot cover a debit of {} against balance {}",
                            cost, balance
                        ),
                    });
                }
            };

            let entry = LedgerEntry {
                id: Uuid::now_v7(),
                user_id,
                seq: expected_seq + 1,
                amount: -cost,
                balance_after: balance - cost,
                source_type: deductions[0].source_type,
                action: action.to_string(),
                pool_id: Some(deductions[0].pool_id),
                reference_id: opts.reference_id.clone(),
                idempotency_key: key.clone(),
                pool_deductions: deductions,
                metadata: opts.metadata.clone(),
                created_at: now,
            };

            let commit = Commit {
                user_id,
                expected_seq,
                entries: vec![entry.clone()],
                pools: writes,
                lifetime_spent_delta: cost,
            };

            match self.storage.commit(&commit)? {
                CommitResult::Committed => {
                    self.metrics.record_debit(timer.elapsed().as_secs_f64());
                    tracing::debug!(
                        user_id = %user_id,
                        action,
                        cost,
                        balance_after = entry.balance_after,
                        "Debit committed"
                    );
                    return Ok(DebitReceipt {
                        new_balance: entry.balance_after,
                        entry,
                        idempotent: false,
                    });
                }
                CommitResult::Replayed(existing) => {
                    self.metrics.record_replay();
                    return Ok(Self::debit_replay(existing));
                }
                CommitResult::Conflict => {
                    self.metrics.record_conflict();
                    continue;
                }
            }
        }

        Err(Error::ConcurrencyExhausted { attempts })
    }

    /// Grant tokens to a user as a fresh pool
    ///
    /// Grants never merge into existing pools; each one stays a traceable
    /// unit with its own expiry and rollover flag.
    pub fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        source_type: SourceType,
        opts: CreditOptions,
    ) -> Result<CreditReceipt> {
        if amount <= 0 {
            return Err(Error::InvalidAmount(amount));
        }

        let action = opts.action.clone().unwrap_or_else(|| "grant".to_string());
        let key = Self::resolve_key(
            &opts.idempotency_key,
            user_id,
            source_type.as_str(),
            &opts.reference_id,
        );
        if let Some(key) = &key {
            if let Some(entry) = self.storage.entry_by_key(key)? {
                self.metrics.record_replay();
                return self.credit_replay(entry);
            }
        }

        let attempts = self.config.policy.max_commit_retries.max(1);
        for _ in 0..attempts {
            let balance_rec = self.storage.user_balance(user_id)?;
            let balance = balance_rec.as_ref().map_or(0, |b| b.balance);
            let expected_seq = balance_rec.as_ref().map_or(0, |b| b.seq);

            let now = Utc::now();
            let pool = TokenPool {
                id: Uuid::now_v7(),
                user_id,
                source_type,
                amount,
                remaining: amount,
                expires_at: opts.expires_at,
                rollover_eligible: opts.rollover_eligible,
                reference_id: opts.reference_id.clone(),
                created_at: now,
                updated_at: now,
            };

            let entry = LedgerEntry {
                id: Uuid::now_v7(),
                user_id,
                seq: expected_seq + 1,
                amount,
                balance_after: balance + amount,
                source_type,
                action: action.clone(),
                pool_id: Some(pool.id),
                reference_id: opts.reference_id.clone(),
                idempotency_key: key.clone(),
                pool_deductions: vec![],
                metadata: opts.metadata.clone(),
                created_at: now,
            };

            let commit = Commit {
                user_id,
                expected_seq,
                entries: vec![entry.clone()],
                pools: vec![PoolWrite {
                    pool: pool.clone(),
                    expected_remaining: None,
                }],
                lifetime_spent_delta: 0,
            };

            match self.storage.commit(&commit)? {
                CommitResult::Committed => {
                    self.metrics.record_credit();
                    tracing::debug!(
                        user_id = %user_id,
                        amount,
                        source = %source_type,
                        pool_id = %pool.id,
                        "Credit committed"
                    );
                    return Ok(CreditReceipt {
                        new_balance: entry.balance_after,
                        pool,
                        entry,
                        idempotent: false,
                    });
                }
                CommitResult::Replayed(existing) => {
                    self.metrics.record_replay();
                    return self.credit_replay(existing);
                }
                CommitResult::Conflict => {
                    self.metrics.record_conflict();
                    continue;
                }
            }
        }

        Err(Error::ConcurrencyExhausted { attempts })
    }

    // Helpers

    /// Explicit key wins; otherwise derive one from the reference id.
    /// Without either there is nothing stable to dedup on.
    fn resolve_key(
        explicit: &Option<String>,
        user_id: Uuid,
        action: &str,
        reference_id: &Option<String>,
    ) -> Option<String> {
        if let Some(key) = explicit {
            return Some(key.clone());
        }
        reference_id
            .as_ref()
            .map(|r| format!("{}:{}:{}", user_id, action, r))
    }

    /// Order live pools and walk them until the cost is covered.
    /// Returns `None` when the live pools cannot cover the cost.
    fn plan_deductions(
        &self,
        pools: &[TokenPool],
        cost: i64,
        now: DateTime<Utc>,
    ) -> Option<(Vec<PoolWrite>, Vec<PoolDeduction>)> {
        let mut live: Vec<&TokenPool> = pools.iter().filter(|p| p.is_live(now)).collect();
        live.sort_by_key(|p| {
            (
                self.config.policy.priority_of(p.source_type),
                // Soonest expiry first; never-expiring pools last
                p.expires_at.map_or(i64::MAX, |t| t.timestamp_millis()),
                p.created_at,
            )
        });

        let mut needed = cost;
        let mut writes = Vec::new();
        let mut deductions = Vec::new();

        for pool in live {
            if needed == 0 {
                break;
            }
            let take = needed.min(pool.remaining);
            let mut updated = pool.clone();
            updated.remaining -= take;
            updated.updated_at = now;

            writes.push(PoolWrite {
                pool: updated,
                expected_remaining: Some(pool.remaining),
            });
            deductions.push(PoolDeduction {
                pool_id: pool.id,
                source_type: pool.source_type,
                amount: take,
            });
            needed -= take;
        }

        if needed > 0 {
            return None;
        }
        Some((writes, deductions))
    }

    fn debit_replay(entry: LedgerEntry) -> DebitReceipt {
        DebitReceipt {
            new_balance: entry.balance_after,
            entry,
            idempotent: true,
        }
    }

    fn credit_replay(&self, entry: LedgerEntry) -> Result<CreditReceipt> {
        let pool_id = entry.pool_id.ok_or_else(|| Error::Storage(
            "Credit entry has no pool reference".to_string(),
        ))?;
        let pool = self
            .storage
            .get_pool(pool_id)?
            .ok_or(Error::PoolNotFound(pool_id))?;

        Ok(CreditReceipt {
            new_balance: entry.balance_after,
            pool,
            entry,
            idempotent: true,
        })
    }
}
