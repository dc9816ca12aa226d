//! Lifecycle sweepers: expiration and rollover
//!
//! Sweepers run outside the request path but follow the same atomic commit
//! discipline as debits, so a sweep racing a user-facing debit serializes
//! per user: whichever commits first wins and the other re-plans.
//!
//! Per-pool failures are accumulated in the report rather than aborting the
//! sweep, so one bad pool cannot block expiry for everyone else.

use crate::{
    storage::{Commit, CommitResult, PoolWrite},
    types::{LedgerEntry, PoolDeduction, SourceType, TokenPool},
    Result, TokenLedger,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of one expiration sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Pools that matched the expiry scan
    pub scanned: usize,

    /// Pools actually zeroed
    pub expired_pools: usize,

    /// Total tokens written off
    pub tokens_expired: i64,

    /// Per-pool failures; the sweep continued past each one
    pub errors: Vec<SweepError>,
}

/// One pool the sweep could not process
#[derive(Debug)]
pub struct SweepError {
    /// Pool that failed
    pub pool_id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// What went wrong
    pub detail: String,
}

/// Outcome of a rollover at a billing-period boundary
#[derive(Debug)]
pub struct RolloverOutcome {
    /// Tokens carried into the successor pool
    pub carried: i64,

    /// Tokens expired because they exceeded the rollover cap
    pub expired: i64,

    /// The successor pool, when anything was carried
    pub pool: Option<TokenPool>,
}

enum ExpireOne {
    Expired(i64),
    Skipped,
    Failed(String),
}

impl TokenLedger {
    /// Zero every lapsed pool, writing one expiration entry per pool
    ///
    /// Purchased pools never expire and are excluded by the scan. A pool
    /// whose write-off would drive the ledger balance negative is reported
    /// as an anomaly and skipped, never silently corrected.
    pub fn expire_pools(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let candidates = self.storage().expirable_pools(now)?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for pool in candidates {
            match self.expire_pool(pool.id, pool.user_id, now) {
                Ok(ExpireOne::Expired(tokens)) => {
                    report.expired_pools += 1;
                    report.tokens_expired += tokens;
                }
                Ok(ExpireOne::Skipped) => {}
                Ok(ExpireOne::Failed(detail)) => {
                    tracing::warn!(
                        pool_id = %pool.id,
                        user_id = %pool.user_id,
                        detail,
                        "Skipping pool during expiration sweep"
                    );
                    report.errors.push(SweepError {
                        pool_id: pool.id,
                        user_id: pool.user_id,
                        detail,
                    });
                }
                Err(e) => {
                    report.errors.push(SweepError {
                        pool_id: pool.id,
                        user_id: pool.user_id,
                        detail: e.to_string(),
                    });
                }
            }
        }

        self.metrics()
            .record_pools_expired(report.expired_pools, report.tokens_expired);
        tracing::info!(
            scanned = report.scanned,
            expired = report.expired_pools,
            tokens = report.tokens_expired,
            errors = report.errors.len(),
            "Expiration sweep finished"
        );

        Ok(report)
    }

    fn expire_pool(&self, pool_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<ExpireOne> {
        let attempts = self.config().policy.max_commit_retries.max(1);

        for _ in 0..attempts {
            // Re-read fresh: a concurrent debit may have drained the pool
            let pool = match self.storage().get_pool(pool_id)? {
                Some(pool) => pool,
                None => return Ok(ExpireOne::Skipped),
            };
            let lapsed = pool.expires_at.map_or(false, |t| t <= now);
            if pool.remaining == 0 || !lapsed || pool.source_type == SourceType::Purchase {
                return Ok(ExpireOne::Skipped);
            }

            let balance_rec = self.storage().user_balance(user_id)?;
            let balance = balance_rec.as_ref().map_or(0, |b| b.balance);
            let expected_seq = balance_rec.as_ref().map_or(0, |b| b.seq);

            // Cannot happen by construction (remaining is already counted
            // in the balance); report rather than corrupt history.
            if balance < pool.remaining {
                return Ok(ExpireOne::Failed(format!(
                    "Zeroing {} remaining would drive balance {} negative",
                    pool.remaining, balance
                )));
            }

            let written_off = pool.remaining;
            let mut zeroed = pool.clone();
            zeroed.remaining = 0;
            zeroed.updated_at = now;

            let mut metadata = HashMap::new();
            metadata.insert("reason".to_string(), "expired".to_string());

            let entry = LedgerEntry {
                id: Uuid::now_v7(),
                user_id,
                seq: expected_seq + 1,
                amount: -written_off,
                balance_after: balance - written_off,
                source_type: SourceType::Expiration,
                action: "expire".to_string(),
                pool_id: Some(pool.id),
                reference_id: None,
                idempotency_key: None,
                pool_deductions: vec![PoolDeduction {
                    pool_id: pool.id,
                    source_type: pool.source_type,
                    amount: written_off,
                }],
                metadata,
                created_at: now,
            };

            let commit = Commit {
                user_id,
                expected_seq,
                entries: vec![entry],
                pools: vec![PoolWrite {
                    pool: zeroed,
                    expected_remaining: Some(written_off),
                }],
                lifetime_spent_delta: 0,
            };

            match self.storage().commit(&commit)? {
                CommitResult::Committed => return Ok(ExpireOne::Expired(written_off)),
                CommitResult::Conflict => continue,
                CommitResult::Replayed(_) => return Ok(ExpireOne::Skipped),
            }
        }

        Ok(ExpireOne::Failed(format!(
            "Commit kept conflicting after {} attempts",
            attempts
        )))
    }

    /// Carry unused rollover-eligible tokens into a new period
    ///
    /// Sums `remaining` across the user's rollover-eligible live pools,
    /// caps the carried amount at `policy.rollover_cap`, expires the
    /// excess, zeroes the source pools, and credits one successor pool —
    /// all in a single atomic commit that nets to exactly `-excess`.
    pub fn rollover_pools(
        &self,
        user_id: Uuid,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<RolloverOutcome> {
        let cap = self.config().policy.rollover_cap.max(0);
        let attempts = self.config().policy.max_commit_retries.max(1);

        for _ in 0..attempts {
            let (balance_rec, pools) = self.storage().snapshot_user(user_id)?;
            let balance = balance_rec.as_ref().map_or(0, |b| b.balance);
            let expected_seq = balance_rec.as_ref().map_or(0, |b| b.seq);
            let now = Utc::now();

            let mut sources: Vec<&TokenPool> = pools
                .iter()
                .filter(|p| p.is_live(now) && p.rollover_eligible)
                .collect();
            // Drain soonest-expiring first so the carried allocation is stable
            sources.sort_by_key(|p| {
                (
                    p.expires_at.map_or(i64::MAX, |t| t.timestamp_millis()),
                    p.created_at,
                )
            });

            let total: i64 = sources.iter().map(|p| p.remaining).sum();
            if total == 0 {
                return Ok(RolloverOutcome {
                    carried: 0,
                    expired: 0,
                    pool: None,
                });
            }

            let carried = total.min(cap);
            let excess = total - carried;

            // Split each source pool's remaining between the carried and
            // expired portions, in drain order
            let mut carried_left = carried;
            let mut carried_cuts = Vec::new();
            let mut expired_cuts = Vec::new();
            let mut writes = Vec::new();
            for pool in &sources {
                let to_carry = carried_left.min(pool.remaining);
                let to_expire = pool.remaining - to_carry;
                carried_left -= to_carry;

                if to_carry > 0 {
                    carried_cuts.push(PoolDeduction {
                        pool_id: pool.id,
                        source_type: pool.source_type,
                        amount: to_carry,
                    });
                }
                if to_expire > 0 {
                    expired_cuts.push(PoolDeduction {
                        pool_id: pool.id,
                        source_type: pool.source_type,
                        amount: to_expire,
                    });
                }

                let mut zeroed = (*pool).clone();
                zeroed.remaining = 0;
                zeroed.updated_at = now;
                writes.push(PoolWrite {
                    pool: zeroed,
                    expected_remaining: Some(pool.remaining),
                });
            }

            let mut entries = Vec::new();
            let mut seq = expected_seq;
            let mut running = balance;

            if excess > 0 {
                seq += 1;
                running -= excess;
                let mut metadata = HashMap::new();
                metadata.insert("reason".to_string(), "rollover cap exceeded".to_string());
                metadata.insert("cap".to_string(), cap.to_string());
                entries.push(LedgerEntry {
                    id: Uuid::now_v7(),
                    user_id,
                    seq,
                    amount: -excess,
                    balance_after: running,
                    source_type: SourceType::Expiration,
                    action: "expire".to_string(),
                    pool_id: expired_cuts.first().map(|d| d.pool_id),
                    reference_id: None,
                    idempotency_key: None,
                    pool_deductions: expired_cuts.clone(),
                    metadata,
                    created_at: now,
                });
            }

            let mut successor = None;
            if carried > 0 {
                let pool = TokenPool {
                    id: Uuid::now_v7(),
                    user_id,
                    source_type: SourceType::Rollover,
                    amount: carried,
                    remaining: carried,
                    expires_at: new_expiry,
                    rollover_eligible: true,
                    reference_id: None,
                    created_at: now,
                    updated_at: now,
                };

                seq += 1;
                running -= carried;
                entries.push(LedgerEntry {
                    id: Uuid::now_v7(),
                    user_id,
                    seq,
                    amount: -carried,
                    balance_after: running,
                    source_type: SourceType::Rollover,
                    action: "rollover".to_string(),
                    pool_id: carried_cuts.first().map(|d| d.pool_id),
                    reference_id: None,
                    idempotency_key: None,
                    pool_deductions: carried_cuts.clone(),
                    metadata: HashMap::new(),
                    created_at: now,
                });

                seq += 1;
                running += carried;
                entries.push(LedgerEntry {
                    id: Uuid::now_v7(),
                    user_id,
                    seq,
                    amount: carried,
                    balance_after: running,
                    source_type: SourceType::Rollover,
                    action: "rollover".to_string(),
                    pool_id: Some(pool.id),
                    reference_id: None,
                    idempotency_key: None,
                    pool_deductions: vec![],
                    metadata: HashMap::new(),
                    created_at: now,
                });

                writes.push(PoolWrite {
                    pool: pool.clone(),
                    expected_remaining: None,
                });
                successor = Some(pool);
            }

            let commit = Commit {
                user_id,
                expected_seq,
                entries,
                pools: writes,
                lifetime_spent_delta: 0,
            };

            match self.storage().commit(&commit)? {
                CommitResult::Committed => {
                    self.metrics().record_rollover();
                    tracing::info!(
                        user_id = %user_id,
                        carried,
                        expired = excess,
                        "Rollover committed"
                    );
                    return Ok(RolloverOutcome {
                        carried,
                        expired: excess,
                        pool: successor,
                    });
                }
                CommitResult::Conflict => continue,
                CommitResult::Replayed(_) => continue,
            }
        }

        Err(crate::Error::ConcurrencyExhausted { attempts })
    }
}
