//! Core types for the token ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (i64 token counts, no floats)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Origin of a token grant or balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Free allowance (signup bonus, promotions)
    Free,
    /// Subscription-period allowance
    Subscription,
    /// Purchased token pack (never expires)
    Purchase,
    /// Administrative grant or revocation
    Admin,
    /// Tokens carried over from a previous billing period
    Rollover,
    /// Expiry write-off (ledger entries only, never a pool source)
    Expiration,
}

impl SourceType {
    /// Stable string form (used in derived idempotency keys)
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Free => "free",
            SourceType::Subscription => "subscription",
            SourceType::Purchase => "purchase",
            SourceType::Admin => "admin",
            SourceType::Rollover => "rollover",
            SourceType::Expiration => "expiration",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(SourceType::Free),
            "subscription" => Some(SourceType::Subscription),
            "purchase" => Some(SourceType::Purchase),
            "admin" => Some(SourceType::Admin),
            "rollover" => Some(SourceType::Rollover),
            "expiration" => Some(SourceType::Expiration),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable, signed record of a balance change
///
/// Entries are append-only: never updated, never deleted. For a fixed user,
/// `seq` is a gapless monotone sequence and each `balance_after` equals the
/// previous entry's `balance_after` plus this entry's `amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Per-user sequence number (1-based, gapless)
    pub seq: u64,

    /// Signed token delta (positive = credit, negative = debit)
    pub amount: i64,

    /// Running balance after applying this entry (never negative)
    pub balance_after: i64,

    /// Where the tokens came from / went
    pub source_type: SourceType,

    /// Action tag, e.g. "chat_message", "grant", "expire", "rollover"
    pub action: String,

    /// Primary pool touched by this entry
    pub pool_id: Option<Uuid>,

    /// External correlation id (chat message id, subscription id, admin id)
    pub reference_id: Option<String>,

    /// Deduplication key (unique across all entries when present)
    pub idempotency_key: Option<String>,

    /// Per-pool deduction breakdown for multi-pool debits
    #[serde(default)]
    pub pool_deductions: Vec<PoolDeduction>,

    /// Free-form side data (e.g. admin "reason")
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Entry creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Amount taken from one pool as part of a debit or sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDeduction {
    /// Pool the tokens were taken from
    pub pool_id: Uuid,
    /// Source type of that pool
    pub source_type: SourceType,
    /// Tokens taken (always positive)
    pub amount: i64,
}

/// One discrete grant of tokens with its own remaining quantity and expiry
///
/// Pools are created by credits, drained by debits and sweeps, and never
/// deleted. Invariant: `0 <= remaining <= amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPool {
    /// Unique pool ID (UUIDv7)
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Grant origin (never `Expiration`)
    pub source_type: SourceType,

    /// Original grant size (fixed at creation)
    pub amount: i64,

    /// Tokens still available in this pool
    pub remaining: i64,

    /// Expiry instant; `None` means the pool never expires
    pub expires_at: Option<DateTime<Utc>>,

    /// Whether unused tokens carry into the next billing period
    pub rollover_eligible: bool,

    /// External correlation id for the grant
    pub reference_id: Option<String>,

    /// Pool creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl TokenPool {
    /// True when the pool still holds tokens and has not lapsed
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.remaining > 0 && self.expires_at.map_or(true, |t| t > now)
    }

    /// True once every token has been consumed or written off
    pub fn is_depleted(&self) -> bool {
        self.remaining == 0
    }
}

/// Materialized latest-entry record per user
///
/// Updated in the same atomic batch as every entry append, so reading the
/// current balance is a single point lookup rather than a log scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalance {
    /// Sequence number of the latest entry
    pub seq: u64,

    /// `balance_after` of the latest entry
    pub balance: i64,

    /// Monotone accumulator of all debit costs (independent of balance)
    pub lifetime_spent: i64,

    /// Timestamp of the latest entry
    pub updated_at: DateTime<Utc>,
}

/// Result of a successful debit
#[derive(Debug, Clone)]
pub struct DebitReceipt {
    /// The ledger entry recording this debit
    pub entry: LedgerEntry,
    /// Balance after the debit
    pub new_balance: i64,
    /// True when this call replayed a previously committed operation
    pub idempotent: bool,
}

/// Result of a successful credit
#[derive(Debug, Clone)]
pub struct CreditReceipt {
    /// The pool created by this grant
    pub pool: TokenPool,
    /// The ledger entry recording this credit
    pub entry: LedgerEntry,
    /// Balance after the credit
    pub new_balance: i64,
    /// True when this call replayed a previously committed operation
    pub idempotent: bool,
}

/// Read-only affordability check
#[derive(Debug, Clone, Copy)]
pub struct BalanceCheck {
    /// Whether the balance covers the action's cost
    pub can_afford: bool,
    /// Current balance
    pub balance: i64,
    /// Cost of the action
    pub cost: i64,
    /// Tokens missing when unaffordable, 0 otherwise
    pub shortfall: i64,
}

/// Optional parameters for [`debit`](crate::TokenLedger::debit)
#[derive(Debug, Clone, Default)]
pub struct DebitOptions {
    /// External correlation id; also feeds the derived idempotency key
    pub reference_id: Option<String>,
    /// Explicit deduplication key (wins over the derived key)
    pub idempotency_key: Option<String>,
    /// Free-form side data carried on the entry
    pub metadata: HashMap<String, String>,
}

/// Optional parameters for [`credit`](crate::TokenLedger::credit)
#[derive(Debug, Clone, Default)]
pub struct CreditOptions {
    /// Expiry for the new pool; `None` means it never expires
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether unused tokens carry into the next billing period
    pub rollover_eligible: bool,
    /// External correlation id; also feeds the derived idempotency key
    pub reference_id: Option<String>,
    /// Explicit deduplication key (wins over the derived key)
    pub idempotency_key: Option<String>,
    /// Action tag for the entry (defaults to "grant")
    pub action: Option<String>,
    /// Free-form side data carried on the entry
    pub metadata: HashMap<String, String>,
}
