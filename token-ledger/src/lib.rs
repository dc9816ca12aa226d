//! Token ledger core
//!
//! Multi-pool balance accounting for a token-based usage economy: every
//! grant of tokens is its own pool with an expiry and rollover flag, every
//! balance change is an immutable ledger entry, and the current balance is
//! always the `balance_after` of the latest entry.
//!
//! # Architecture
//!
//! - **Append-only ledger**: entries are never modified or deleted
//! - **Pooled grants**: debits drain pools in policy priority order
//! - **Optimistic commits**: conditional pool decrements with bounded retry
//! - **Idempotency**: at most one entry per deduplication key, forever
//!
//! # Invariants
//!
//! - `balance_after` chains exactly: each entry's balance equals the
//!   previous balance plus its signed amount, and is never negative
//! - A user's balance always equals the sum of `remaining` across their
//!   live pools; detected drift is fatal, never silently repaired
//! - A pool's `remaining` stays within `0..=amount`
//! - `lifetime_spent` only grows

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
pub mod scheduler;
pub mod storage;
pub mod sweep;
pub mod types;

// Re-exports
pub use config::{Config, PolicyConfig, RocksDbConfig, SweepConfig};
pub use engine::TokenLedger;
pub use error::{Error, Result};
pub use scheduler::{spawn_sweep_scheduler, SweepHandle};
pub use sweep::{RolloverOutcome, SweepError, SweepReport};
pub use types::{
    BalanceCheck, CreditOptions, CreditReceipt, DebitOptions, DebitReceipt, LedgerEntry,
    PoolDeduction, SourceType, TokenPool, UserBalance,
};
