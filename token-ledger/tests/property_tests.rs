//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify the critical invariants:
//! - Balance reconstruction: balance == Σ entry amounts == Σ live pool remaining
//! - Non-negativity: no sequence of valid operations overdraws a balance
//! - Idempotency: one ledger entry per key, no matter how often it is retried

use chrono::{Duration, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use token_ledger::{
    Config, CreditOptions, DebitOptions, Error, SourceType, TokenLedger,
};
use uuid::Uuid;

/// Actions priced by the default policy, cheapest first
const ACTIONS: [&str; 4] = ["chat_message", "voice_message", "image_generate", "personality_evolve"];

#[derive(Debug, Clone)]
enum Op {
    Credit {
        amount: i64,
        source: SourceType,
        expires_in_days: Option<i64>,
        rollover_eligible: bool,
    },
    Debit {
        action: &'static str,
    },
}

fn source_strategy() -> impl Strategy<Value = SourceType> {
    prop_oneof![
        Just(SourceType::Free),
        Just(SourceType::Subscription),
        Just(SourceType::Purchase),
        Just(SourceType::Admin),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (
            1i64..200,
            source_strategy(),
            prop::option::of(1i64..30),
            any::<bool>(),
        )
            .prop_map(|(amount, source, expires_in_days, rollover_eligible)| Op::Credit {
                amount,
                source,
                expires_in_days,
                rollover_eligible,
            }),
        prop::sample::select(&ACTIONS[..]).prop_map(|action| Op::Debit { action }),
    ]
}

fn test_ledger() -> (TokenLedger, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    (TokenLedger::open(config).unwrap(), temp_dir)
}

fn apply_op(ledger: &TokenLedger, user: Uuid, op: &Op) {
    let now = Utc::now();
    match op {
        Op::Credit {
            amount,
            source,
            expires_in_days,
            rollover_eligible,
        } => {
            ledger
                .credit(
                    user,
                    *amount,
                    *source,
                    CreditOptions {
                        expires_at: expires_in_days.map(|d| now + Duration::days(d)),
                        rollover_eligible: *rollover_eligible,
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        Op::Debit { action } => match ledger.debit(user, action, DebitOptions::default()) {
            Ok(_) => {}
            Err(Error::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected debit error: {}", e),
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: the ledger, the materialized balance, and the pool totals
    /// always agree, and the entry chain reconstructs exactly
    #[test]
    fn prop_balance_reconstruction(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (ledger, _temp) = test_ledger();
        let user = Uuid::now_v7();

        for op in &ops {
            apply_op(&ledger, user, op);
        }

        let balance = ledger.get_balance(user).unwrap();
        let history = ledger.history(user).unwrap();

        // Ledger sum equals the materialized balance
        let ledger_sum: i64 = history.iter().map(|e| e.amount).sum();
        prop_assert_eq!(ledger_sum, balance);

        // The chain reconstructs entry by entry
        let mut running = 0i64;
        for entry in &history {
            running += entry.amount;
            prop_assert_eq!(entry.balance_after, running);
        }

        // Live pool totals equal the balance (no pool lapses mid-test;
        // all generated expiries are in the future)
        let now = Utc::now();
        let pool_sum: i64 = ledger
            .pools(user)
            .unwrap()
            .iter()
            .filter(|p| p.is_live(now))
            .map(|p| p.remaining)
            .sum();
        prop_assert_eq!(pool_sum, balance);
    }

    /// Property: no sequence of valid operations produces a negative
    /// `balance_after`, and pools never hold more than they were granted
    #[test]
    fn prop_non_negativity(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (ledger, _temp) = test_ledger();
        let user = Uuid::now_v7();

        for op in &ops {
            apply_op(&ledger, user, op);
        }

        for entry in ledger.history(user).unwrap() {
            prop_assert!(entry.balance_after >= 0);
        }
        for pool in ledger.pools(user).unwrap() {
            prop_assert!(pool.remaining >= 0);
            prop_assert!(pool.remaining <= pool.amount);
        }
    }

    /// Property: lifetime spend is exactly the sum of committed debit costs
    #[test]
    fn prop_lifetime_spent_accumulates(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (ledger, _temp) = test_ledger();
        let user = Uuid::now_v7();

        for op in &ops {
            apply_op(&ledger, user, op);
        }

        let debited: i64 = ledger
            .history(user)
            .unwrap()
            .iter()
            .filter(|e| e.amount < 0)
            .map(|e| -e.amount)
            .sum();
        prop_assert_eq!(ledger.lifetime_spent(user).unwrap(), debited);
    }

    /// Property: N retries under one idempotency key charge exactly once
    #[test]
    fn prop_idempotent_retries(retries in 2usize..8) {
        let (ledger, _temp) = test_ledger();
        let user = Uuid::now_v7();

        ledger
            .credit(user, 50, SourceType::Free, CreditOptions::default())
            .unwrap();

        let opts = DebitOptions {
            idempotency_key: Some("retry-me".to_string()),
            ..Default::default()
        };

        let first = ledger.debit(user, "image_generate", opts.clone()).unwrap();
        for _ in 0..retries {
            let replay = ledger.debit(user, "image_generate", opts.clone()).unwrap();
            prop_assert!(replay.idempotent);
            prop_assert_eq!(replay.entry.id, first.entry.id);
        }

        prop_assert_eq!(ledger.get_balance(user).unwrap(), 45);
        let keyed = ledger
            .history(user)
            .unwrap()
            .iter()
            .filter(|e| e.idempotency_key.as_deref() == Some("retry-me"))
            .count();
        prop_assert_eq!(keyed, 1);
    }
}

mod integration_tests {
    use super::*;

    /// The concrete scenario from the design: 100 one-token chat messages
    /// against a 100-token grant, then a rejected 101st
    #[test]
    fn test_hundred_chat_messages_then_rejection() {
        let (ledger, _temp) = test_ledger();
        let user = Uuid::now_v7();

        assert_eq!(ledger.get_balance(user).unwrap(), 0);

        ledger
            .credit(user, 100, SourceType::Free, CreditOptions::default())
            .unwrap();
        assert_eq!(ledger.get_balance(user).unwrap(), 100);

        for i in 0..100 {
            let receipt = ledger
                .debit(
                    user,
                    "chat_message",
                    DebitOptions {
                        reference_id: Some(format!("msg-{}", i)),
                        ..Default::default()
                    },
                )
                .unwrap();
            assert!(!receipt.idempotent);
            assert_eq!(receipt.new_balance, 99 - i);
        }

        assert_eq!(ledger.get_balance(user).unwrap(), 0);
        // 1 credit + 100 debits
        assert_eq!(ledger.history(user).unwrap().len(), 101);

        let result = ledger.debit(
            user,
            "chat_message",
            DebitOptions {
                reference_id: Some("msg-100".to_string()),
                ..Default::default()
            },
        );
        match result {
            Err(Error::InsufficientBalance { shortfall, .. }) => assert_eq!(shortfall, 1),
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
        assert_eq!(ledger.history(user).unwrap().len(), 101);
        assert_eq!(ledger.lifetime_spent(user).unwrap(), 100);
    }

    /// Concurrent identical retries: one entry, every caller gets it back
    #[test]
    fn test_concurrent_idempotent_debits() {
        let (ledger, _temp) = test_ledger();
        let ledger = Arc::new(ledger);
        let user = Uuid::now_v7();

        ledger
            .credit(user, 100, SourceType::Free, CreditOptions::default())
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                ledger.debit(
                    user,
                    "personality_evolve",
                    DebitOptions {
                        idempotency_key: Some("evolve-once".to_string()),
                        ..Default::default()
                    },
                )
            }));
        }

        let receipts: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let entry_id = receipts[0].entry.id;
        assert!(receipts.iter().all(|r| r.entry.id == entry_id));
        assert_eq!(receipts.iter().filter(|r| !r.idempotent).count(), 1);

        // Charged exactly once
        assert_eq!(ledger.get_balance(user).unwrap(), 90);
        assert_eq!(ledger.history(user).unwrap().len(), 2);
    }

    /// Concurrent distinct debits never lose an update or overdraw
    #[test]
    fn test_concurrent_distinct_debits() {
        let (ledger, _temp) = test_ledger();
        let ledger = Arc::new(ledger);
        let user = Uuid::now_v7();

        ledger
            .credit(user, 40, SourceType::Free, CreditOptions::default())
            .unwrap();

        let mut handles = Vec::new();
        for t in 0..4 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                let mut committed = 0i64;
                for i in 0..10 {
                    let result = ledger.debit(
                        user,
                        "chat_message",
                        DebitOptions {
                            reference_id: Some(format!("t{}-m{}", t, i)),
                            ..Default::default()
                        },
                    );
                    match result {
                        Ok(receipt) => {
                            assert!(receipt.new_balance >= 0);
                            committed += 1;
                        }
                        Err(Error::InsufficientBalance { .. }) => {}
                        Err(Error::ConcurrencyExhausted { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                committed
            }));
        }

        let committed: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let balance = ledger.get_balance(user).unwrap();
        assert_eq!(balance, 40 - committed);
        assert!(balance >= 0);

        // The entry chain stayed consistent under contention
        let history = ledger.history(user).unwrap();
        let mut running = 0i64;
        for entry in &history {
            running += entry.amount;
            assert_eq!(entry.balance_after, running);
            assert!(entry.balance_after >= 0);
        }
    }

    /// A debit racing the expiration sweep resolves to one winner per pool
    #[test]
    fn test_debit_races_expiration_sweep() {
        let (ledger, _temp) = test_ledger();
        let ledger = Arc::new(ledger);
        let user = Uuid::now_v7();
        let now = Utc::now();

        // One lapsed pool and one healthy pool
        ledger
            .credit(
                user,
                10,
                SourceType::Subscription,
                CreditOptions {
                    expires_at: Some(now - Duration::minutes(1)),
                    ..Default::default()
                },
            )
            .unwrap();
        ledger
            .credit(user, 10, SourceType::Purchase, CreditOptions::default())
            .unwrap();

        let sweeper = {
            let ledger = ledger.clone();
            std::thread::spawn(move || ledger.expire_pools(Utc::now()).unwrap())
        };
        let debiter = {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                ledger.debit(user, "voice_message", DebitOptions::default())
            })
        };

        let report = sweeper.join().unwrap();
        let debit = debiter.join().unwrap().unwrap();

        assert_eq!(report.expired_pools, 1);
        assert_eq!(report.tokens_expired, 10);

        // 20 granted, 10 expired, 3 spent from the purchase pool
        assert_eq!(debit.new_balance, ledger.get_balance(user).unwrap());
        assert_eq!(ledger.get_balance(user).unwrap(), 7);

        let history = ledger.history(user).unwrap();
        let mut running = 0i64;
        for entry in &history {
            running += entry.amount;
            assert_eq!(entry.balance_after, running);
        }
    }
}
