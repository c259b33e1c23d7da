//! Integration Tests for the Transfer Coordinator
//!
//! Concurrency scenarios against the in-memory ledger. Each test runs on a
//! multi-threaded runtime so unit-of-work interleavings are real.

use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{OutboxConfig, TransferConfig};
use crate::ledger::{
    Currency, CustomerIdentity, InMemoryLedgerStore, LedgerStore, TransactionStatus, UnitOfWork,
};
use crate::transfer::{TransferCoordinator, TransferError, TransferOutcome, TransferRequest};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Helper owning a seeded ledger and a coordinator over it
struct TestHarness {
    store: InMemoryLedgerStore,
    coordinator: TransferCoordinator,
    accounts: Vec<String>,
}

impl TestHarness {
    fn new(balances: &[&str]) -> Self {
        let store = InMemoryLedgerStore::new();
        let ils = Currency::new("ILS").unwrap();
        let mut accounts = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            let customer = store
                .create_customer(
                    &format!("Customer {}", i),
                    CustomerIdentity::Individual {
                        personal_id: format!("30000000{}", i),
                    },
                    None,
                )
                .unwrap();
            let number = format!("ACC-{}", 1000 + i);
            store
                .open_account(customer.id, &number, ils.clone(), dec(balance))
                .unwrap();
            accounts.push(number);
        }
        let coordinator = TransferCoordinator::new(
            Arc::new(store.clone()),
            TransferConfig::default(),
            &OutboxConfig::default(),
        );
        Self {
            store,
            coordinator,
            accounts,
        }
    }

    fn total(&self) -> Decimal {
        self.accounts
            .iter()
            .map(|a| self.store.balance_of(a).unwrap())
            .sum()
    }

    fn request(&self, from: usize, to: usize, amount: &str) -> TransferRequest {
        TransferRequest::new(&self.accounts[from], &self.accounts[to], dec(amount), "ILS")
    }
}

// ========================================================================
// Double spend
// ========================================================================

/// Two concurrent transfers that each fit the balance but not together:
/// exactly one commits.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_double_spend() {
    for _ in 0..20 {
        let harness = Arc::new(TestHarness::new(&["150", "0", "0"]));

        let a = {
            let h = harness.clone();
            tokio::spawn(async move { h.coordinator.transfer(h.request(0, 1, "100")).await })
        };
        let b = {
            let h = harness.clone();
            tokio::spawn(async move { h.coordinator.transfer(h.request(0, 2, "100")).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let completed = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(completed, 1, "exactly one transfer must win: {:?}", results);
        let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(rejected.code(), "INSUFFICIENT_FUNDS");

        assert_eq!(harness.store.balance_of("ACC-1000"), Some(dec("50")));
        assert_eq!(harness.total(), dec("150"));
    }
}

// ========================================================================
// Deadlock freedom
// ========================================================================

/// Opposite-direction transfers over the same pair finish without lock
/// timeouts.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_directions_do_not_deadlock() {
    let harness = Arc::new(TestHarness::new(&["10000", "10000"]));

    let mut handles = Vec::new();
    for i in 0..200 {
        let h = harness.clone();
        let (from, to) = if i % 2 == 0 { (0, 1) } else { (1, 0) };
        handles.push(tokio::spawn(async move {
            h.coordinator.transfer(h.request(from, to, "1")).await
        }));
    }

    let all = futures::future::join_all(handles);
    let results = tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("transfers must not deadlock");

    for result in results {
        let result = result.unwrap();
        assert!(
            !matches!(result, Err(TransferError::Storage(_))),
            "unexpected storage failure: {:?}",
            result
        );
    }
    assert_eq!(harness.total(), dec("20000"));
    assert_eq!(harness.store.balance_of("ACC-1000"), Some(dec("10000")));
}

/// Row locks are per account: a pair held by another unit of work does not
/// stall transfers between unrelated accounts.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disjoint_pairs_proceed_while_other_pair_is_locked() {
    let harness = Arc::new(TestHarness::new(&["1000", "1000", "1000", "1000"]));
    let mut ids = Vec::new();
    for number in &harness.accounts[..2] {
        let account = harness.store.find_account(number).await.unwrap().unwrap();
        ids.push(account.id);
    }

    let mut held = harness.store.begin().await.unwrap();
    for id in &ids {
        held.lock_account(*id).await.unwrap().unwrap();
    }

    let blocked = {
        let h = harness.clone();
        tokio::spawn(async move { h.coordinator.transfer(h.request(0, 1, "10")).await })
    };

    let free = tokio::time::timeout(
        Duration::from_millis(500),
        harness.coordinator.transfer(harness.request(2, 3, "25")),
    )
    .await
    .expect("transfer between unlocked accounts must not wait on another pair")
    .unwrap();
    assert_eq!(free.status, TransactionStatus::Completed);
    assert_eq!(harness.store.balance_of("ACC-1003"), Some(dec("1025")));

    assert!(!blocked.is_finished());
    assert_eq!(harness.store.balance_of("ACC-1000"), Some(dec("1000")));

    drop(held);
    let unblocked = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("released locks must unblock the waiter")
        .unwrap()
        .unwrap();
    assert_eq!(unblocked.from_balance_after, dec("990"));
    assert_eq!(harness.total(), dec("4000"));
}

// ========================================================================
// Conservation and non-negative balances
// ========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_load_conserves_money() {
    let harness = Arc::new(TestHarness::new(&["500", "1200.50", "75.25", "3000"]));
    let initial: HashMap<String, Decimal> = harness
        .accounts
        .iter()
        .map(|a| (a.clone(), harness.store.balance_of(a).unwrap()))
        .collect();
    let initial_total = harness.total();

    let mut handles = Vec::new();
    for _ in 0..300 {
        let (from, to, cents) = {
            let mut rng = rand::thread_rng();
            let from = rng.gen_range(0..4);
            let to = (from + rng.gen_range(1..4)) % 4;
            (from, to, rng.gen_range(1..50_000i64))
        };
        let h = harness.clone();
        handles.push(tokio::spawn(async move {
            let amount = Decimal::new(cents, 2);
            let req = TransferRequest::new(&h.accounts[from], &h.accounts[to], amount, "ILS");
            h.coordinator.transfer(req).await
        }));
    }

    let mut outcomes = HashMap::new();
    for handle in handles {
        let result = handle.await.unwrap();
        *outcomes.entry(TransferOutcome::of(&result)).or_insert(0) += 1;
    }
    assert_eq!(outcomes.get(&TransferOutcome::Failed), None);

    assert_eq!(harness.total(), initial_total);
    for account in &harness.accounts {
        assert!(harness.store.balance_of(account).unwrap() >= Decimal::ZERO);
    }

    // Replaying the completed ledger rows from the initial balances gives
    // the final balances
    let mut replay = initial;
    for tx in harness.store.transactions() {
        assert!(tx.check_invariants().is_ok());
        if tx.status == TransactionStatus::Completed {
            *replay.get_mut(&tx.from_account_number).unwrap() -= tx.amount;
            *replay.get_mut(&tx.to_account_number).unwrap() += tx.amount;
        }
    }
    for account in &harness.accounts {
        assert_eq!(replay[account], harness.store.balance_of(account).unwrap());
    }

    // Every ledger row has exactly one outbox event
    let outbox = harness.store.outbox();
    assert_eq!(outbox.len(), harness.store.transactions().len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transaction_ids_unique_under_load() {
    let harness = Arc::new(TestHarness::new(&["100000", "100000", "100000"]));
    let mut handles = Vec::new();
    for i in 0..150 {
        let h = harness.clone();
        handles.push(tokio::spawn(async move {
            h.coordinator.transfer(h.request(i % 3, (i + 1) % 3, "1")).await
        }));
    }
    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(ids.insert(result.transaction_id));
    }
}
