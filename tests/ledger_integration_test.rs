//! End-to-end budget ledger scenarios and invariants.

mod common;

use mitos::services::BudgetLedger;

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
}

#[tokio::test]
async fn three_level_allocation_scenario() {
    let ledger = BudgetLedger::new(common::test_pool().await);

    ledger.init_root("root", 100.0).await.unwrap();
    ledger.allocate("root", "team", 40.0).await.unwrap();
    ledger.allocate("team", "dev", 15.0).await.unwrap();
    ledger.spend("dev", 8.0).await.unwrap();

    assert_close(ledger.available("root").await.unwrap(), 60.0);
    assert_close(ledger.available("team").await.unwrap(), 25.0);
    assert_close(ledger.available("dev").await.unwrap(), 7.0);
}

#[tokio::test]
async fn reclaim_after_partial_spend_scenario() {
    let ledger = BudgetLedger::new(common::test_pool().await);

    ledger.init_root("p", 100.0).await.unwrap();
    ledger.allocate("p", "c", 40.0).await.unwrap();
    ledger.spend("c", 15.0).await.unwrap();

    let reclaimed = ledger.reclaim("c", "p").await.unwrap();
    assert_close(reclaimed, 25.0);
    assert_close(ledger.available("p").await.unwrap(), 85.0);
    assert_close(ledger.available("c").await.unwrap(), 0.0);

    let child = ledger.get_balance("c").await.unwrap().unwrap();
    assert_close(child.allocated, 15.0);
}

#[tokio::test]
async fn conservation_invariant_holds_across_operations() {
    let ledger = BudgetLedger::new(common::test_pool().await);

    ledger.init_root("root", 200.0).await.unwrap();
    ledger.allocate("root", "a", 60.0).await.unwrap();
    ledger.allocate("root", "b", 50.0).await.unwrap();
    ledger.allocate("a", "a1", 20.0).await.unwrap();
    ledger.spend("root", 10.0).await.unwrap();
    ledger.spend("a", 5.0).await.unwrap();
    ledger.spend("a1", 20.0).await.unwrap();
    ledger.spend("b", 12.5).await.unwrap();
    ledger.reclaim("b", "root").await.unwrap();

    // Σ spent + Σ available over leaves ≤ root.allocated.
    let mut total_spent = 0.0;
    for cell in ["root", "a", "b", "a1"] {
        total_spent += ledger.get_balance(cell).await.unwrap().unwrap().spent;
    }
    let leaf_available = ledger.available("a1").await.unwrap()
        + ledger.available("b").await.unwrap();
    let root_allocated = ledger.get_balance("root").await.unwrap().unwrap().allocated;
    assert!(total_spent + leaf_available <= root_allocated + 1e-9);

    // parent.delegated = Σ child.allocated for every parent.
    let root = ledger.get_balance("root").await.unwrap().unwrap();
    let a = ledger.get_balance("a").await.unwrap().unwrap();
    let b = ledger.get_balance("b").await.unwrap().unwrap();
    let a1 = ledger.get_balance("a1").await.unwrap().unwrap();
    assert_close(root.delegated, a.allocated + b.allocated);
    assert_close(a.delegated, a1.allocated);

    // No negative fields anywhere.
    for balance in [root, a, b, a1] {
        assert!(balance.allocated >= 0.0);
        assert!(balance.spent >= 0.0);
        assert!(balance.delegated >= 0.0);
        assert!(balance.available() >= -1e-9);
    }
}

#[tokio::test]
async fn journal_replay_is_the_source_of_truth() {
    let ledger = BudgetLedger::new(common::test_pool().await);

    ledger.init_root("root", 500.0).await.unwrap();
    ledger.allocate("root", "x", 120.0).await.unwrap();
    ledger.top_up("root", "x", 30.0).await.unwrap();
    ledger.allocate("x", "y", 40.0).await.unwrap();
    ledger.spend("y", 11.25).await.unwrap();
    ledger.reclaim("y", "x").await.unwrap();
    ledger.spend("x", 3.5).await.unwrap();

    let replayed = ledger.replay_balances().await.unwrap();
    for cell in ["root", "x", "y"] {
        let live = ledger.get_balance(cell).await.unwrap().unwrap();
        let journal = replayed.get(cell).unwrap_or_else(|| panic!("{cell} missing from replay"));
        assert_close(journal.allocated, live.allocated);
        assert_close(journal.spent, live.spent);
        assert_close(journal.delegated, live.delegated);
    }
}

/// Randomized operation sequences: whatever succeeds must keep the balance
/// table equal to the journal projection.
#[tokio::test]
async fn random_operation_sequences_preserve_replay_equality() {
    use rand::Rng;

    let cells = ["root", "c1", "c2", "c3"];
    for seed_round in 0..10 {
        let ledger = BudgetLedger::new(common::test_pool().await);
        ledger.init_root("root", 1000.0).await.unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..30 {
            let parent = cells[rng.gen_range(0..cells.len())];
            let child = cells[rng.gen_range(0..cells.len())];
            let amount = f64::from(rng.gen_range(1..50));
            // Failures (insufficient budget, missing rows) are expected;
            // only the accounting equality matters.
            match rng.gen_range(0..4) {
                0 => {
                    let _ = ledger.allocate(parent, child, amount).await;
                }
                1 => {
                    let _ = ledger.spend(parent, amount).await;
                }
                2 => {
                    let _ = ledger.reclaim(child, parent).await;
                }
                _ => {
                    let _ = ledger.top_up(parent, child, amount).await;
                }
            }
        }

        let replayed = ledger.replay_balances().await.unwrap();
        for cell in cells {
            let Some(live) = ledger.get_balance(cell).await.unwrap() else { continue };
            let journal = replayed
                .get(cell)
                .unwrap_or_else(|| panic!("round {seed_round}: {cell} missing from replay"));
            assert_close(journal.allocated, live.allocated);
            assert_close(journal.spent, live.spent);
            assert_close(journal.delegated, live.delegated);
        }
    }
}

#[tokio::test]
async fn spend_boundary_is_exact() {
    let ledger = BudgetLedger::new(common::test_pool().await);
    ledger.init_root("cell", 25.0).await.unwrap();

    ledger.spend("cell", 25.0).await.unwrap();
    let err = ledger.spend("cell", 0.0001).await.unwrap_err();
    assert!(err.to_string().starts_with("Budget exhausted"));
}
