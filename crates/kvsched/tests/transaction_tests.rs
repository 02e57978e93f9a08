//! Integration tests for NB transactions: ordering, recreation, failures,
//! retries and revert.

mod common;

use std::time::Duration;

use common::{fast_retry, Item, TestHarness};
use kvsched::{DescriptorError, KvError, Transaction, TxnOperation, ValueState};

fn setup() -> TestHarness {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update());
    h.register(h.descriptor("route", "route/").with_update());
    h
}

#[test]
fn test_dependency_orders_creation() {
    let h = setup();

    let outcome = h
        .scheduler
        .commit(
            Transaction::new()
                .put("route/r1", Item::new(1).needs("iface/eth0"))
                .put("iface/eth0", Item::new(1500)),
        )
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.sb.calls(), ["create iface/eth0", "create route/r1"]);
    assert_eq!(h.state("iface/eth0"), ValueState::Configured);
    assert_eq!(h.state("route/r1"), ValueState::Configured);
}

#[test]
fn test_pending_until_dependency_appears() {
    let h = setup();

    h.scheduler
        .commit(Transaction::new().put("route/r1", Item::new(1).needs("iface/eth0")))
        .expect("Failed to commit");
    assert!(h.sb.calls().is_empty());

    let status = h.scheduler.value_status("route/r1");
    assert_eq!(status.state(), ValueState::Pending);
    assert_eq!(status.value.details, ["iface/eth0"]);
    assert_eq!(h.scheduler.pending_values(|_| true).len(), 1);

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    assert_eq!(h.sb.calls(), ["create iface/eth0", "create route/r1"]);
    assert_eq!(h.state("route/r1"), ValueState::Configured);
    assert!(h.scheduler.pending_values(|_| true).is_empty());
}

#[test]
fn test_delete_removes_dependents_first() {
    let h = setup();
    h.scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .put("route/r1", Item::new(1).needs("iface/eth0")),
        )
        .expect("Failed to commit");
    h.sb.clear_calls();

    let outcome = h
        .scheduler
        .commit(Transaction::new().delete("iface/eth0"))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.sb.calls(), ["delete route/r1", "delete iface/eth0"]);
    assert_eq!(h.state("iface/eth0"), ValueState::Nonexistent);
    assert_eq!(
        outcome.status("iface/eth0").map(|s| s.state()),
        Some(ValueState::Nonexistent)
    );

    let route = h.scheduler.value_status("route/r1");
    assert_eq!(route.state(), ValueState::Pending);
    assert_eq!(route.value.details, ["iface/eth0"]);

    // Re-adding the interface brings the route back.
    h.sb.clear_calls();
    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    assert_eq!(h.sb.calls(), ["create iface/eth0", "create route/r1"]);
    assert_eq!(h.state("route/r1"), ValueState::Configured);
}

#[test]
fn test_repeated_put_is_noop() {
    let h = setup();

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    let outcome = h
        .scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.sb.calls(), ["create iface/eth0"]);
    let record = h
        .scheduler
        .recorded_transaction(outcome.seq_num)
        .expect("Transaction not recorded");
    assert!(record.executed.is_empty());
}

#[test]
fn test_update_in_place() {
    let h = setup();

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(9000)))
        .expect("Failed to commit");

    assert_eq!(h.sb.calls(), ["create iface/eth0", "update iface/eth0"]);
    assert_eq!(h.sb.get("iface/eth0").map(|i| i.value), Some(9000));
}

#[test]
fn test_derived_values_follow_base() {
    let h = setup();

    let outcome = h
        .scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500).child("iface/eth0/ip")))
        .expect("Failed to commit");

    assert_eq!(h.sb.calls(), ["create iface/eth0", "create iface/eth0/ip"]);
    let status = outcome.status("iface/eth0").expect("Missing status");
    assert_eq!(
        status.derived("iface/eth0/ip").map(|s| s.state),
        Some(ValueState::Configured)
    );

    h.sb.clear_calls();
    h.scheduler
        .commit(Transaction::new().delete("iface/eth0"))
        .expect("Failed to commit");
    assert_eq!(h.sb.calls(), ["delete iface/eth0/ip", "delete iface/eth0"]);
    assert_eq!(h.state("iface/eth0/ip"), ValueState::Nonexistent);
}

#[test]
fn test_recreate_without_update_support() {
    let h = TestHarness::new();
    h.register(h.descriptor("acl", "acl/"));

    h.scheduler
        .commit(Transaction::new().put("acl/a", Item::new(1)))
        .expect("Failed to commit");
    h.sb.clear_calls();

    let outcome = h
        .scheduler
        .commit(Transaction::new().put("acl/a", Item::new(2)))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.sb.calls(), ["delete acl/a", "create acl/a"]);
    assert_eq!(h.sb.get("acl/a").map(|i| i.value), Some(2));

    let record = h
        .scheduler
        .recorded_transaction(outcome.seq_num)
        .expect("Transaction not recorded");
    let ops: Vec<_> = record.executed.iter().map(|op| op.operation).collect();
    assert_eq!(ops, [TxnOperation::Delete, TxnOperation::Create]);
    assert!(record.executed.iter().all(|op| op.is_recreate));
    assert!(record.executed[0].flags().contains(&"RECREATE"));
}

#[test]
fn test_dependency_cycle_stays_pending() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/"));

    h.scheduler
        .commit(
            Transaction::new()
                .put("iface/a", Item::new(1).needs("iface/b"))
                .put("iface/b", Item::new(2).needs("iface/a")),
        )
        .expect("Failed to commit");

    assert!(h.sb.calls().is_empty());
    assert_eq!(h.state("iface/a"), ValueState::Pending);
    assert_eq!(h.state("iface/b"), ValueState::Pending);
    assert_eq!(h.scheduler.value_status("iface/a").value.details, ["iface/b"]);
    assert_eq!(h.scheduler.value_status("iface/b").value.details, ["iface/a"]);

    // Breaking the cycle lets both through.
    h.scheduler
        .commit(Transaction::new().put("iface/b", Item::new(2)))
        .expect("Failed to commit");

    assert_eq!(h.sb.calls(), ["create iface/b", "create iface/a"]);
    assert_eq!(h.state("iface/a"), ValueState::Configured);
    assert_eq!(h.state("iface/b"), ValueState::Configured);
}

#[test]
fn test_failure_leaves_dependent_pending() {
    let h = TestHarness::new();
    let iface = h.register(h.descriptor("iface", "iface/"));
    h.register(h.descriptor("route", "route/"));
    iface.fail(
        "create",
        "iface/eth0",
        DescriptorError::Operation("boom".into()),
        None,
    );

    let outcome = h
        .scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .put("route/r1", Item::new(1).needs("iface/eth0"))
                .without_retry(),
        )
        .expect("Failed to commit");

    let err = outcome.error.expect("Expected transaction error");
    assert_eq!(
        err.error_for("iface/eth0"),
        Some(&KvError::Descriptor(DescriptorError::Operation("boom".into())))
    );
    assert!(err.error_for("route/r1").is_none());
    assert_eq!(h.state("iface/eth0"), ValueState::Failed);
    assert_eq!(h.state("route/r1"), ValueState::Pending);

    let failed = h.scheduler.failed_values(|_| true);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, "iface/eth0");
    assert_eq!(failed[0].operation, TxnOperation::Create);
}

#[test]
fn test_retriable_failure_uses_configured_retry() {
    let h = TestHarness::new();
    let iface = h.register(h.descriptor("iface", "iface/"));
    iface.fail(
        "create",
        "iface/eth0",
        DescriptorError::Transient("busy".into()),
        Some(1),
    );

    let outcome = h
        .scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    assert_eq!(
        outcome.status("iface/eth0").map(|s| s.state()),
        Some(ValueState::Retrying)
    );
    assert!(h.wait_for_state("iface/eth0", ValueState::Configured, Duration::from_secs(5)));
    assert_eq!(h.sb.count("create iface/eth0"), 2);
}

#[test]
fn test_without_retry_fails_immediately() {
    let h = TestHarness::new();
    let iface = h.register(h.descriptor("iface", "iface/"));
    iface.fail(
        "create",
        "iface/eth0",
        DescriptorError::Transient("busy".into()),
        Some(1),
    );

    let outcome = h
        .scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .without_retry(),
        )
        .expect("Failed to commit");

    assert_eq!(
        outcome.status("iface/eth0").map(|s| s.state()),
        Some(ValueState::Failed)
    );
    h.scheduler
        .transaction_barrier()
        .expect("Failed to wait for queue");
    assert_eq!(h.state("iface/eth0"), ValueState::Failed);
    assert_eq!(h.sb.count("create iface/eth0"), 1);
}

#[test]
fn test_retry_gives_up_after_max_attempts() {
    let h = TestHarness::new();
    let iface = h.register(h.descriptor("iface", "iface/"));
    iface.fail(
        "create",
        "iface/eth0",
        DescriptorError::Transient("busy".into()),
        None,
    );

    let outcome = h
        .scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .with_retry(fast_retry(3)),
        )
        .expect("Failed to commit");

    assert!(!outcome.is_success());
    assert_eq!(
        outcome.status("iface/eth0").map(|s| s.state()),
        Some(ValueState::Retrying)
    );
    assert!(h.wait_for_state("iface/eth0", ValueState::Failed, Duration::from_secs(5)));
    h.scheduler
        .transaction_barrier()
        .expect("Failed to wait for queue");
    assert_eq!(h.sb.count("create iface/eth0"), 4);
}

#[test]
fn test_retry_recovers_from_transient_failure() {
    let h = TestHarness::new();
    let iface = h.register(h.descriptor("iface", "iface/"));
    iface.fail(
        "create",
        "iface/eth0",
        DescriptorError::Transient("busy".into()),
        Some(1),
    );

    h.scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .with_retry(fast_retry(3)),
        )
        .expect("Failed to commit");

    assert!(h.wait_for_state("iface/eth0", ValueState::Configured, Duration::from_secs(5)));
    assert_eq!(h.sb.count("create iface/eth0"), 2);

    let history = h.scheduler.transaction_history(None, None);
    let retry = history
        .iter()
        .find(|txn| txn.retry_for_txn.is_some())
        .expect("Retry transaction not recorded");
    assert_eq!(retry.retry_attempt, 1);
    assert!(retry.executed.iter().all(|op| op.is_retry));
}

#[test]
fn test_revert_on_failure() {
    let h = TestHarness::new();
    let iface = h.register(h.descriptor("iface", "iface/"));
    iface.fail(
        "create",
        "iface/b",
        DescriptorError::Operation("boom".into()),
        None,
    );

    let outcome = h
        .scheduler
        .commit(
            Transaction::new()
                .put("iface/a", Item::new(1))
                .put("iface/b", Item::new(2))
                .with_revert_on_failure(),
        )
        .expect("Failed to commit");

    let err = outcome.error.expect("Expected transaction error");
    assert!(err.error_for("iface/b").is_some());
    assert_eq!(h.sb.calls(), ["create iface/a", "create iface/b", "delete iface/a"]);
    assert_eq!(h.state("iface/a"), ValueState::Nonexistent);
    assert_eq!(h.state("iface/b"), ValueState::Nonexistent);
    assert!(h.sb.get("iface/a").is_none());
}

#[test]
fn test_invalid_value_is_not_applied() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_validation(|item| {
        if item.value == 0 {
            Err(DescriptorError::invalid("value must be positive", ["value"]))
        } else {
            Ok(())
        }
    }));

    let outcome = h
        .scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(0)))
        .expect("Failed to commit");

    assert!(!outcome.is_success());
    assert!(h.sb.calls().is_empty());
    let status = h.scheduler.value_status("iface/eth0");
    assert_eq!(status.state(), ValueState::Invalid);
    assert_eq!(status.value.details, ["value"]);
}

#[test]
fn test_key_without_descriptor_is_unimplemented() {
    let h = setup();

    let outcome = h
        .scheduler
        .commit(Transaction::new().put("acl/x", Item::new(1)))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.state("acl/x"), ValueState::Unimplemented);
    assert!(h.sb.calls().is_empty());
}

#[test]
fn test_simulation_is_recorded() {
    let h = setup();

    let outcome = h
        .scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .with_simulation()
                .with_description("initial config"),
        )
        .expect("Failed to commit");

    assert_eq!(h.sb.count("create iface/eth0"), 1);
    let record = h
        .scheduler
        .recorded_transaction(outcome.seq_num)
        .expect("Transaction not recorded");
    assert!(record.with_simulation);
    assert_eq!(record.description.as_deref(), Some("initial config"));
    assert_eq!(record.planned.len(), 1);
    assert_eq!(record.planned[0].operation, TxnOperation::Create);
    assert_eq!(record.planned[0].new_state, ValueState::Configured);
    assert_eq!(record.executed.len(), 1);

    let summary = record.to_string();
    assert!(summary.contains("* planned operations:"));
    assert!(summary.contains("* executed operations"));

    assert!(!h.scheduler.node_timeline("iface/eth0").is_empty());
}

#[tokio::test]
async fn test_commit_async() {
    let h = setup();

    let outcome = h
        .scheduler
        .commit_async(Transaction::new().put("iface/eth0", Item::new(1500)))
        .await
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.state("iface/eth0"), ValueState::Configured);
}
