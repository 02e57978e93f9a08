//! Integration tests for resync, SB notifications, watchers and the
//! read-side views of the scheduler.

mod common;

use std::thread;
use std::time::Duration;

use common::{Item, TestHarness};
use kvsched::{
    key_selector, value_ref, DescriptorError, ResyncType, SchedulerConfig, SchedulerError,
    Transaction, ValueState, View,
};

#[test]
fn test_full_resync_corrects_drifted_value() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update().with_retrieve());

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    // Someone changed the MTU directly in SB.
    h.sb.set("iface/eth0", Item::new(9000));
    h.sb.clear_calls();

    let outcome = h
        .scheduler
        .commit(Transaction::resync(ResyncType::FullResync).put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.sb.calls(), ["update iface/eth0"]);
    assert_eq!(h.sb.get("iface/eth0").map(|i| i.value), Some(1500));

    let record = h
        .scheduler
        .recorded_transaction(outcome.seq_num)
        .expect("Transaction not recorded");
    assert_eq!(record.resync_type, ResyncType::FullResync);
    let op = &record.executed[0];
    let prev = op
        .prev_value
        .as_ref()
        .and_then(|v| v.downcast_ref::<Item>())
        .map(|i| i.value);
    assert_eq!(prev, Some(9000));
}

#[test]
fn test_full_resync_removes_values_missing_from_txn() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update().with_retrieve());

    h.scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .put("iface/eth1", Item::new(1500)),
        )
        .expect("Failed to commit");
    h.sb.clear_calls();

    h.scheduler
        .commit(Transaction::resync(ResyncType::FullResync).put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    assert_eq!(h.sb.calls(), ["delete iface/eth1"]);
    assert_eq!(h.state("iface/eth0"), ValueState::Configured);
    assert_eq!(h.state("iface/eth1"), ValueState::Nonexistent);
}

#[test]
fn test_downstream_resync_restores_missing_value() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update().with_retrieve());

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    h.sb.remove("iface/eth0");
    h.sb.clear_calls();

    let outcome = h
        .scheduler
        .commit(Transaction::resync(ResyncType::DownstreamResync))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.sb.calls(), ["create iface/eth0"]);
    assert_eq!(h.state("iface/eth0"), ValueState::Configured);
    assert_eq!(h.sb.get("iface/eth0").map(|i| i.value), Some(1500));
}

#[test]
fn test_full_resync_discovers_value_in_sync() {
    let h = TestHarness::new();
    h.sb.set("iface/eth0", Item::new(1500));
    h.register(h.descriptor("iface", "iface/").with_update().with_retrieve());

    let outcome = h
        .scheduler
        .commit(Transaction::resync(ResyncType::FullResync).put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert!(h.sb.calls().is_empty());
    assert_eq!(h.state("iface/eth0"), ValueState::Discovered);
}

#[test]
fn test_full_resync_leaves_unreadable_value_missing() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update());

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    h.sb.remove("iface/eth0");
    h.sb.clear_calls();

    h.scheduler
        .commit(Transaction::resync(ResyncType::FullResync).put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    assert!(h.sb.calls().is_empty());
    assert_eq!(h.state("iface/eth0"), ValueState::Missing);
}

#[test]
fn test_retrieve_failure_keeps_last_known_state() {
    let h = TestHarness::new();
    let iface = h.register(h.descriptor("iface", "iface/").with_update().with_retrieve());

    h.scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .put("iface/eth1", Item::new(1500)),
        )
        .expect("Failed to commit");
    h.sb.remove("iface/eth0");
    h.sb.clear_calls();
    iface.fail(
        "retrieve",
        "",
        DescriptorError::Operation("dump failed".into()),
        Some(1),
    );

    h.scheduler
        .commit(Transaction::resync(ResyncType::DownstreamResync))
        .expect("Failed to commit");

    assert!(h.sb.calls().is_empty());
    assert_eq!(h.state("iface/eth0"), ValueState::Configured);
    assert_eq!(h.state("iface/eth1"), ValueState::Configured);

    // Once retrieve works again the drift is found and corrected.
    h.scheduler
        .commit(Transaction::resync(ResyncType::DownstreamResync))
        .expect("Failed to commit");

    assert_eq!(h.sb.calls(), ["create iface/eth0"]);
    assert_eq!(h.state("iface/eth0"), ValueState::Configured);
}

#[test]
fn test_downstream_resync_rejects_values() {
    let h = TestHarness::new();

    let result = h.scheduler.commit(
        Transaction::resync(ResyncType::DownstreamResync).put("iface/eth0", Item::new(1500)),
    );

    assert!(matches!(result, Err(SchedulerError::InvalidTransaction(_))));
}

#[test]
fn test_sb_notification_tracks_obtained_value() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update());
    let watcher = h
        .scheduler
        .watch_value_status(16, Some(key_selector(|key| key.starts_with("iface/"))));

    h.scheduler
        .push_sb_notification("iface/lo", Some(value_ref(Item::new(65536))), None)
        .expect("Failed to push notification");
    h.scheduler
        .transaction_barrier()
        .expect("Failed to wait for queue");

    assert_eq!(h.state("iface/lo"), ValueState::Obtained);
    assert!(h.sb.calls().is_empty());
    let status = watcher
        .recv_timeout(Duration::from_secs(1))
        .expect("No status update");
    assert_eq!(status.key(), "iface/lo");
    assert_eq!(status.state(), ValueState::Obtained);

    h.scheduler
        .push_sb_notification("iface/lo", None, None)
        .expect("Failed to push notification");
    h.scheduler
        .transaction_barrier()
        .expect("Failed to wait for queue");

    assert_eq!(h.state("iface/lo"), ValueState::Nonexistent);
    assert!(h.sb.calls().is_empty());
    let status = watcher
        .recv_timeout(Duration::from_secs(1))
        .expect("No status update");
    assert_eq!(status.state(), ValueState::Removed);
}

#[test]
fn test_sb_notification_unblocks_pending_value() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update());
    h.register(h.descriptor("route", "route/").with_update());

    h.scheduler
        .commit(Transaction::new().put("route/r1", Item::new(1).needs("iface/lo")))
        .expect("Failed to commit");
    assert_eq!(h.state("route/r1"), ValueState::Pending);

    h.scheduler
        .push_sb_notification("iface/lo", Some(value_ref(Item::new(65536))), None)
        .expect("Failed to push notification");
    h.scheduler
        .transaction_barrier()
        .expect("Failed to wait for queue");

    assert_eq!(h.sb.calls(), ["create route/r1"]);
    assert_eq!(h.state("route/r1"), ValueState::Configured);
}

#[test]
fn test_watcher_selector_filters_keys() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update());
    h.register(h.descriptor("route", "route/").with_update());
    let watcher = h
        .scheduler
        .watch_value_status(16, Some(key_selector(|key| key.starts_with("route/"))));

    h.scheduler
        .commit(
            Transaction::new()
                .put("iface/eth0", Item::new(1500))
                .put("route/r1", Item::new(1).needs("iface/eth0")),
        )
        .expect("Failed to commit");

    let status = watcher
        .recv_timeout(Duration::from_secs(1))
        .expect("No status update");
    assert_eq!(status.key(), "route/r1");
    assert!(watcher.try_recv().is_err());
}

#[test]
fn test_dump_views() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update().with_retrieve());

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");
    h.sb.set("iface/lo", Item::new(65536));

    let nb = h
        .scheduler
        .dump_values("iface", View::NbView)
        .expect("Failed to dump NB view");
    assert_eq!(nb.len(), 1);
    assert_eq!(nb[0].key, "iface/eth0");

    let cached = h
        .scheduler
        .dump_values("iface", View::CachedView)
        .expect("Failed to dump cached view");
    assert_eq!(cached.len(), 1);

    let sb = h
        .scheduler
        .dump_values("iface", View::SbView)
        .expect("Failed to dump SB view");
    let keys: Vec<_> = sb.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, ["iface/eth0", "iface/lo"]);
    // Reading SB does not touch the graph.
    assert_eq!(h.state("iface/lo"), ValueState::Nonexistent);

    assert!(matches!(
        h.scheduler.dump_values("acl", View::NbView),
        Err(SchedulerError::UnknownDescriptor(_))
    ));
    assert_eq!(h.scheduler.registered_nb_key_prefixes(), ["iface/"]);
}

#[test]
fn test_sb_view_requires_retrieve() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/"));

    assert!(matches!(
        h.scheduler.dump_values("iface", View::SbView),
        Err(SchedulerError::RetrieveUnsupported(_))
    ));
}

#[test]
fn test_metadata_map_is_kept_in_sync() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update().with_metadata());

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    let map = h
        .scheduler
        .metadata_map("iface")
        .expect("Metadata map not registered");
    assert_eq!(
        map.get_as::<String>("iface/eth0").map(String::as_str),
        Some("meta:iface/eth0")
    );

    h.scheduler
        .commit(Transaction::new().delete("iface/eth0"))
        .expect("Failed to commit");
    let map = h
        .scheduler
        .metadata_map("iface")
        .expect("Metadata map not registered");
    assert!(map.get("iface/eth0").is_none());
}

#[test]
fn test_verify_mode_passes_for_consistent_descriptor() {
    let mut config = SchedulerConfig::default();
    config.print_txn_summary = false;
    config.verify_mode = true;
    let h = TestHarness::with_config(config);
    h.register(h.descriptor("iface", "iface/").with_update().with_retrieve());

    let outcome = h
        .scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    assert!(outcome.is_success());
    assert_eq!(h.state("iface/eth0"), ValueState::Configured);
}

#[test]
fn test_values_and_value_lookup() {
    let h = TestHarness::new();
    h.register(h.descriptor("iface", "iface/").with_update());

    h.scheduler
        .commit(Transaction::new().put("iface/eth0", Item::new(1500)))
        .expect("Failed to commit");

    let value = h.scheduler.value("iface/eth0").expect("Value not found");
    assert_eq!(value.downcast_ref::<Item>().map(|i| i.value), Some(1500));
    assert!(h.scheduler.value("iface/eth1").is_none());

    let values = h.scheduler.values(|key| key.starts_with("iface/"));
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].key, "iface/eth0");
}

#[test]
fn test_stopped_scheduler_is_closed() {
    let h = TestHarness::new();
    h.scheduler.stop();

    assert!(matches!(
        h.scheduler.commit(Transaction::new().put("iface/eth0", Item::new(1))),
        Err(SchedulerError::Closed)
    ));
    assert!(matches!(
        h.scheduler.transaction_barrier(),
        Err(SchedulerError::Closed)
    ));
}

#[test]
fn test_sb_view_does_not_overlap_transaction_refresh() {
    let h = TestHarness::new();
    let iface = h.register(
        h.descriptor("iface", "iface/")
            .with_slow_retrieve(Duration::from_millis(20)),
    );
    for i in 0..3 {
        iface.fail(
            "create",
            &format!("iface/eth{}", i),
            DescriptorError::Operation("boom".into()),
            None,
        );
    }

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..10 {
                h.scheduler
                    .dump_values("iface", View::SbView)
                    .expect("Failed to dump SB view");
            }
        });
        for i in 0..3 {
            h.scheduler
                .commit(
                    Transaction::new()
                        .put(format!("iface/eth{}", i), Item::new(1500))
                        .without_retry(),
                )
                .expect("Failed to commit");
        }
    });

    // Every failed create was followed by a refresh.
    assert_eq!(h.state("iface/eth2"), ValueState::Failed);
    assert_eq!(iface.max_concurrent_retrieves(), 1);
}
