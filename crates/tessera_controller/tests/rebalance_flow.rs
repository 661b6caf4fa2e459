//! End-to-end rebalance runs against a scratch metadata directory, with a
//! background thread standing in for the cluster controller that reports the
//! external view.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tessera_controller::{
    Assignment, DirMetadataStore, InstanceConfig, InstanceStateMap, MetadataStore,
    RebalanceConfig, RebalanceStatus, Rebalancer, RebalancerTiming, SegmentState, TableConfig,
    TableType,
};

fn instance(id: &str, tag: &str) -> InstanceConfig {
    InstanceConfig {
        instance_id: id.to_string(),
        host: format!("{id}.local"),
        port: 8098,
        enabled: true,
        tags: vec![tag.to_string()],
    }
}

fn offline_table(replication: usize) -> TableConfig {
    TableConfig {
        raw_table_name: "orders".into(),
        table_type: TableType::Offline,
        replication,
        server_tenant: "default".into(),
        high_level_consumer: false,
        assignment_strategy: "balanced".into(),
        instance_assignment: BTreeMap::new(),
    }
}

fn states(entries: &[(&str, SegmentState)]) -> InstanceStateMap {
    entries
        .iter()
        .map(|(instance, state)| (instance.to_string(), *state))
        .collect()
}

fn assignment(entries: &[(&str, &[(&str, SegmentState)])]) -> Assignment {
    entries
        .iter()
        .map(|(segment, map)| (segment.to_string(), states(map)))
        .collect()
}

fn fast_timing() -> RebalancerTiming {
    RebalancerTiming {
        check_interval: Duration::from_millis(2),
        stabilization_max_wait: Duration::from_secs(5),
    }
}

fn short_wait_timing() -> RebalancerTiming {
    RebalancerTiming {
        check_interval: Duration::from_millis(2),
        stabilization_max_wait: Duration::from_millis(40),
    }
}

/// How the stand-in controller reports the external view.
#[derive(Clone, Copy)]
enum ControllerMode {
    /// Mirror the ideal state, converging every step.
    Converge,
    /// Never report an external view at all.
    Stall,
    /// Mirror the ideal state but hold one instance in ERROR.
    ErrorOn(&'static str),
}

/// Background stand-in for the cluster controller: polls the ideal state,
/// records every committed version, and reports the external view according
/// to its mode.
struct FakeController {
    stop: Arc<AtomicBool>,
    history: Arc<Mutex<Vec<(u64, Assignment)>>>,
    handle: JoinHandle<()>,
}

impl FakeController {
    fn spawn(store: Arc<DirMetadataStore>, table: &str, mode: ControllerMode) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let history = Arc::new(Mutex::new(Vec::new()));
        let thread_stop = stop.clone();
        let thread_history = history.clone();
        let table = table.to_string();
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                if let Ok(Some(ideal_state)) = store.ideal_state(&table) {
                    let mut history = thread_history.lock().unwrap();
                    let seen = history
                        .iter()
                        .any(|(version, _)| *version == ideal_state.version);
                    if !seen {
                        history.push((ideal_state.version, ideal_state.assignment.clone()));
                    }
                    drop(history);
                    match mode {
                        ControllerMode::Converge => {
                            store
                                .set_external_view(&table, ideal_state.assignment)
                                .expect("set external view");
                        }
                        ControllerMode::Stall => {}
                        ControllerMode::ErrorOn(instance) => {
                            let mut reported = ideal_state.assignment;
                            for states in reported.values_mut() {
                                if let Some(state) = states.get_mut(instance) {
                                    *state = SegmentState::Error;
                                }
                            }
                            store
                                .set_external_view(&table, reported)
                                .expect("set external view");
                        }
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
        });
        Self {
            stop,
            history,
            handle,
        }
    }

    fn finish(self) -> Vec<(u64, Assignment)> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().expect("controller thread");
        Arc::try_unwrap(self.history)
            .expect("history still shared")
            .into_inner()
            .unwrap()
    }
}

/// Every segment must keep at least `min_available` replicas that were
/// available under the previous assignment and survive into the next one.
fn assert_availability_floor(prev: &Assignment, next: &Assignment, min_available: usize) {
    for (segment, prev_map) in prev {
        let next_map = next.get(segment).expect("segment dropped from assignment");
        let kept = prev_map
            .iter()
            .filter(|(instance, state)| {
                state.is_available() && next_map.contains_key(instance.as_str())
            })
            .count();
        assert!(
            kept >= min_available,
            "segment {segment} kept only {kept} available replicas, need {min_available}"
        );
    }
}

#[test]
fn no_downtime_rebalance_converges_and_keeps_replicas_available() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirMetadataStore::open(dir.path()).unwrap());
    // Only i3/i4 are tagged for the tenant, so the target moves both replicas.
    store
        .put_instance_configs(&[
            instance("i3", "default_OFFLINE"),
            instance("i4", "default_OFFLINE"),
        ])
        .unwrap();
    let current = assignment(&[
        (
            "seg0",
            &[("i1", SegmentState::Online), ("i2", SegmentState::Online)],
        ),
        (
            "seg1",
            &[("i1", SegmentState::Online), ("i2", SegmentState::Online)],
        ),
    ]);
    store.set_ideal_state("orders_OFFLINE", true, current).unwrap();

    let controller = FakeController::spawn(store.clone(), "orders_OFFLINE", ControllerMode::Converge);
    let rebalancer = Rebalancer::with_timing(store.clone(), fast_timing());
    let result = rebalancer.rebalance(&offline_table(2), &RebalanceConfig::default());
    assert_eq!(result.status, RebalanceStatus::Done, "{}", result.message);

    let target = result.target_assignment.expect("target in result");
    let stored = store.ideal_state("orders_OFFLINE").unwrap().unwrap();
    assert_eq!(stored.assignment, target);
    for segment_states in target.values() {
        let hosts: Vec<_> = segment_states.keys().map(String::as_str).collect();
        assert!(hosts.iter().all(|host| *host == "i3" || *host == "i4"));
    }

    let mut history = controller.finish();
    history.sort_by_key(|(version, _)| *version);
    // Seed, one intermediate step keeping a current replica, then the target.
    assert_eq!(history.len(), 3, "unexpected step count: {history:?}");
    for pair in history.windows(2) {
        assert_availability_floor(&pair[0].1, &pair[1].1, 1);
    }
    assert_eq!(history.last().unwrap().1, stored.assignment);
}

#[test]
fn downtime_rebalance_does_not_wait_for_the_external_view() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirMetadataStore::open(dir.path()).unwrap());
    store
        .put_instance_configs(&[
            instance("i3", "default_OFFLINE"),
            instance("i4", "default_OFFLINE"),
        ])
        .unwrap();
    store
        .set_ideal_state(
            "orders_OFFLINE",
            true,
            assignment(&[(
                "seg0",
                &[("i1", SegmentState::Online), ("i2", SegmentState::Online)],
            )]),
        )
        .unwrap();

    // No external view exists at all; the downtime path never looks at it.
    let config = RebalanceConfig {
        downtime: true,
        ..RebalanceConfig::default()
    };
    let rebalancer = Rebalancer::with_timing(store.clone(), fast_timing());
    let result = rebalancer.rebalance(&offline_table(2), &config);
    assert_eq!(result.status, RebalanceStatus::Done, "{}", result.message);

    let stored = store.ideal_state("orders_OFFLINE").unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.assignment, result.target_assignment.unwrap());
}

#[test]
fn rebalance_fails_when_the_table_is_deleted_mid_wait() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirMetadataStore::open(dir.path()).unwrap());
    store
        .put_instance_configs(&[
            instance("i3", "default_OFFLINE"),
            instance("i4", "default_OFFLINE"),
        ])
        .unwrap();
    store
        .set_ideal_state(
            "orders_OFFLINE",
            true,
            assignment(&[(
                "seg0",
                &[("i1", SegmentState::Online), ("i2", SegmentState::Online)],
            )]),
        )
        .unwrap();

    // The external view never converges; the table disappears mid-wait.
    let store_handle = store.clone();
    let deleter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        store_handle.remove_table("orders_OFFLINE").unwrap();
    });

    let rebalancer = Rebalancer::with_timing(store, fast_timing());
    let result = rebalancer.rebalance(&offline_table(2), &RebalanceConfig::default());
    deleter.join().unwrap();
    assert_eq!(result.status, RebalanceStatus::Failed);
    assert!(
        result.message.contains("disappeared"),
        "unexpected message: {}",
        result.message
    );
}

#[test]
fn best_efforts_rebalance_completes_despite_a_stalled_external_view() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirMetadataStore::open(dir.path()).unwrap());
    store
        .put_instance_configs(&[
            instance("i3", "default_OFFLINE"),
            instance("i4", "default_OFFLINE"),
        ])
        .unwrap();
    store
        .set_ideal_state(
            "orders_OFFLINE",
            true,
            assignment(&[(
                "seg0",
                &[("i1", SegmentState::Online), ("i2", SegmentState::Online)],
            )]),
        )
        .unwrap();

    // The controller never reports an external view, so every wait times out
    // and best-efforts steps through regardless.
    let controller = FakeController::spawn(store.clone(), "orders_OFFLINE", ControllerMode::Stall);
    let config = RebalanceConfig {
        best_efforts: true,
        ..RebalanceConfig::default()
    };
    let rebalancer = Rebalancer::with_timing(store.clone(), short_wait_timing());
    let result = rebalancer.rebalance(&offline_table(2), &config);
    assert_eq!(result.status, RebalanceStatus::Done, "{}", result.message);
    assert!(
        result.message.contains("min available replicas"),
        "unexpected message: {}",
        result.message
    );

    let stored = store.ideal_state("orders_OFFLINE").unwrap().unwrap();
    assert_eq!(stored.assignment, result.target_assignment.unwrap());

    // The committed steps still honor the availability floor.
    let mut history = controller.finish();
    history.sort_by_key(|(version, _)| *version);
    assert_eq!(history.len(), 3, "unexpected step count: {history:?}");
    for pair in history.windows(2) {
        assert_availability_floor(&pair[0].1, &pair[1].1, 1);
    }
}

#[test]
fn error_replica_aborts_the_rebalance_without_best_efforts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirMetadataStore::open(dir.path()).unwrap());
    store
        .put_instance_configs(&[
            instance("i3", "default_OFFLINE"),
            instance("i4", "default_OFFLINE"),
        ])
        .unwrap();
    let seeded = store
        .set_ideal_state(
            "orders_OFFLINE",
            true,
            assignment(&[(
                "seg0",
                &[("i1", SegmentState::Online), ("i2", SegmentState::Online)],
            )]),
        )
        .unwrap();

    // The controller reports i1 stuck in ERROR; without best-efforts the
    // rebalance aborts before touching the ideal state.
    let controller =
        FakeController::spawn(store.clone(), "orders_OFFLINE", ControllerMode::ErrorOn("i1"));
    let rebalancer = Rebalancer::with_timing(store.clone(), fast_timing());
    let result = rebalancer.rebalance(&offline_table(2), &RebalanceConfig::default());
    assert_eq!(result.status, RebalanceStatus::Failed);
    assert!(
        result.message.contains("ERROR state"),
        "unexpected message: {}",
        result.message
    );

    let stored = store.ideal_state("orders_OFFLINE").unwrap().unwrap();
    assert_eq!(stored.version, seeded.version);
    assert_eq!(stored.assignment, seeded.assignment);
    controller.finish();
}
