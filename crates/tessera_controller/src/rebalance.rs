//! Table rebalancer: drives the ideal state of a table toward a computed
//! target placement while honoring a replica availability contract.
//!
//! Two segment-reassignment modes are offered:
//! 1. with downtime: the ideal state is replaced with the target assignment
//!    in one compare-and-set, with no availability guard
//! 2. no downtime: the ideal state walks toward the target in steps, waiting
//!    for the external view to converge before each step so that every
//!    segment keeps at least the configured number of available replicas
//!
//! The rebalance is a single-shot synchronous call. It is not resumed if the
//! controller running it goes away, and concurrent rebalances of the same
//! table must be prevented by the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use crate::assignment::{assignment_strategy, segments_moved_per_instance, AssignmentStrategy};
use crate::config::{RebalanceConfig, TableConfig, TableType};
use crate::instance::{
    allow_instance_assignment, compute_default_instance_partitions,
    fetch_or_compute_instance_partitions, relevant_partition_types, InstanceAssignmentDriver,
};
use crate::state::{
    uniform_replica_count, Assignment, IdealState, InstancePartitions, InstancePartitionsType,
    InstanceStateMap, SegmentState,
};
use crate::store::{CasOutcome, MetadataStore};

/// Default interval between external-view polls.
pub const EXTERNAL_VIEW_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Default upper bound on waiting for the external view to stabilize.
pub const EXTERNAL_VIEW_STABILIZATION_MAX_WAIT: Duration = Duration::from_secs(3600);

/// Poll timing for the external-view convergence wait.
#[derive(Debug, Clone, Copy)]
pub struct RebalancerTiming {
    pub check_interval: Duration,
    pub stabilization_max_wait: Duration,
}

impl Default for RebalancerTiming {
    fn default() -> Self {
        Self {
            check_interval: EXTERNAL_VIEW_CHECK_INTERVAL,
            stabilization_max_wait: EXTERNAL_VIEW_STABILIZATION_MAX_WAIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceStatus {
    Done,
    NoOp,
    Failed,
}

/// Outcome reported to the caller (and serialized by the admin surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceResult {
    pub status: RebalanceStatus,
    pub message: String,
    pub instance_partitions_map: Option<BTreeMap<InstancePartitionsType, InstancePartitions>>,
    pub target_assignment: Option<Assignment>,
}

impl RebalanceResult {
    fn new(
        status: RebalanceStatus,
        message: impl Into<String>,
        instance_partitions_map: Option<BTreeMap<InstancePartitionsType, InstancePartitions>>,
        target_assignment: Option<Assignment>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            instance_partitions_map,
            target_assignment,
        }
    }
}

pub struct Rebalancer {
    store: Arc<dyn MetadataStore>,
    timing: RebalancerTiming,
}

impl Rebalancer {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self::with_timing(store, RebalancerTiming::default())
    }

    pub fn with_timing(store: Arc<dyn MetadataStore>, timing: RebalancerTiming) -> Self {
        Self { store, timing }
    }

    /// Rebalance one table according to `config`. Fatal errors are reported
    /// through the result status, never panicked or propagated.
    pub fn rebalance(&self, table_config: &TableConfig, config: &RebalanceConfig) -> RebalanceResult {
        let started = Instant::now();
        let table = table_config.name_with_type();
        tracing::info!(
            table = %table,
            dry_run = config.dry_run,
            reassign_instances = config.reassign_instances,
            include_consuming = config.include_consuming,
            downtime = config.downtime,
            min_replicas = config.min_replicas_to_keep_up_for_no_downtime,
            best_efforts = config.best_efforts,
            "starting table rebalance"
        );

        // Tables consuming through a high-level consumer model pin segments
        // to their consumer; reassigning them would break consumption.
        if table_config.table_type == TableType::Realtime && table_config.high_level_consumer {
            tracing::warn!(table = %table, "cannot rebalance a high-level consumer table");
            return RebalanceResult::new(
                RebalanceStatus::Failed,
                "Cannot rebalance table with high-level consumer",
                None,
                None,
            );
        }

        let mut current_ideal_state = match self.store.ideal_state(&table) {
            Ok(Some(ideal_state)) => ideal_state,
            Ok(None) => {
                tracing::warn!(table = %table, "no ideal state found, aborting the rebalance");
                return RebalanceResult::new(
                    RebalanceStatus::Failed,
                    "Cannot find the ideal state for table",
                    None,
                    None,
                );
            }
            Err(err) => {
                tracing::warn!(table = %table, error = ?err, "failed to fetch the ideal state");
                return RebalanceResult::new(
                    RebalanceStatus::Failed,
                    format!("Caught error while fetching the ideal state: {err:#}"),
                    None,
                    None,
                );
            }
        };
        if !current_ideal_state.enabled && !config.downtime {
            tracing::warn!(table = %table, "table is disabled, aborting the rebalance");
            return RebalanceResult::new(
                RebalanceStatus::Failed,
                "Cannot rebalance disabled table without downtime",
                None,
                None,
            );
        }

        tracing::info!(table = %table, "resolving instance partitions");
        let instance_partitions_map = match self.resolve_instance_partitions_map(table_config, config)
        {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(table = %table, error = ?err, "failed to resolve instance partitions");
                return RebalanceResult::new(
                    RebalanceStatus::Failed,
                    format!("Caught error while resolving instance partitions: {err:#}"),
                    None,
                    None,
                );
            }
        };

        let strategy = match assignment_strategy(table_config) {
            Ok(strategy) => strategy,
            Err(err) => {
                tracing::warn!(table = %table, error = ?err, "failed to build the assignment strategy");
                return RebalanceResult::new(
                    RebalanceStatus::Failed,
                    format!("Caught error while building the assignment strategy: {err:#}"),
                    Some(instance_partitions_map),
                    None,
                );
            }
        };

        tracing::info!(table = %table, "computing the target assignment");
        let mut current_assignment = current_ideal_state.assignment.clone();
        let mut target_assignment = match compute_target(
            strategy.as_ref(),
            &current_assignment,
            &instance_partitions_map,
            config,
            table_config.replication,
        ) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(table = %table, error = ?err, "failed to compute the target assignment");
                return RebalanceResult::new(
                    RebalanceStatus::Failed,
                    format!("Caught error while computing the target assignment: {err:#}"),
                    Some(instance_partitions_map),
                    None,
                );
            }
        };

        if current_assignment == target_assignment {
            tracing::info!(table = %table, "table is already balanced");
            let (status, message) = if config.reassign_instances {
                if config.dry_run {
                    (
                        RebalanceStatus::Done,
                        "Instances reassigned in dry-run mode, table is already balanced",
                    )
                } else {
                    (
                        RebalanceStatus::Done,
                        "Instances reassigned, table is already balanced",
                    )
                }
            } else {
                (RebalanceStatus::NoOp, "Table is already balanced")
            };
            return RebalanceResult::new(
                status,
                message,
                Some(instance_partitions_map),
                Some(target_assignment),
            );
        }

        if config.dry_run {
            tracing::info!(table = %table, "dry-run mode, returning the target assignment");
            return RebalanceResult::new(
                RebalanceStatus::Done,
                "Dry-run mode",
                Some(instance_partitions_map),
                Some(target_assignment),
            );
        }

        if config.downtime {
            tracing::info!(table = %table, "rebalancing with downtime");
            loop {
                let record = updated_record(&current_ideal_state, target_assignment.clone());
                match self
                    .store
                    .cas_ideal_state(&table, &record, current_ideal_state.version)
                {
                    Ok(CasOutcome::Committed) => {
                        tracing::info!(
                            table = %table,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "finished rebalancing with downtime"
                        );
                        return RebalanceResult::new(
                            RebalanceStatus::Done,
                            "Success with downtime (replaced the ideal state with the target \
                             segment assignment, the external view might not have caught up yet)",
                            Some(instance_partitions_map),
                            Some(target_assignment),
                        );
                    }
                    Ok(CasOutcome::VersionMismatch) => {
                        tracing::info!(
                            table = %table,
                            "ideal state version changed, recomputing the target assignment"
                        );
                        match self.reread_and_recompute(
                            &table,
                            strategy.as_ref(),
                            &instance_partitions_map,
                            config,
                            table_config.replication,
                        ) {
                            Ok((ideal_state, target)) => {
                                current_ideal_state = ideal_state;
                                target_assignment = target;
                            }
                            Err(err) => {
                                tracing::warn!(table = %table, error = ?err, "failed to recompute the target assignment");
                                return RebalanceResult::new(
                                    RebalanceStatus::Failed,
                                    format!(
                                        "Caught error while recomputing the target assignment: {err:#}"
                                    ),
                                    Some(instance_partitions_map),
                                    Some(target_assignment),
                                );
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(table = %table, error = ?err, "failed to update the ideal state");
                        return RebalanceResult::new(
                            RebalanceStatus::Failed,
                            format!("Caught error while updating the ideal state: {err:#}"),
                            Some(instance_partitions_map),
                            Some(target_assignment),
                        );
                    }
                }
            }
        }

        // No-downtime path. Derive the availability floor from the smaller
        // of the two replica counts; reject tables where segments disagree
        // on their replica count instead of silently sampling one.
        let Some(num_current_replicas) = uniform_replica_count(&current_assignment) else {
            tracing::warn!(table = %table, "inconsistent replica counts in the current assignment");
            return RebalanceResult::new(
                RebalanceStatus::Failed,
                "Segments in the current assignment have inconsistent replica counts",
                Some(instance_partitions_map),
                Some(target_assignment),
            );
        };
        let num_target_replicas = uniform_replica_count(&target_assignment).unwrap_or(0);
        let num_replicas = num_current_replicas.min(num_target_replicas);
        let min_available = match min_available_replicas(
            config.min_replicas_to_keep_up_for_no_downtime,
            num_replicas,
        ) {
            Ok(min_available) => min_available,
            Err(err) => {
                tracing::warn!(
                    table = %table,
                    configured = config.min_replicas_to_keep_up_for_no_downtime,
                    current_replicas = num_current_replicas,
                    target_replicas = num_target_replicas,
                    error = ?err,
                    "illegal min available replicas config"
                );
                return RebalanceResult::new(
                    RebalanceStatus::Failed,
                    "Illegal min available replicas config",
                    Some(instance_partitions_map),
                    Some(target_assignment),
                );
            }
        };

        tracing::info!(
            table = %table,
            min_available_replicas = min_available,
            best_efforts = config.best_efforts,
            "rebalancing without downtime"
        );
        let mut expected_version = current_ideal_state.version;
        loop {
            let ideal_state = match self.wait_for_external_view_convergence(&table, config.best_efforts)
            {
                Ok(ideal_state) => ideal_state,
                Err(err) => {
                    tracing::warn!(table = %table, error = ?err, "failed waiting for the external view to converge");
                    return RebalanceResult::new(
                        RebalanceStatus::Failed,
                        format!("Caught error while waiting for the external view to converge: {err:#}"),
                        Some(instance_partitions_map),
                        Some(target_assignment),
                    );
                }
            };

            // Another writer moved the ideal state while we were waiting:
            // restart from what is stored now.
            if ideal_state.version != expected_version {
                tracing::info!(
                    table = %table,
                    "ideal state version changed while waiting, recomputing the target assignment"
                );
                current_assignment = ideal_state.assignment.clone();
                target_assignment = match compute_target(
                    strategy.as_ref(),
                    &current_assignment,
                    &instance_partitions_map,
                    config,
                    table_config.replication,
                ) {
                    Ok(target) => target,
                    Err(err) => {
                        tracing::warn!(table = %table, error = ?err, "failed to recompute the target assignment");
                        return RebalanceResult::new(
                            RebalanceStatus::Failed,
                            format!("Caught error while recomputing the target assignment: {err:#}"),
                            Some(instance_partitions_map),
                            Some(target_assignment),
                        );
                    }
                };
                expected_version = ideal_state.version;
            }

            if current_assignment == target_assignment {
                tracing::info!(
                    table = %table,
                    min_available_replicas = min_available,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "finished rebalancing without downtime"
                );
                return RebalanceResult::new(
                    RebalanceStatus::Done,
                    format!(
                        "Success with min available replicas: {min_available} (both the ideal \
                         state and the external view should reach the target segment assignment)"
                    ),
                    Some(instance_partitions_map),
                    Some(target_assignment),
                );
            }

            let next = next_assignment(&current_assignment, &target_assignment, min_available);
            tracing::info!(
                table = %table,
                moved = ?segments_moved_per_instance(&current_assignment, &next),
                "computed the next assignment step"
            );

            let record = updated_record(&ideal_state, next.clone());
            match self.store.cas_ideal_state(&table, &record, expected_version) {
                Ok(CasOutcome::Committed) => {
                    current_assignment = next;
                    expected_version += 1;
                    tracing::info!(table = %table, version = expected_version, "updated the ideal state");
                }
                Ok(CasOutcome::VersionMismatch) => {
                    // The next wait re-reads the ideal state and re-plans.
                    tracing::info!(table = %table, "version changed while updating the ideal state");
                }
                Err(err) => {
                    tracing::warn!(table = %table, error = ?err, "failed to update the ideal state");
                    return RebalanceResult::new(
                        RebalanceStatus::Failed,
                        format!("Caught error while updating the ideal state: {err:#}"),
                        Some(instance_partitions_map),
                        Some(target_assignment),
                    );
                }
            }
        }
    }

    fn resolve_instance_partitions_map(
        &self,
        table_config: &TableConfig,
        config: &RebalanceConfig,
    ) -> Result<BTreeMap<InstancePartitionsType, InstancePartitions>> {
        let mut map = BTreeMap::new();
        for &partitions_type in relevant_partition_types(table_config.table_type) {
            map.insert(
                partitions_type,
                self.resolve_instance_partitions(table_config, partitions_type, config)?,
            );
        }
        Ok(map)
    }

    fn resolve_instance_partitions(
        &self,
        table_config: &TableConfig,
        partitions_type: InstancePartitionsType,
        config: &RebalanceConfig,
    ) -> Result<InstancePartitions> {
        let table = table_config.name_with_type();
        if !config.reassign_instances {
            return fetch_or_compute_instance_partitions(
                self.store.as_ref(),
                table_config,
                partitions_type,
            );
        }
        if allow_instance_assignment(table_config, partitions_type) {
            tracing::info!(table = %table, partition_type = %partitions_type, "reassigning instances");
            let driver = InstanceAssignmentDriver::new(table_config);
            let partitions = driver.assign(partitions_type, &self.store.instance_configs()?)?;
            if !config.dry_run {
                tracing::info!(table = %table, name = %partitions.name, "persisting instance partitions");
                self.store.persist_instance_partitions(&partitions)?;
            }
            Ok(partitions)
        } else {
            let partitions = compute_default_instance_partitions(
                table_config,
                partitions_type,
                &self.store.instance_configs()?,
            )?;
            tracing::warn!(
                table = %table,
                partition_type = %partitions_type,
                "instance assignment not configured, using default instance partitions"
            );
            if !config.dry_run {
                // Clear a stale custom record so later reads see the default.
                tracing::info!(table = %table, name = %partitions.name, "removing instance partitions");
                self.store.remove_instance_partitions(&partitions.name)?;
            }
            Ok(partitions)
        }
    }

    fn reread_and_recompute(
        &self,
        table: &str,
        strategy: &dyn AssignmentStrategy,
        instance_partitions_map: &BTreeMap<InstancePartitionsType, InstancePartitions>,
        config: &RebalanceConfig,
        replication: usize,
    ) -> Result<(IdealState, Assignment)> {
        let ideal_state = self
            .store
            .ideal_state(table)?
            .ok_or_else(|| anyhow!("ideal state disappeared, table may have been deleted"))?;
        let target = compute_target(
            strategy,
            &ideal_state.assignment,
            instance_partitions_map,
            config,
            replication,
        )?;
        Ok((ideal_state, target))
    }

    /// Poll until the external view reaches the stored ideal state, returning
    /// the ideal state read on the converged poll. Missing external views
    /// (brand-new tables) keep polling; a missing ideal state is fatal.
    fn wait_for_external_view_convergence(
        &self,
        table: &str,
        best_efforts: bool,
    ) -> Result<IdealState> {
        let deadline = Instant::now() + self.timing.stabilization_max_wait;
        loop {
            let ideal_state = self
                .store
                .ideal_state(table)?
                .ok_or_else(|| anyhow!("ideal state disappeared, table may have been deleted"))?;

            if let Some(external_view) = self.store.external_view(table)? {
                if is_external_view_converged(
                    table,
                    &external_view.assignment,
                    &ideal_state.assignment,
                    best_efforts,
                )? {
                    tracing::info!(table = %table, "external view converged");
                    return Ok(ideal_state);
                }
            }

            if Instant::now() >= deadline {
                if best_efforts {
                    tracing::warn!(
                        table = %table,
                        "external view has not converged within the maximum wait, continuing (best-efforts)"
                    );
                    return Ok(ideal_state);
                }
                bail!("Timed out waiting for the external view to converge");
            }
            thread::sleep(self.timing.check_interval);
        }
    }
}

fn updated_record(base: &IdealState, assignment: Assignment) -> IdealState {
    IdealState {
        version: base.version,
        enabled: base.enabled,
        num_partitions: assignment.len(),
        replicas: uniform_replica_count(&assignment).unwrap_or(0),
        assignment,
    }
}

fn compute_target(
    strategy: &dyn AssignmentStrategy,
    current: &Assignment,
    instance_partitions_map: &BTreeMap<InstancePartitionsType, InstancePartitions>,
    config: &RebalanceConfig,
    replication: usize,
) -> Result<Assignment> {
    let target = strategy.rebalance_table(current, instance_partitions_map, config)?;
    validate_target(current, &target, instance_partitions_map, replication)?;
    Ok(target)
}

/// Check the strategy contract before trusting its output: same segment set
/// as the current assignment, and every reassigned segment carries exactly
/// the configured replica count on instances from the partitions map.
/// Segments whose instance map is kept verbatim from the current assignment
/// are exempt: a strategy that deliberately leaves a segment alone (e.g. a
/// consuming segment without `include_consuming`) must not fail the table
/// just because its host was re-tagged or disabled since placement.
fn validate_target(
    current: &Assignment,
    target: &Assignment,
    instance_partitions_map: &BTreeMap<InstancePartitionsType, InstancePartitions>,
    replication: usize,
) -> Result<()> {
    if current.len() != target.len() || !current.keys().eq(target.keys()) {
        bail!("target assignment does not cover the same segments as the current assignment");
    }
    let allowed: BTreeSet<String> = instance_partitions_map
        .values()
        .flat_map(InstancePartitions::all_instances)
        .collect();
    for (segment, states) in target {
        if current.get(segment) == Some(states) {
            continue;
        }
        if states.len() != replication {
            bail!(
                "target assignment has {} replicas for segment {segment}, expected {replication}",
                states.len()
            );
        }
        for instance in states.keys() {
            if !allowed.contains(instance) {
                bail!("target assignment places segment {segment} on unknown instance {instance}");
            }
        }
    }
    Ok(())
}

/// Derive the availability floor. A non-negative configured value is the
/// floor itself and must be smaller than the replica count; a negative value
/// means "max unavailable replicas".
fn min_available_replicas(configured: i64, num_replicas: usize) -> Result<usize> {
    if configured >= 0 {
        let configured = configured as usize;
        if configured >= num_replicas {
            bail!(
                "min available replicas {configured} must be less than the replica count {num_replicas}"
            );
        }
        Ok(configured)
    } else {
        Ok(num_replicas.saturating_sub(configured.unsigned_abs() as usize))
    }
}

/// Plan one step from `current` toward `target`, keeping every segment on at
/// least `min_available_replicas` instances it is already hosted on.
pub(crate) fn next_assignment(
    current: &Assignment,
    target: &Assignment,
    min_available_replicas: usize,
) -> Assignment {
    current
        .iter()
        .map(|(segment, current_map)| {
            let target_map = match target.get(segment) {
                Some(target_map) => target_map,
                // The strategy contract keeps segment sets identical.
                None => current_map,
            };
            (
                segment.clone(),
                next_instance_state_map(current_map, target_map, min_available_replicas),
            )
        })
        .collect()
}

pub(crate) fn next_instance_state_map(
    current: &InstanceStateMap,
    target: &InstanceStateMap,
    min_available_replicas: usize,
) -> InstanceStateMap {
    let mut next = InstanceStateMap::new();

    // Surviving instances advance straight to their target state.
    for (instance, state) in target {
        if current.contains_key(instance) {
            next.insert(instance.clone(), *state);
        }
    }

    // Keep current instances serving until the availability floor is met.
    let mut to_keep = min_available_replicas.saturating_sub(next.len());
    if to_keep > 0 {
        for (instance, state) in current {
            if !next.contains_key(instance) {
                next.insert(instance.clone(), *state);
                to_keep -= 1;
                if to_keep == 0 {
                    break;
                }
            }
        }
    }

    // Fill up to the target replica count with new target instances.
    let mut to_add = target.len().saturating_sub(next.len());
    if to_add > 0 {
        for (instance, state) in target {
            if !next.contains_key(instance) {
                next.insert(instance.clone(), *state);
                to_add -= 1;
                if to_add == 0 {
                    break;
                }
            }
        }
    }

    next
}

/// Whether the external view has reached the ideal state. Only segments and
/// instances present in the ideal state are checked: extra entries in the
/// external view are fine, and OFFLINE entries in the ideal state are
/// deliberate no-op assignments and are skipped. An ERROR replica can never
/// leave that state on its own, so it aborts the rebalance unless
/// best-efforts downgrades it to a warning.
pub(crate) fn is_external_view_converged(
    table: &str,
    external_view: &Assignment,
    ideal_state: &Assignment,
    best_efforts: bool,
) -> Result<bool> {
    for (segment, ideal_states) in ideal_state {
        let observed = external_view.get(segment);
        for (instance, ideal) in ideal_states {
            if *ideal == SegmentState::Offline {
                continue;
            }
            let Some(observed) = observed else {
                return Ok(false);
            };
            match observed.get(instance) {
                Some(state) if state == ideal => {}
                Some(SegmentState::Error) => {
                    if best_efforts {
                        tracing::warn!(
                            table = %table,
                            segment = %segment,
                            instance = %instance,
                            "replica in ERROR state, counting it as converged (best-efforts)"
                        );
                    } else {
                        tracing::warn!(
                            table = %table,
                            segment = %segment,
                            instance = %instance,
                            "replica in ERROR state"
                        );
                        bail!("Found segments in ERROR state");
                    }
                }
                _ => return Ok(false),
            }
        }
    }
    Ok(true)
}
