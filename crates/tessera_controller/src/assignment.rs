//! Segment-assignment strategies and their factory.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::config::{RebalanceConfig, TableConfig, TableType};
use crate::state::{
    Assignment, InstancePartitions, InstancePartitionsType, InstanceStateMap, SegmentState,
};

/// Computes the target assignment for a table. Implementations must be pure
/// functions of their inputs and keep the segment set of `current`; every
/// segment is either kept verbatim from `current` (a segment the strategy
/// deliberately leaves alone) or placed with exactly the configured replica
/// count on instances drawn from the partitions map. Failures abort the
/// rebalance.
pub trait AssignmentStrategy {
    fn rebalance_table(
        &self,
        current: &Assignment,
        instance_partitions_map: &BTreeMap<InstancePartitionsType, InstancePartitions>,
        config: &RebalanceConfig,
    ) -> Result<Assignment>;
}

/// Strategy factory, keyed on table type and the configured strategy name.
pub fn assignment_strategy(table_config: &TableConfig) -> Result<Box<dyn AssignmentStrategy>> {
    match (table_config.table_type, table_config.assignment_strategy.as_str()) {
        (TableType::Offline, "balanced") => Ok(Box::new(BalancedOffline {
            replicas: table_config.replication,
        })),
        (TableType::Realtime, "balanced") => Ok(Box::new(BalancedRealtime {
            replicas: table_config.replication,
        })),
        (table_type, name) => bail!("unknown {table_type} assignment strategy: {name}"),
    }
}

/// Replica `r` of the `i`-th segment (sorted order) lands on
/// `instances[(i * replicas + r) % n]` over the sorted pool.
fn place_replicas(
    partitions: &InstancePartitions,
    segment_index: usize,
    replicas: usize,
    state: SegmentState,
) -> Result<InstanceStateMap> {
    if replicas == 0 {
        bail!("replica count must be positive");
    }
    let instances: Vec<String> = partitions.all_instances().into_iter().collect();
    if instances.len() < replicas {
        bail!(
            "not enough instances in {}: need {replicas}, have {}",
            partitions.name,
            instances.len()
        );
    }
    Ok((0..replicas)
        .map(|replica| {
            let instance = instances[(segment_index * replicas + replica) % instances.len()].clone();
            (instance, state)
        })
        .collect())
}

/// Balanced placement of offline segments across the OFFLINE partitions.
pub struct BalancedOffline {
    replicas: usize,
}

impl AssignmentStrategy for BalancedOffline {
    fn rebalance_table(
        &self,
        current: &Assignment,
        instance_partitions_map: &BTreeMap<InstancePartitionsType, InstancePartitions>,
        _config: &RebalanceConfig,
    ) -> Result<Assignment> {
        let Some(partitions) = instance_partitions_map.get(&InstancePartitionsType::Offline)
        else {
            bail!("missing OFFLINE instance partitions");
        };
        current
            .keys()
            .enumerate()
            .map(|(index, segment)| {
                let states = place_replicas(partitions, index, self.replicas, SegmentState::Online)?;
                Ok((segment.clone(), states))
            })
            .collect()
    }
}

/// Balanced placement for realtime tables. Completed segments move onto the
/// COMPLETED partitions (CONSUMING partitions when no COMPLETED record
/// exists); consuming segments stay put unless `include_consuming`.
pub struct BalancedRealtime {
    replicas: usize,
}

impl AssignmentStrategy for BalancedRealtime {
    fn rebalance_table(
        &self,
        current: &Assignment,
        instance_partitions_map: &BTreeMap<InstancePartitionsType, InstancePartitions>,
        config: &RebalanceConfig,
    ) -> Result<Assignment> {
        let consuming = instance_partitions_map.get(&InstancePartitionsType::Consuming);
        let completed = instance_partitions_map
            .get(&InstancePartitionsType::Completed)
            .or(consuming);

        let mut target = Assignment::new();
        for (index, (segment, current_map)) in current.iter().enumerate() {
            let is_consuming = current_map
                .values()
                .any(|state| *state == SegmentState::Consuming);
            let next_map = if is_consuming && !config.include_consuming {
                current_map.clone()
            } else if is_consuming {
                let Some(partitions) = consuming else {
                    bail!("missing CONSUMING instance partitions");
                };
                place_replicas(partitions, index, self.replicas, SegmentState::Consuming)?
            } else {
                let Some(partitions) = completed else {
                    bail!("missing COMPLETED instance partitions");
                };
                place_replicas(partitions, index, self.replicas, SegmentState::Online)?
            };
            target.insert(segment.clone(), next_map);
        }
        Ok(target)
    }
}

/// Count of segments each instance gains when moving between assignments.
/// Feeds the per-step progress log line.
pub fn segments_moved_per_instance(
    from: &Assignment,
    to: &Assignment,
) -> BTreeMap<String, usize> {
    let mut moved = BTreeMap::new();
    for (segment, to_map) in to {
        for instance in to_map.keys() {
            let already_hosted = from
                .get(segment)
                .is_some_and(|from_map| from_map.contains_key(instance));
            if !already_hosted {
                *moved.entry(instance.clone()).or_insert(0) += 1;
            }
        }
    }
    moved
}
