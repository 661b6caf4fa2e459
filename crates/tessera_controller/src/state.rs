//! Cluster metadata records for table segment placement.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica state of a segment on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SegmentState {
    Online,
    Consuming,
    Offline,
    Error,
    Dropped,
}

impl SegmentState {
    /// Whether a replica in this state is serving queries.
    pub fn is_available(self) -> bool {
        matches!(self, SegmentState::Online | SegmentState::Consuming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentState::Online => "ONLINE",
            SegmentState::Consuming => "CONSUMING",
            SegmentState::Offline => "OFFLINE",
            SegmentState::Error => "ERROR",
            SegmentState::Dropped => "DROPPED",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-segment mapping of instance id to replica state.
pub type InstanceStateMap = BTreeMap<String, SegmentState>;

/// Mapping of segment name to its instance states.
pub type Assignment = BTreeMap<String, InstanceStateMap>;

/// Replica count shared by every segment of a well-formed assignment, or
/// `None` when the assignment is empty or the counts disagree.
pub fn uniform_replica_count(assignment: &Assignment) -> Option<usize> {
    let mut counts = assignment.values().map(BTreeMap::len);
    let first = counts.next()?;
    counts.all(|count| count == first).then_some(first)
}

/// Desired segment placement for one table. `version` is assigned by the
/// metadata store and is the optimistic-concurrency token for updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdealState {
    pub version: u64,
    pub enabled: bool,
    pub num_partitions: usize,
    pub replicas: usize,
    pub assignment: Assignment,
}

/// Observed segment placement, reported asynchronously by the cluster.
/// Only the assignment is consulted; the record version never is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalView {
    pub assignment: Assignment,
}

/// Partition type an instance-partitions record is keyed by. The declaration
/// order is the resolution order for a rebalance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstancePartitionsType {
    Offline,
    Consuming,
    Completed,
}

impl InstancePartitionsType {
    pub fn as_str(self) -> &'static str {
        match self {
            InstancePartitionsType::Offline => "OFFLINE",
            InstancePartitionsType::Consuming => "CONSUMING",
            InstancePartitionsType::Completed => "COMPLETED",
        }
    }

    /// Name under which the partitions record for `raw_table_name` persists.
    pub fn partitions_name(self, raw_table_name: &str) -> String {
        format!("{raw_table_name}_{}", self.as_str())
    }
}

impl fmt::Display for InstancePartitionsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named grouping of instances into partition/replica-group slots, produced
/// by instance assignment and consumed by the segment-assignment strategies.
/// Keys are `"{partition}_{replicaGroup}"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePartitions {
    pub name: String,
    pub partition_to_instances: BTreeMap<String, Vec<String>>,
}

impl InstancePartitions {
    pub fn new(name: String) -> Self {
        Self {
            name,
            partition_to_instances: BTreeMap::new(),
        }
    }

    pub fn set_instances(&mut self, partition: usize, replica_group: usize, instances: Vec<String>) {
        self.partition_to_instances
            .insert(format!("{partition}_{replica_group}"), instances);
    }

    pub fn instances(&self, partition: usize, replica_group: usize) -> &[String] {
        self.partition_to_instances
            .get(&format!("{partition}_{replica_group}"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn num_replica_groups(&self) -> usize {
        self.partition_to_instances.len()
    }

    /// Sorted union of every instance across all partition slots.
    pub fn all_instances(&self) -> BTreeSet<String> {
        self.partition_to_instances
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Server instance registration, the pool instance assignment selects from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}
