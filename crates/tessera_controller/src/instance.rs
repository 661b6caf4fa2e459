//! Instance-partitions computation: default partitions, fetch-or-compute,
//! and the replica-group instance assignment driver.

use anyhow::{bail, Result};

use crate::config::{TableConfig, TableType};
use crate::state::{InstanceConfig, InstancePartitions, InstancePartitionsType};
use crate::store::MetadataStore;

/// Partition types a rebalance resolves for the given table type, in order.
pub fn relevant_partition_types(table_type: TableType) -> &'static [InstancePartitionsType] {
    match table_type {
        TableType::Offline => &[InstancePartitionsType::Offline],
        TableType::Realtime => &[
            InstancePartitionsType::Consuming,
            InstancePartitionsType::Completed,
        ],
    }
}

/// Whether the table config enables instance reassignment for this type.
pub fn allow_instance_assignment(
    table_config: &TableConfig,
    partitions_type: InstancePartitionsType,
) -> bool {
    table_config.instance_assignment.contains_key(&partitions_type)
}

/// Enabled instances tagged for the table's tenant, sorted by instance id.
fn tagged_pool(table_config: &TableConfig, instance_configs: &[InstanceConfig]) -> Vec<String> {
    let tag = table_config.tenant_tag();
    let mut pool: Vec<String> = instance_configs
        .iter()
        .filter(|config| config.enabled && config.tags.iter().any(|t| *t == tag))
        .map(|config| config.instance_id.clone())
        .collect();
    pool.sort();
    pool.dedup();
    pool
}

/// Default partitions: the whole tagged pool as a single replica group.
pub fn compute_default_instance_partitions(
    table_config: &TableConfig,
    partitions_type: InstancePartitionsType,
    instance_configs: &[InstanceConfig],
) -> Result<InstancePartitions> {
    let pool = tagged_pool(table_config, instance_configs);
    if pool.is_empty() {
        bail!(
            "no enabled instance tagged {} for table {}",
            table_config.tenant_tag(),
            table_config.name_with_type()
        );
    }
    let mut partitions =
        InstancePartitions::new(partitions_type.partitions_name(&table_config.raw_table_name));
    partitions.set_instances(0, 0, pool);
    Ok(partitions)
}

/// Fetch the persisted partitions record, falling back to the default
/// computation when none has been persisted for this table and type.
pub fn fetch_or_compute_instance_partitions(
    store: &dyn MetadataStore,
    table_config: &TableConfig,
    partitions_type: InstancePartitionsType,
) -> Result<InstancePartitions> {
    let name = partitions_type.partitions_name(&table_config.raw_table_name);
    if let Some(partitions) = store.instance_partitions(&name)? {
        return Ok(partitions);
    }
    compute_default_instance_partitions(table_config, partitions_type, &store.instance_configs()?)
}

/// Slices the tagged pool into the replica-group shape declared by the
/// table's per-type instance assignment config.
pub struct InstanceAssignmentDriver<'a> {
    table_config: &'a TableConfig,
}

impl<'a> InstanceAssignmentDriver<'a> {
    pub fn new(table_config: &'a TableConfig) -> Self {
        Self { table_config }
    }

    pub fn assign(
        &self,
        partitions_type: InstancePartitionsType,
        instance_configs: &[InstanceConfig],
    ) -> Result<InstancePartitions> {
        let table = self.table_config.name_with_type();
        let Some(assignment_config) = self.table_config.instance_assignment.get(&partitions_type)
        else {
            bail!("no {partitions_type} instance assignment config for table {table}");
        };
        let num_groups = assignment_config.num_replica_groups;
        let group_size = assignment_config.num_instances_per_replica_group;
        if num_groups == 0 || group_size == 0 {
            bail!("degenerate {partitions_type} instance assignment config for table {table}");
        }

        let pool = tagged_pool(self.table_config, instance_configs);
        let needed = num_groups * group_size;
        if pool.len() < needed {
            bail!(
                "not enough instances tagged {} for table {table}: need {needed}, have {}",
                self.table_config.tenant_tag(),
                pool.len()
            );
        }

        let mut partitions =
            InstancePartitions::new(partitions_type.partitions_name(&self.table_config.raw_table_name));
        for group in 0..num_groups {
            let slice = pool[group * group_size..(group + 1) * group_size].to_vec();
            partitions.set_instances(0, group, slice);
        }
        tracing::info!(
            table = %table,
            partition_type = %partitions_type,
            replica_groups = num_groups,
            "assigned instances into replica groups"
        );
        Ok(partitions)
    }
}
