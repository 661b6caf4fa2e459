//! Table and per-call rebalance configuration.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::InstancePartitionsType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TableType {
    Offline,
    Realtime,
}

impl TableType {
    pub fn as_str(self) -> &'static str {
        match self {
            TableType::Offline => "OFFLINE",
            TableType::Realtime => "REALTIME",
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replica-group shape for one partition type. Presence of this config is
/// what enables instance reassignment for that type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstanceAssignmentConfig {
    pub num_replica_groups: usize,
    pub num_instances_per_replica_group: usize,
}

/// Declarative inputs of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub raw_table_name: String,
    pub table_type: TableType,
    pub replication: usize,
    pub server_tenant: String,
    /// Realtime stream consumes through a high-level consumer model.
    /// Such tables cannot be rebalanced.
    #[serde(default)]
    pub high_level_consumer: bool,
    #[serde(default = "default_assignment_strategy")]
    pub assignment_strategy: String,
    #[serde(default)]
    pub instance_assignment: BTreeMap<InstancePartitionsType, InstanceAssignmentConfig>,
}

fn default_assignment_strategy() -> String {
    "balanced".to_string()
}

impl TableConfig {
    /// Table name with the type suffix, e.g. `orders_OFFLINE`. This is the
    /// metadata store key and the tag on every rebalance log line.
    pub fn name_with_type(&self) -> String {
        format!("{}_{}", self.raw_table_name, self.table_type.as_str())
    }

    /// Server tag instances must carry to host this table.
    pub fn tenant_tag(&self) -> String {
        format!("{}_{}", self.server_tenant, self.table_type.as_str())
    }
}

/// Recognized per-call rebalance options. A JSON `{}` parses to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Compute only; do not mutate the store.
    pub dry_run: bool,
    /// Recompute and persist instance partitions before segment assignment.
    pub reassign_instances: bool,
    /// Also reassign consuming segments of realtime tables.
    pub include_consuming: bool,
    /// Replace the ideal state in one step with no availability guard.
    pub downtime: bool,
    /// Availability floor for the no-downtime path. A negative value means
    /// "max unavailable replicas".
    pub min_replicas_to_keep_up_for_no_downtime: i64,
    /// Degrade ERROR replicas and convergence timeouts to warnings.
    pub best_efforts: bool,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            reassign_instances: false,
            include_consuming: false,
            downtime: false,
            min_replicas_to_keep_up_for_no_downtime: 1,
            best_efforts: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_parses_to_defaults() {
        let config: RebalanceConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.dry_run);
        assert!(!config.reassign_instances);
        assert!(!config.include_consuming);
        assert!(!config.downtime);
        assert_eq!(config.min_replicas_to_keep_up_for_no_downtime, 1);
        assert!(!config.best_efforts);
    }

    #[test]
    fn table_naming_conventions() {
        let table = TableConfig {
            raw_table_name: "orders".into(),
            table_type: TableType::Realtime,
            replication: 3,
            server_tenant: "default".into(),
            high_level_consumer: false,
            assignment_strategy: default_assignment_strategy(),
            instance_assignment: BTreeMap::new(),
        };
        assert_eq!(table.name_with_type(), "orders_REALTIME");
        assert_eq!(table.tenant_tag(), "default_REALTIME");
    }

    #[test]
    fn table_config_json_defaults_strategy() {
        let table: TableConfig = serde_json::from_str(
            r#"{
                "raw_table_name": "orders",
                "table_type": "OFFLINE",
                "replication": 2,
                "server_tenant": "default"
            }"#,
        )
        .unwrap();
        assert_eq!(table.assignment_strategy, "balanced");
        assert!(table.instance_assignment.is_empty());
        assert!(!table.high_level_consumer);
    }
}
