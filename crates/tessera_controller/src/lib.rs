//! Controller-side table rebalancer for the Tessera segment store.
//!
//! Cluster state lives in a versioned metadata store as two records per
//! table: the ideal state (the desired segment placement, owned by the
//! controller) and the external view (the placement servers actually report).
//! The rebalancer computes a target placement from the table's instance
//! partitions and walks the ideal state toward it, either in one step with
//! downtime or in availability-preserving steps that wait for the external
//! view to catch up in between.

pub mod assignment;
pub mod config;
pub mod instance;
pub mod rebalance;
pub mod state;
pub mod store;

pub use config::{InstanceAssignmentConfig, RebalanceConfig, TableConfig, TableType};
pub use rebalance::{
    RebalanceResult, RebalanceStatus, Rebalancer, RebalancerTiming, EXTERNAL_VIEW_CHECK_INTERVAL,
    EXTERNAL_VIEW_STABILIZATION_MAX_WAIT,
};
pub use state::{
    Assignment, ExternalView, IdealState, InstanceConfig, InstancePartitions,
    InstancePartitionsType, InstanceStateMap, SegmentState,
};
pub use store::{CasOutcome, DirMetadataStore, MetadataStore};
