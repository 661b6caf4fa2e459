//! Versioned metadata store gateway and the JSON-directory implementation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::TableConfig;
use crate::state::{
    uniform_replica_count, Assignment, ExternalView, IdealState, InstanceConfig,
    InstancePartitions,
};

/// Outcome of a compare-and-set against the stored record version. Fatal
/// store failures are reported through `Err`, never through this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed,
    VersionMismatch,
}

/// Gateway to the cluster coordination store. All reads are point reads with
/// no caching; the only write to the ideal state is a compare-and-set.
pub trait MetadataStore: Send + Sync {
    fn ideal_state(&self, table: &str) -> Result<Option<IdealState>>;

    /// Atomically replace the ideal state if its stored version still equals
    /// `expected_version`. On commit the stored version becomes
    /// `expected_version + 1`; the version carried inside `record` is ignored.
    fn cas_ideal_state(
        &self,
        table: &str,
        record: &IdealState,
        expected_version: u64,
    ) -> Result<CasOutcome>;

    fn external_view(&self, table: &str) -> Result<Option<ExternalView>>;

    fn instance_configs(&self) -> Result<Vec<InstanceConfig>>;

    fn instance_partitions(&self, name: &str) -> Result<Option<InstancePartitions>>;

    fn persist_instance_partitions(&self, partitions: &InstancePartitions) -> Result<()>;

    fn remove_instance_partitions(&self, name: &str) -> Result<()>;
}

/// Metadata store backed by a directory of JSON records:
///
/// ```text
/// <root>/ideal_states/{table}.json
/// <root>/external_views/{table}.json
/// <root>/instance_configs.json
/// <root>/instance_partitions/{name}.json
/// <root>/table_configs/{table}.json
/// ```
///
/// A process-wide mutex serializes mutations so the compare-and-set is
/// atomic. The admin-side setters are inherent methods, not part of the
/// gateway trait: the rebalancer itself never writes external views or
/// table configs.
pub struct DirMetadataStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirMetadataStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in [
            "ideal_states",
            "external_views",
            "instance_partitions",
            "table_configs",
        ] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("create metadata dir {}", root.join(sub).display()))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ideal_state_path(&self, table: &str) -> PathBuf {
        self.root.join("ideal_states").join(format!("{table}.json"))
    }

    fn external_view_path(&self, table: &str) -> PathBuf {
        self.root
            .join("external_views")
            .join(format!("{table}.json"))
    }

    fn instance_partitions_path(&self, name: &str) -> PathBuf {
        self.root
            .join("instance_partitions")
            .join(format!("{name}.json"))
    }

    fn table_config_path(&self, table: &str) -> PathBuf {
        self.root.join("table_configs").join(format!("{table}.json"))
    }

    fn instance_configs_path(&self) -> PathBuf {
        self.root.join("instance_configs.json")
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", path.display()));
            }
        };
        let value = serde_json::from_slice(&data)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value).context("serialize metadata record")?;
        fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Blind admin write of the ideal state, bumping the stored version.
    /// Used by `tessctl` and tests to seed or mutate tables out of band.
    pub fn set_ideal_state(
        &self,
        table: &str,
        enabled: bool,
        assignment: Assignment,
    ) -> Result<IdealState> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.ideal_state_path(table);
        let version = Self::read_json::<IdealState>(&path)?
            .map(|record| record.version + 1)
            .unwrap_or(0);
        let record = IdealState {
            version,
            enabled,
            num_partitions: assignment.len(),
            replicas: uniform_replica_count(&assignment).unwrap_or(0),
            assignment,
        };
        Self::write_json(&path, &record)?;
        Ok(record)
    }

    /// Admin write of the external view, standing in for the cluster
    /// controller that normally reports it.
    pub fn set_external_view(&self, table: &str, assignment: Assignment) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        Self::write_json(&self.external_view_path(table), &ExternalView { assignment })
    }

    /// Drop the ideal state and external view of a table.
    pub fn remove_table(&self, table: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        for path in [self.ideal_state_path(table), self.external_view_path(table)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", path.display()));
                }
            }
        }
        Ok(())
    }

    pub fn put_instance_configs(&self, configs: &[InstanceConfig]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        Self::write_json(&self.instance_configs_path(), &configs)
    }

    pub fn put_table_config(&self, config: &TableConfig) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        Self::write_json(&self.table_config_path(&config.name_with_type()), config)
    }

    pub fn table_config(&self, table: &str) -> Result<Option<TableConfig>> {
        Self::read_json(&self.table_config_path(table))
    }
}

impl MetadataStore for DirMetadataStore {
    fn ideal_state(&self, table: &str) -> Result<Option<IdealState>> {
        Self::read_json(&self.ideal_state_path(table))
    }

    fn cas_ideal_state(
        &self,
        table: &str,
        record: &IdealState,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.ideal_state_path(table);
        let Some(stored) = Self::read_json::<IdealState>(&path)? else {
            bail!("no ideal state for table {table}");
        };
        if stored.version != expected_version {
            return Ok(CasOutcome::VersionMismatch);
        }
        let committed = IdealState {
            version: expected_version + 1,
            ..record.clone()
        };
        Self::write_json(&path, &committed)?;
        Ok(CasOutcome::Committed)
    }

    fn external_view(&self, table: &str) -> Result<Option<ExternalView>> {
        Self::read_json(&self.external_view_path(table))
    }

    fn instance_configs(&self) -> Result<Vec<InstanceConfig>> {
        Ok(Self::read_json(&self.instance_configs_path())?.unwrap_or_default())
    }

    fn instance_partitions(&self, name: &str) -> Result<Option<InstancePartitions>> {
        Self::read_json(&self.instance_partitions_path(name))
    }

    fn persist_instance_partitions(&self, partitions: &InstancePartitions) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        Self::write_json(&self.instance_partitions_path(&partitions.name), partitions)
    }

    fn remove_instance_partitions(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        match fs::remove_file(self.instance_partitions_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove instance partitions {name}")),
        }
    }
}
