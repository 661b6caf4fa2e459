//! Minimal admin client for table metadata and rebalances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tessera_controller::{
    Assignment, DirMetadataStore, InstanceConfig, MetadataStore, RebalanceConfig, RebalanceStatus,
    Rebalancer, RebalancerTiming, TableConfig,
};

#[derive(Parser)]
#[command(name = "tessctl")]
#[command(about = "Admin client for the Tessera table metadata store", long_about = None)]
struct Args {
    /// Root of the metadata directory.
    #[arg(long, default_value = "./metadata")]
    meta_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the ideal state and external view of a table.
    State {
        #[arg(long)]
        table: String,
    },
    /// Register or update a server instance.
    AddInstance {
        #[arg(long)]
        instance_id: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 8098)]
        port: u16,
        /// Tenant tags, e.g. `default_OFFLINE`. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Store a table config (JSON file) and seed an empty ideal state.
    AddTable {
        #[arg(long)]
        config: PathBuf,
    },
    /// Copy the ideal state assignment into the external view, standing in
    /// for the cluster controller while experimenting locally.
    SyncExternalView {
        #[arg(long)]
        table: String,
    },
    /// Rebalance a table and print the result JSON.
    Rebalance {
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        reassign_instances: bool,
        #[arg(long, default_value_t = false)]
        include_consuming: bool,
        #[arg(long, default_value_t = false)]
        downtime: bool,
        #[arg(long, default_value_t = 1)]
        min_replicas: i64,
        #[arg(long, default_value_t = false)]
        best_efforts: bool,
        /// Interval between external-view polls, in milliseconds.
        #[arg(long)]
        check_interval_ms: Option<u64>,
        /// Maximum wait for external-view convergence, in milliseconds.
        #[arg(long)]
        max_wait_ms: Option<u64>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let store = Arc::new(DirMetadataStore::open(&args.meta_dir)?);

    match args.command {
        Command::State { table } => {
            let ideal_state = store.ideal_state(&table)?;
            let external_view = store.external_view(&table)?;
            let view = serde_json::json!({
                "idealState": ideal_state,
                "externalView": external_view,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::AddInstance {
            instance_id,
            host,
            port,
            tags,
        } => {
            let mut configs = store.instance_configs()?;
            configs.retain(|config| config.instance_id != instance_id);
            configs.push(InstanceConfig {
                instance_id: instance_id.clone(),
                host,
                port,
                enabled: true,
                tags,
            });
            configs.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
            store.put_instance_configs(&configs)?;
            println!("registered instance {instance_id}");
        }
        Command::AddTable { config } => {
            let data = std::fs::read(&config)
                .with_context(|| format!("read table config {}", config.display()))?;
            let table_config: TableConfig =
                serde_json::from_slice(&data).context("parse table config")?;
            let table = table_config.name_with_type();
            store.put_table_config(&table_config)?;
            if store.ideal_state(&table)?.is_none() {
                store.set_ideal_state(&table, true, Assignment::new())?;
            }
            println!("added table {table}");
        }
        Command::SyncExternalView { table } => {
            let Some(ideal_state) = store.ideal_state(&table)? else {
                bail!("no ideal state for table {table}");
            };
            store.set_external_view(&table, ideal_state.assignment)?;
            println!("external view synced for table {table}");
        }
        Command::Rebalance {
            table,
            dry_run,
            reassign_instances,
            include_consuming,
            downtime,
            min_replicas,
            best_efforts,
            check_interval_ms,
            max_wait_ms,
        } => {
            let Some(table_config) = store.table_config(&table)? else {
                bail!("no table config stored for {table}");
            };
            let config = RebalanceConfig {
                dry_run,
                reassign_instances,
                include_consuming,
                downtime,
                min_replicas_to_keep_up_for_no_downtime: min_replicas,
                best_efforts,
            };
            let mut timing = RebalancerTiming::default();
            if let Some(ms) = check_interval_ms {
                timing.check_interval = Duration::from_millis(ms);
            }
            if let Some(ms) = max_wait_ms {
                timing.stabilization_max_wait = Duration::from_millis(ms);
            }

            let rebalancer = Rebalancer::with_timing(store, timing);
            let result = rebalancer.rebalance(&table_config, &config);
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.status == RebalanceStatus::Failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
