//! serialq CLI - run a plan of tasks through the serial queue.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serialq_core::{ClassRegistry, Config, Instance, NullDispatcher};
use serialq_execution::{DispatchMode, Scheduler, SchedulerConfig};
use serialq_storage::JsonFileStore;
use serialq_tasks::{install, Services};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "serialq")]
#[command(about = "Run tasks one at a time, in order", long_about = None)]
struct Cli {
    /// Log scheduler and task activity
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan file
    Run {
        /// JSON array of {"class": ..., "options": {...}} steps
        plan: PathBuf,
        /// Run each task on a later runtime tick
        #[arg(long)]
        deferred: bool,
        /// JSON file backing sq.Storage (in memory when omitted)
        #[arg(long)]
        store: Option<PathBuf>,
        /// Database path for sq.Db
        #[arg(long)]
        db: Option<String>,
    },
    /// List the available task classes
    Classes,
}

/// One plan entry.
#[derive(Debug, Deserialize)]
struct Step {
    class: String,
    #[serde(default)]
    options: Config,
}

/// Settings for a plan run.
#[derive(Debug, Default)]
struct RunOptions {
    deferred: bool,
    store: Option<PathBuf>,
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { plan, deferred, store, db } => {
            let tasks = run_plan(&plan, RunOptions { deferred, store, db }).await?;
            for task in &tasks {
                println!("{}", format_task(task));
            }
        }
        Commands::Classes => {
            let registry = ClassRegistry::new(Arc::new(NullDispatcher));
            install(&registry, Services::default())?;
            for name in registry.class_names() {
                let class = registry.class(&name)?;
                println!(
                    "{:<20} {:<6} {}",
                    name,
                    class.policy(),
                    class.parent().map(|p| p.name()).unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("SERIALQ_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load `plan`, queue every step and wait for the queue to drain.
async fn run_plan(plan: &Path, options: RunOptions) -> Result<Vec<Instance>> {
    let text = tokio::fs::read_to_string(plan)
        .await
        .with_context(|| format!("reading plan {}", plan.display()))?;
    let steps: Vec<Step> =
        serde_json::from_str(&text).with_context(|| format!("parsing plan {}", plan.display()))?;

    let dispatch = if options.deferred {
        DispatchMode::Deferred
    } else {
        DispatchMode::Immediate
    };
    let scheduler = Scheduler::new(SchedulerConfig::new().with_dispatch(dispatch));
    let _driver = if options.deferred {
        Some(scheduler.spawn_driver()?)
    } else {
        None
    };

    let registry = ClassRegistry::new(scheduler.dispatcher());
    let mut services = Services::default();
    if let Some(path) = &options.store {
        let store = JsonFileStore::open(path)
            .await
            .with_context(|| format!("opening store {}", path.display()))?;
        services = services.with_store(Arc::new(store));
    }
    if let Some(db) = options.db {
        services = services.with_db(Config::new().with("path", db));
    }
    install(&registry, services)?;

    let tasks = steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| {
            debug!(step = i, class = %step.class, "constructing");
            registry
                .construct(&step.class, step.options)
                .with_context(|| format!("step {i}"))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(queued = scheduler.len(), ?dispatch, "running plan");
    scheduler.set_ready(true);
    scheduler.start();
    scheduler.wait_idle().await;

    if let Some(err) = scheduler.last_error() {
        bail!("plan halted with {} task(s) still queued: {}", scheduler.len(), err);
    }
    Ok(tasks)
}

fn format_task(task: &Instance) -> String {
    let status = task.status().map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
    format!("{} {} {}", task.class_name(), status, task.results().to_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_plan(dir: &Path, plan: serde_json::Value) -> PathBuf {
        let path = dir.join("plan.json");
        std::fs::write(&path, plan.to_string()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_storage_plan_persists() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            json!([
                {"class": "sq.Storage", "options": {"action": "setItem", "key": "k", "value": [1, 2]}},
                {"class": "sq.Storage", "options": {"action": "getItem", "key": "k"}},
                {"class": "sq.Storage", "options": {"action": "length"}}
            ]),
        );
        let store = dir.path().join("store.json");

        let tasks = run_plan(
            &plan,
            RunOptions {
                store: Some(store.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let lines: Vec<_> = tasks.iter().map(format_task).collect();
        assert_eq!(
            lines,
            vec![
                "sq.Storage success [1,2]",
                "sq.Storage success [1,2]",
                "sq.Storage success 1",
            ]
        );
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store).unwrap()).unwrap();
        assert_eq!(saved, json!({"k": "[1,2]"}));
    }

    #[tokio::test]
    async fn test_deferred_plan_runs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            json!([
                {"class": "sq.Storage.Memory", "options": {"action": "setItem", "key": "a", "value": true}},
                {"class": "sq.Storage.Memory", "options": {"action": "getItem", "key": "a"}},
                {"class": "Base"}
            ]),
        );

        let tasks = run_plan(
            &plan,
            RunOptions {
                deferred: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(format_task(&tasks[1]), "sq.Storage.Memory success true");
        assert_eq!(format_task(&tasks[2]), "Base - null");
    }

    #[tokio::test]
    async fn test_structural_error_halts_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(
            dir.path(),
            json!([
                {"class": "sq.Http", "options": {}},
                {"class": "Base"}
            ]),
        );

        let err = run_plan(&plan, RunOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("1 task(s) still queued"), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_class_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let plan = write_plan(dir.path(), json!([{"class": "sq.Nope"}]));

        let err = run_plan(&plan, RunOptions::default()).await.unwrap_err();
        assert!(format!("{err:#}").contains("sq.Nope"));
    }
}
