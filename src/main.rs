use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use slice_orchestrator::model::{Slice, VmState};
use slice_orchestrator::{
    CloudDriver, ClusterDriver, Config, DeleteOutcome, PgStore, PlacementScheduler,
    ResourceStore, SliceDocuments, SliceOrchestrator,
};

#[derive(Parser)]
#[command(name = "slice-orchestrator")]
#[command(about = "Places and provisions VM slices on a Linux cluster or a cloud control plane")]
struct Cli {
    #[arg(short, long, default_value = "config/slicer.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule and provision a topology file
    Create { topology: PathBuf },
    /// Store a topology file as a saved slice without provisioning it
    Save { topology: PathBuf },
    /// Provision the nodes of a saved slice that are not running yet
    Update { name: String },
    /// Delete a slice whose VMs are all inactive
    Delete { name: String },
    /// Show persisted and live VM state
    Status { name: String },
    /// Record a VM's run state
    VmState {
        slice: String,
        vm: String,
        #[arg(value_enum)]
        state: StateArg,
    },
    /// Pull hypervisor capacity from the cloud into a zone
    RefreshHypervisors { zone: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Active,
    Inactive,
}

impl From<StateArg> for VmState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Active => VmState::Active,
            StateArg::Inactive => VmState::Inactive,
        }
    }
}

async fn read_topology(path: &Path) -> Result<Slice> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    let pg = PgStore::connect(&config.database)
        .await
        .context("connecting to the resource database")?;
    pg.migrate().await.context("applying migrations")?;
    let store: Arc<dyn ResourceStore> = Arc::new(pg);

    let cloud = Arc::new(CloudDriver::new(&config, store.clone())?);
    let orchestrator = SliceOrchestrator::new(
        store.clone(),
        PlacementScheduler::new(&config.scheduler),
        SliceDocuments::new(config.paths.slices_dir.clone()),
    )
    .with_driver(Arc::new(ClusterDriver::new(&config, store.clone())?))
    .with_driver(cloud.clone());

    match cli.command {
        Command::Create { topology } => {
            let mut slice = read_topology(&topology).await?;
            let report = orchestrator.create_topology(&mut slice).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Save { topology } => {
            let slice = read_topology(&topology).await?;
            orchestrator.save_slice(&slice).await?;
            info!("Saved slice {}", slice.name);
        }
        Command::Update { name } => {
            let mut slice = orchestrator.load_slice(&name).await?;
            let report = orchestrator.update_slice(&mut slice).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Delete { name } => {
            let mut slice = orchestrator.load_slice(&name).await?;
            let outcome = orchestrator.delete_slice(&mut slice).await?;
            println!("{}", outcome.message());
            if !matches!(outcome, DeleteOutcome::Deleted { .. }) {
                std::process::exit(2);
            }
        }
        Command::Status { name } => {
            let backend = match store.slice(&name).await? {
                Some(record) => record.backend,
                None => bail!("slice {name} is not registered"),
            };
            let report = orchestrator.status(&name, backend).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::VmState { slice, vm, state } => {
            orchestrator.set_vm_state(&slice, &vm, state.into()).await?;
        }
        Command::RefreshHypervisors { zone } => {
            let workers = cloud.refresh_hypervisors(&zone).await?;
            info!("Refreshed {} workers in zone {}", workers.len(), zone);
        }
    }

    Ok(())
}
