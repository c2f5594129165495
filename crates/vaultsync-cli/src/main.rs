use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaultsync_api::{VaultSyncApi, VaultSyncConfig};
use vaultsync_core::{ContainerId, OwnerId, TransferKind};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "vs")]
#[command(about = "VaultSync CLI")]
struct Cli {
    #[arg(long, default_value = "./vaultsync.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Inventory {
        #[command(subcommand)]
        command: InventoryCommand,
    },
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },
    Transfer {
        #[command(subcommand)]
        command: TransferCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum InventoryCommand {
    /// Seed records and containers from a snapshot file.
    Import(SnapshotArgs),
}

#[derive(Debug, Args)]
struct SnapshotArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    snapshot: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ContainerCommand {
    Create(ContainerCreateArgs),
    List(OwnerArgs),
    History(ContainerRefArgs),
}

#[derive(Debug, Args)]
struct OwnerArgs {
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Args)]
struct ContainerCreateArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct ContainerRefArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    container: ContainerId,
}

#[derive(Debug, Subcommand)]
enum TransferCommand {
    Deposit(TransferArgs),
    Withdraw(TransferArgs),
}

#[derive(Debug, Args)]
struct TransferArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    container: ContainerId,
    #[arg(long)]
    snapshot: PathBuf,
    /// Execute the preview right away instead of only printing it.
    #[arg(long, default_value_t = false)]
    confirm: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn parse_owner(raw: &str) -> Result<OwnerId> {
    Ok(OwnerId::parse(raw)?)
}

fn read_snapshot(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot file {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    debug!(db = %cli.db.display(), "opening vaultsync database");
    let api = VaultSyncApi::new(VaultSyncConfig::new(cli.db));
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Inventory { command } => run_inventory(command, &api),
        Command::Container { command } => run_container(command, &api),
        Command::Transfer { command } => run_transfer(command, &api),
    }
}

fn run_db(command: DbCommand, api: &VaultSyncApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let healthy = report.quick_check_ok
                && report.foreign_key_violations.is_empty()
                && report.count_drift.is_empty();
            let mut value = serde_json::to_value(&report)?;
            if let Value::Object(object) = &mut value {
                object.insert("healthy".to_string(), Value::Bool(healthy));
            }
            emit_json(value)
        }
    }
}

fn run_inventory(command: InventoryCommand, api: &VaultSyncApi) -> Result<()> {
    match command {
        InventoryCommand::Import(args) => {
            let owner = parse_owner(&args.owner)?;
            let text = read_snapshot(&args.snapshot)?;
            emit(&api.import_inventory(&owner, &text)?)
        }
    }
}

fn run_container(command: ContainerCommand, api: &VaultSyncApi) -> Result<()> {
    match command {
        ContainerCommand::Create(args) => {
            let owner = parse_owner(&args.owner)?;
            emit(&api.create_container(&owner, &args.name)?)
        }
        ContainerCommand::List(args) => {
            let owner = parse_owner(&args.owner)?;
            let containers = api.list_containers(&owner)?;
            emit_json(serde_json::json!({
                "owner": owner,
                "containers": containers
            }))
        }
        ContainerCommand::History(args) => {
            let owner = parse_owner(&args.owner)?;
            let entries = api.container_history(&owner, args.container)?;
            emit_json(serde_json::json!({
                "container_id": args.container,
                "entries": entries
            }))
        }
    }
}

fn run_transfer(command: TransferCommand, api: &VaultSyncApi) -> Result<()> {
    let (kind, args) = match command {
        TransferCommand::Deposit(args) => (TransferKind::Deposit, args),
        TransferCommand::Withdraw(args) => (TransferKind::Withdraw, args),
    };
    let owner = parse_owner(&args.owner)?;
    let text = read_snapshot(&args.snapshot)?;

    let preview = api.prepare_preview(&owner, args.container, &text, kind)?;
    if !args.confirm {
        return emit_json(serde_json::json!({ "preview": preview, "result": null }));
    }

    let result = api.execute(&owner, args.container, kind, preview.token)?;
    emit_json(serde_json::json!({ "preview": preview, "result": result }))
}
