//! tenantdb CLI - operator tooling for the per-tenant database broker

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tenantdb::config::{self, BrokerConfig};
use tenantdb::ui::{self, Icons};
use tenantdb::{CheckMode, ConnectionBroker, PathResolver, RecoveryOutcome, StaticRegistry, TenantHandle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Code unit the CLI registers under when acting for a tenant
const CLI_UNIT: &str = "tenantdb-cli";

#[derive(Parser)]
#[command(name = "tenantdb")]
#[command(version)]
#[command(about = "Inspect, verify and repair per-tenant SQLite databases")]
#[command(long_about = r#"
tenantdb manages the per-tenant databases a host keeps under
<root>/ModData/DatabaseManager/<tenant>/<database>.sqlite, enabling:
  • Path and connection-target lookup
  • Quick or full integrity checks
  • Backup-then-repair recovery
  • An inventory of every database on disk

Example usage:
  tenantdb --root ./data list
  tenantdb --root ./data check --tenant my.plugin --full
  tenantdb --root ./data recover --tenant my.plugin --database cache
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Path to the config file (defaults to ./tenantdb.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Host data root, overriding the config file
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Target {
    /// Tenant id
    #[arg(short, long)]
    tenant: String,

    /// Database name (defaults to the configured default, usually "main")
    #[arg(short, long)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the resolved database path
    Path {
        #[command(flatten)]
        target: Target,
    },

    /// Print the engine connection target
    Target {
        #[command(flatten)]
        target: Target,
    },

    /// Run an integrity check
    Check {
        #[command(flatten)]
        target: Target,

        /// Run the full integrity check instead of the quick one
        #[arg(long)]
        full: bool,
    },

    /// Back up and attempt to repair a database
    Recover {
        #[command(flatten)]
        target: Target,
    },

    /// Open through the broker, running first-open validation
    Open {
        #[command(flatten)]
        target: Target,
    },

    /// List every database under the root
    List,
}

#[derive(Debug, Clone, Copy)]
enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    fn is_human(self) -> bool {
        matches!(self, OutputMode::Human)
    }
}

fn emit_success(output_mode: OutputMode, command: &str, data: serde_json::Value) -> anyhow::Result<()> {
    if let OutputMode::Json = output_mode {
        let envelope = serde_json::json!({
            "ok": true,
            "command": command,
            "data": data,
        });
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    }
    Ok(())
}

fn load_settings(cli: &Cli) -> anyhow::Result<BrokerConfig> {
    let mut settings = config::load_config(cli.config.as_deref())?.unwrap_or_default();
    if let Some(root) = &cli.root {
        settings.data_root = root.clone();
    }
    Ok(settings)
}

/// Start a broker that recognises the CLI as the given tenant
fn broker_for(settings: &BrokerConfig, tenant: &str) -> anyhow::Result<(ConnectionBroker, TenantHandle)> {
    let registry = StaticRegistry::new().with_tenant(tenant, [CLI_UNIT]);
    let broker = ConnectionBroker::new(settings.clone(), registry)?;
    let handle = broker.register(CLI_UNIT)?;
    Ok((broker, handle))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let output_mode = if cli.json { OutputMode::Json } else { OutputMode::Human };
    let settings = load_settings(&cli)?;

    match &cli.command {
        Commands::Init { force } => {
            let path = cli.config.clone().unwrap_or_else(config::default_config_path);
            config::write_config(&path, &settings, *force)?;
            if output_mode.is_human() {
                ui::success(&format!("Wrote {}", path.display()));
            }
            emit_success(output_mode, "init", serde_json::json!({ "path": path }))?;
        }

        Commands::Path { target } => {
            let (broker, handle) = broker_for(&settings, &target.tenant)?;
            let path = broker.resolve_path(&handle, target.database.as_deref())?;
            if output_mode.is_human() {
                println!("{}", path.display());
            }
            emit_success(output_mode, "path", serde_json::json!({ "path": path }))?;
        }

        Commands::Target { target } => {
            let (broker, handle) = broker_for(&settings, &target.tenant)?;
            let connection_target = broker.connection_target(&handle, target.database.as_deref())?;
            if output_mode.is_human() {
                println!("{}", connection_target);
            }
            emit_success(output_mode, "target", serde_json::json!({ "target": connection_target }))?;
        }

        Commands::Check { target, full } => {
            let (broker, handle) = broker_for(&settings, &target.tenant)?;
            let mode = if *full { CheckMode::Full } else { CheckMode::Quick };
            let ok = broker.check_integrity_with(&handle, target.database.as_deref(), mode);

            if output_mode.is_human() {
                if ok {
                    ui::success(&format!("{} passed", mode));
                } else {
                    ui::error(&format!("{} failed", mode));
                }
            }
            emit_success(output_mode, "check", serde_json::json!({ "mode": mode.to_string(), "passed": ok }))?;
            if !ok {
                anyhow::bail!("integrity check failed for tenant '{}'", target.tenant);
            }
        }

        Commands::Recover { target } => {
            let (broker, handle) = broker_for(&settings, &target.tenant)?;
            let outcome = broker.recover_with_outcome(&handle, target.database.as_deref())?;

            if output_mode.is_human() {
                ui::header(&format!("Recovery for tenant '{}'", target.tenant));
                match &outcome {
                    RecoveryOutcome::NothingToRecover => ui::success("No database file; nothing to recover"),
                    RecoveryOutcome::Repaired { pass, .. } => ui::success(&format!("Repaired by {}", pass)),
                    RecoveryOutcome::BackupFailed => ui::error("Backup failed; no repair attempted"),
                    RecoveryOutcome::Unrepairable { .. } => ui::error("Both repair passes failed"),
                }
                if let Some(backup) = outcome.backup() {
                    println!("{} Backup: {}", Icons::PACKAGE, backup.display());
                }
            }
            emit_success(output_mode, "recover", serde_json::to_value(&outcome)?)?;
            if !outcome.is_success() {
                anyhow::bail!("recovery failed for tenant '{}'", target.tenant);
            }
        }

        Commands::Open { target } => {
            let (broker, handle) = broker_for(&settings, &target.tenant)?;
            let conn = broker.open(&handle, target.database.as_deref())?;
            let journal_mode: String = conn.with(|c| c.query_row("PRAGMA journal_mode", [], |row| row.get(0)))?;
            let tables: i64 = conn.with(|c| {
                c.query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |row| row.get(0))
            })?;

            if output_mode.is_human() {
                ui::success(&format!("Opened {}", conn.path().display()));
                ui::summary_row("Journal mode:", &journal_mode);
                ui::summary_row("Tables:", &tables.to_string());
                let backups = broker.backups(&handle, target.database.as_deref())?;
                ui::info("Backups", &backups.len().to_string());
            }
            emit_success(
                output_mode,
                "open",
                serde_json::json!({
                    "path": conn.path(),
                    "journal_mode": journal_mode,
                    "tables": tables,
                }),
            )?;
            broker.dispose();
        }

        Commands::List => {
            let resolver = PathResolver::new(&settings.data_root)?;
            let entries = resolver.inventory()?;

            if output_mode.is_human() {
                ui::header(&format!("Databases under {}", resolver.root().display()));
                if entries.is_empty() {
                    println!("{}", ui::dim("  (none)"));
                } else {
                    println!("{}", ui::inventory_table(&entries));
                    let stale_wal = entries.iter().filter(|e| e.has_wal).count();
                    if stale_wal > 0 {
                        ui::warn(&format!(
                            "{} database(s) have a WAL sidecar (in use or not cleanly closed)",
                            stale_wal
                        ));
                    }
                }
            }
            emit_success(output_mode, "list", serde_json::to_value(&entries)?)?;
        }
    }

    Ok(())
}
