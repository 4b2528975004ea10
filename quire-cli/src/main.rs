//! Quire command line.
//!
//! `serve` runs the sync server with periodic resource reports,
//! `revert` restores documents from a manifest through a running server,
//! and `audit-migrations` checks every migration against its fixtures.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use quire_sync::collections::SYSTEM_ADMIN;
use quire_sync::monitor::default_report_dir;
use quire_sync::store::DocumentStore;
use quire_sync::{
    audit, default_access, default_collections, default_fixtures, default_migrations, Credentials, CsvReportSink,
    EngineConfig, MemoryStore, MonitorConfig, ResourceMonitor, RevertManifest, RocksStore, ServerConfig, Session,
    SnapshotReverter, StoreConfig, SyncClient, SyncEngine, SyncServer, TokenAuthenticator,
};

#[derive(Parser)]
#[command(name = "quire", author, version, about = "Realtime document sync server and tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket sync server
    Serve {
        #[arg(long, env = "QUIRE_BIND", default_value = "127.0.0.1:9090")]
        bind: String,
        /// RocksDB directory
        #[arg(long, env = "QUIRE_DATA_DIR", default_value = "quire_data")]
        data_dir: PathBuf,
        /// Keep documents in memory only
        #[arg(long)]
        memory: bool,
        /// Seconds between resource reports
        #[arg(long, default_value_t = 1800)]
        monitor_interval_secs: u64,
        /// Directory for resource-usage.csv
        #[arg(long)]
        reports_dir: Option<PathBuf>,
        /// Skip the startup migration sweep
        #[arg(long)]
        migrations_disabled: bool,
        /// JSON object mapping client tokens to sessions
        #[arg(long, env = "QUIRE_TOKENS_FILE")]
        tokens: Option<PathBuf>,
        /// Token that authenticates administrative tools as a system admin
        #[arg(long, env = "QUIRE_ADMIN_TOKEN", hide_env_values = true)]
        admin_token: Option<String>,
    },
    /// Revert the documents listed in a manifest to historical versions
    Revert {
        #[arg(long, env = "QUIRE_SERVER", default_value = "ws://127.0.0.1:9090")]
        server: String,
        /// JSON list of {"collection", "id", "version"} entries
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, help = "Plan the reverts without submitting them")]
        dry_run: bool,
        /// Admin token configured on the server
        #[arg(long, env = "QUIRE_ADMIN_TOKEN", hide_env_values = true)]
        admin_token: String,
    },
    /// Check every registered migration against its fixtures
    AuditMigrations,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            bind,
            data_dir,
            memory,
            monitor_interval_secs,
            reports_dir,
            migrations_disabled,
            tokens,
            admin_token,
        } => {
            let store = if memory { None } else { Some(data_dir) };
            let options = ServeOptions {
                bind,
                data_dir: store,
                monitor_interval_secs,
                reports_dir,
                migrations_disabled,
                tokens,
                admin_token,
            };
            serve(options).await
        }
        Commands::Revert {
            server,
            manifest,
            dry_run,
            admin_token,
        } => revert(&server, manifest, dry_run, Credentials::token(admin_token)).await,
        Commands::AuditMigrations => audit_migrations(),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn load_tokens(path: Option<PathBuf>, admin_token: Option<String>) -> Result<TokenAuthenticator> {
    let mut authenticator = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            TokenAuthenticator::from_json(&text).with_context(|| format!("invalid token file {}", path.display()))?
        }
        None => TokenAuthenticator::new(),
    };
    if let Some(token) = admin_token {
        authenticator = authenticator.with_token(token, Session::user("quire-admin", SYSTEM_ADMIN));
    }
    if authenticator.is_empty() {
        warn!("No client tokens configured; every socket connection will be rejected");
    }
    Ok(authenticator)
}

struct ServeOptions {
    bind: String,
    /// `None` keeps documents in memory.
    data_dir: Option<PathBuf>,
    monitor_interval_secs: u64,
    reports_dir: Option<PathBuf>,
    migrations_disabled: bool,
    tokens: Option<PathBuf>,
    admin_token: Option<String>,
}

async fn serve(options: ServeOptions) -> Result<bool> {
    let ServeOptions {
        bind,
        data_dir,
        monitor_interval_secs,
        reports_dir,
        migrations_disabled,
        tokens,
        admin_token,
    } = options;
    let authenticator = load_tokens(tokens, admin_token).await?;
    let registry = default_migrations().context("invalid migration registry")?;
    let report = audit(&registry, &default_fixtures());
    if !report.is_success() {
        bail!("migration audit failed:\n{report}");
    }

    let store: Arc<dyn DocumentStore> = match data_dir {
        Some(path) => {
            info!("Opening document store at {}", path.display());
            let config = StoreConfig {
                path,
                ..StoreConfig::default()
            };
            Arc::new(RocksStore::open(config).context("failed to open document store")?)
        }
        None => {
            warn!("Running with an in-memory store; documents are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = SyncEngine::builder()
        .store(store)
        .collections(default_collections())
        .access(default_access())
        .migrations(registry)
        .config(EngineConfig {
            migrations_disabled,
            ..EngineConfig::default()
        })
        .build()?;
    let migrated = engine
        .migrate_if_necessary()
        .await
        .context("startup migration failed")?;
    if migrated > 0 {
        info!("Migrated {migrated} document(s) at startup");
    }

    let reports_dir = reports_dir.unwrap_or_else(default_report_dir);
    info!("Writing resource reports under {}", reports_dir.display());
    let monitor = ResourceMonitor::new(
        engine.connections().clone(),
        Arc::new(CsvReportSink::new(reports_dir)),
        MonitorConfig {
            interval: Duration::from_secs(monitor_interval_secs.max(1)),
            ..MonitorConfig::default()
        },
    )
    .start();

    let server = SyncServer::new(
        ServerConfig {
            bind_addr: bind,
            authenticator: Arc::new(authenticator),
            ..ServerConfig::default()
        },
        engine,
    );
    let served = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await
        .map_err(|e| anyhow!("server failed: {e}"));

    monitor.stop().await;
    served?;
    let stats = server.stats().await;
    info!(
        "Served {} connection(s), {} message(s)",
        stats.total_connections, stats.total_messages
    );
    Ok(true)
}

async fn revert(server: &str, manifest_path: PathBuf, dry_run: bool, credentials: Credentials) -> Result<bool> {
    let text = tokio::fs::read_to_string(&manifest_path)
        .await
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest = RevertManifest::from_json(&text)
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;
    if manifest.is_empty() {
        warn!("Manifest {} lists no documents", manifest_path.display());
        return Ok(true);
    }

    let mut client = SyncClient::new(server, credentials);
    client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    let registry = default_migrations().context("invalid migration registry")?;
    let reverter = SnapshotReverter::new(client, registry);

    info!(
        "Reverting {} document(s){}",
        manifest.len(),
        if dry_run { " (dry run)" } else { "" }
    );
    let summary = reverter.revert_manifest(&manifest, dry_run).await;
    for (target, version) in &summary.reverted {
        info!("{target} -> v{version}");
    }
    for (target, e) in &summary.failed {
        error!("{target}: {e}");
    }
    info!("{summary}");

    let mut client = reverter.into_service();
    client.close().await;
    Ok(summary.is_success())
}

fn audit_migrations() -> Result<bool> {
    let registry = default_migrations().context("invalid migration registry")?;
    let report = audit(&registry, &default_fixtures());
    for line in report.to_string().lines() {
        if report.is_success() {
            info!("{line}");
        } else {
            error!("{line}");
        }
    }
    Ok(report.is_success())
}
