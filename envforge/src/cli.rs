//! Command line interface.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use envforge::cancellation::CancellationToken;
use envforge::catalog::{default_catalog_path, Catalog};
use envforge::config::{LogFormat, ProvisionConfig};
use envforge::executor::ProcessExecutor;
use envforge::health::{HealthReport, HealthServer, HealthService};
use envforge::manifest::{default_manifest_path, FileManifestStore, ManifestStore};
use envforge::pipeline::{default_concurrency, FailureMode, Runner, StageGraph};
use envforge::platform::{Platform, ARCH_ALIASES, OS_ALIASES};
use envforge::probe::BuiltinProbe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Dependency-aware provisioning orchestrator.
#[derive(Debug, Parser)]
#[command(name = "envforge", version, about, long_about = None)]
pub struct Cli {
    /// Log output format.
    #[arg(long, global = true, env = "ENVFORGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the catalog's stages until the environment is ready or failed.
    Provision(ProvisionArgs),
    /// Print the health report of a manifest.
    Health(HealthArgs),
    /// Serve `GET /health` over a manifest file.
    Serve(ServeArgs),
    /// Print the resolved target platform and the accepted aliases.
    Platform(PlatformArgs),
}

/// `envforge provision` flags.
#[derive(Debug, Args)]
pub struct ProvisionArgs {
    /// Stage catalog (TOML, or JSON by extension).
    #[arg(long, env = "ENVFORGE_CATALOG", default_value_os_t = default_catalog_path())]
    pub catalog: PathBuf,

    /// Manifest file.
    #[arg(long, env = "ENVFORGE_MANIFEST", default_value_os_t = default_manifest_path())]
    pub manifest: PathBuf,

    /// Maximum number of stage actions running at once.
    #[arg(long, env = "ENVFORGE_CONCURRENCY", default_value_t = default_concurrency())]
    pub concurrency: usize,

    /// Target platform id (`<os>-<arch>`); detected when unset.
    #[arg(long, env = "ENVFORGE_PLATFORM")]
    pub platform: Option<String>,

    /// Print the execution plan without running anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Continue the recorded run, skipping stages that still hold.
    #[arg(long, conflicts_with = "force")]
    pub resume: bool,

    /// Ignore the recorded run and execute every stage.
    #[arg(long)]
    pub force: bool,

    /// Keep running unrelated stages after a required stage fails.
    #[arg(long)]
    pub continue_on_error: bool,

    /// Serve `GET /health` on this address while provisioning.
    #[arg(long, value_name = "ADDR")]
    pub serve: Option<String>,
}

impl ProvisionArgs {
    fn into_config(self) -> Result<ProvisionConfig> {
        let config = ProvisionConfig {
            catalog_path: self.catalog,
            manifest_path: self.manifest,
            concurrency: self.concurrency,
            platform: Platform::resolve(self.platform.as_deref()),
            dry_run: self.dry_run,
            preparation: ProvisionConfig::preparation_from_flags(self.resume, self.force)?,
            failure_mode: FailureMode::from_flag(self.continue_on_error),
            serve: self.serve,
        };
        config.validate()?;
        Ok(config)
    }
}

/// `envforge health` flags.
#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Manifest file.
    #[arg(long, env = "ENVFORGE_MANIFEST", default_value_os_t = default_manifest_path())]
    pub manifest: PathBuf,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// `envforge serve` flags.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Manifest file.
    #[arg(long, env = "ENVFORGE_MANIFEST", default_value_os_t = default_manifest_path())]
    pub manifest: PathBuf,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: String,
}

/// `envforge platform` flags.
#[derive(Debug, Args)]
pub struct PlatformArgs {
    /// Platform id to resolve instead of the detected one.
    #[arg(long, env = "ENVFORGE_PLATFORM")]
    pub platform: Option<String>,
}

/// Runs a parsed command line and returns the process exit code.
pub async fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Command::Provision(args) => provision(args.into_config()?).await,
        Command::Health(args) => health(args).await,
        Command::Serve(args) => serve(args).await,
        Command::Platform(args) => {
            platform(&args);
            Ok(0)
        }
    }
}

async fn provision(config: ProvisionConfig) -> Result<u8> {
    info!(
        catalog = %config.catalog_path.display(),
        manifest = %config.manifest_path.display(),
        platform = %config.platform,
        "Loading catalog"
    );
    let catalog = Catalog::load(&config.catalog_path, &config.platform)
        .map_err(envforge::errors::EnvforgeError::from)
        .with_context(|| format!("loading catalog {}", config.catalog_path.display()))?;

    let graph = Arc::new(StageGraph::new(catalog));
    let store: Arc<dyn ManifestStore> = Arc::new(FileManifestStore::new(&config.manifest_path));
    let cancel = Arc::new(CancellationToken::new());
    let runner = Runner::new(
        graph,
        Arc::new(ProcessExecutor::new(config.platform.clone())),
        Arc::new(BuiltinProbe::new()),
        store.clone(),
    )
    .with_options(config.run_options())
    .with_cancellation(cancel.clone());

    if config.dry_run {
        let plan = runner.plan().await.context("computing the execution plan")?;
        print!("{plan}");
        return Ok(0);
    }

    let interrupt = cancel.clone();
    let interrupt_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the run");
            interrupt.cancel("interrupted");
        }
    });

    let server = match &config.serve {
        Some(addr) => {
            let server = HealthServer::bind(addr, HealthService::new(store.clone()))
                .await
                .with_context(|| format!("binding health endpoint on {addr}"))?;
            let (stop, stopped) = oneshot::channel::<()>();
            let handle = tokio::spawn(server.run(async move {
                let _ = stopped.await;
            }));
            Some((stop, handle))
        }
        None => None,
    };

    let result = runner.run().await;
    interrupt_task.abort();
    if let Some((stop, handle)) = server {
        let _ = stop.send(());
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "Health endpoint failed"),
            Err(e) => warn!(error = %e, "Health endpoint task failed"),
            Ok(Ok(())) => {}
        }
    }
    let report = result.context("provisioning run aborted")?;

    println!(
        "Provisioning {} in {:.1}s ({} actions, run {})",
        report.outcome,
        report.duration.as_secs_f64(),
        report.actions_executed,
        report.run_id
    );
    print!("{}", HealthReport::from_manifest(&report.manifest));
    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

async fn health(args: HealthArgs) -> Result<u8> {
    let service = HealthService::new(Arc::new(FileManifestStore::new(&args.manifest)));
    let report = service.check().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

async fn serve(args: ServeArgs) -> Result<u8> {
    let service = HealthService::new(Arc::new(FileManifestStore::new(&args.manifest)));
    let server = HealthServer::bind(&args.addr, service)
        .await
        .with_context(|| format!("binding health endpoint on {}", args.addr))?;
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving health endpoint")?;
    Ok(0)
}

fn platform(args: &PlatformArgs) {
    let platform = Platform::resolve(args.platform.as_deref());
    println!("{platform}");
    println!("os: {}", platform.os);
    println!("arch: {}", platform.arch);
    println!("os aliases:");
    for (alias, canonical) in OS_ALIASES.iter().filter(|(a, c)| a != c) {
        println!("  {alias} -> {canonical}");
    }
    println!("arch aliases:");
    for (alias, canonical) in ARCH_ALIASES.iter().filter(|(a, c)| a != c) {
        println!("  {alias} -> {canonical}");
    }
}
