//! Ephemeral Environments CLI
//!
//! Handles lifecycle requests and runs the reconciliation sweep.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use ephemeral_env::aws::AwsCli;
use ephemeral_env::locks::KeyedLocks;
use ephemeral_env::{
    parse_requests, AwsComputeProvider, BootstrapRunner, ComputeManager, DeployOrchestrator,
    EnvironmentKey, FileStateStore, GhCliReviewHost, OrchestratorConfig,
    QuickTunnelProvisioner, Reconciler, Result, SecretsResolver, Services,
    SsmCommandChannel, StateStore, Validate,
};

#[derive(Parser)]
#[command(name = "ephemeral-env", about = "Per-pull-request preview environments")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "EPHEMERAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Handle lifecycle requests read from FILE (or stdin)
    Handle {
        /// JSON request, array of requests, or batch envelope
        file: Option<PathBuf>,
    },
    /// Run the reconciliation sweep
    Reconcile {
        /// Sweep once and print the stats instead of looping
        #[arg(long)]
        once: bool,
    },
    /// Print an environment record and its builds
    Status {
        /// Repository as owner/name
        repo: String,
        /// Pull request number
        pr: u64,
    },
    /// Validate the configuration and exit
    CheckConfig,
}

fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    if std::env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = OrchestratorConfig::load(cli.config.as_deref())?;
    for warning in config.validate().into_result()? {
        tracing::warn!(%warning, "configuration warning");
    }
    let config = Arc::new(config);

    match cli.command {
        Command::CheckConfig => {
            println!("configuration ok");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { repo, pr } => {
            let store = FileStateStore::open(config.paths.state_dir.clone()).await?;
            let key = EnvironmentKey::new(repo, pr);
            let environment = store.get_environment(&key).await?;
            let builds = store.list_builds(&key.to_string()).await?;
            let report = serde_json::json!({ "environment": environment, "builds": builds });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Handle { file } => {
            let input = match file {
                Some(path) => std::fs::read_to_string(&path)?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let requests = parse_requests(&input)?;
            let orchestrator = DeployOrchestrator::new(config.clone(), services(&config).await?);

            let mut failed = false;
            for request in &requests {
                match orchestrator.handle(request).await {
                    Ok(outcome) => {
                        println!("{}: {}", request.key(), outcome);
                        failed |= outcome.is_failure();
                    }
                    Err(e) => {
                        eprintln!("{}: {}", request.key(), e);
                        failed = true;
                    }
                }
            }
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Command::Reconcile { once } => {
            let reconciler = Reconciler::new(config.clone(), services(&config).await?);
            if once {
                let stats = reconciler.sweep().await;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(if stats.errors > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS });
            }
            reconciler.run().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Wires the AWS, tunnel and GitHub implementations from `config`.
async fn services(config: &OrchestratorConfig) -> Result<Services> {
    let cli = AwsCli::new().with_region(config.aws.region.clone());
    let store = FileStateStore::open(config.paths.state_dir.clone()).await?;

    let compute = ComputeManager::new(
        Arc::new(AwsComputeProvider::new(
            cli.clone(),
            config.aws.launch_template_id.clone(),
            config.aws.subnet_ids.clone(),
            config.aws.security_group_id.clone(),
            config.aws.managed_by.clone(),
        )),
        config.retry_policy(),
    );
    let runner = BootstrapRunner::new(Arc::new(SsmCommandChannel::new(cli)));
    let tunnel = QuickTunnelProvisioner::new(
        runner.clone(),
        config.instance.tunnel_log.clone(),
        config.instance.app_port,
        &config.instance.tunnel_public_suffix,
        config.tunnel_timeout(),
    )?;

    Ok(Services {
        store: Arc::new(store),
        compute,
        runner,
        tunnel: Arc::new(tunnel),
        secrets: SecretsResolver::new(config.instance.secrets_prefix.clone()),
        review: Arc::new(GhCliReviewHost::new(config.github.status_context.clone())),
        locks: KeyedLocks::new(),
    })
}
