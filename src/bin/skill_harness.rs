#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use skill_harness::config::Config;
use skill_harness::cost::{format_cost, CostMeter, Tier};
use skill_harness::experiment::{compare, ExperimentConfig, ModelSelector, ModelVariant, Operation};
use skill_harness::gateway::{build_chain, GatewayConfig, ProviderGateway};
use skill_harness::guard::{redact, scan, SecretGuard};
use skill_harness::job::{ContentKind, ContentPayload};
use skill_harness::orchestrator::{ExtractionContext, FallbackOrchestrator};
use skill_harness::repo_cache::RepoMetadataCache;
use skill_harness::store::{JobStore, SqliteStore};
use skill_harness::worker::{submit, JobProcessor};

#[derive(Parser)]
#[command(name = "skill-harness", version, about = "Skill extraction harness CLI")]
struct Cli {
    /// SQLite database (overrides SKILL_HARNESS_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll for queued jobs until interrupted
    Worker {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Store a work sample and queue it for analysis
    Enqueue {
        #[arg(long)]
        content_file: PathBuf,
        #[arg(long)]
        owner: String,
        /// text, code or repo-reference
        #[arg(long, default_value = "text")]
        kind: String,
    },
    /// Extract skills from a file immediately, without queueing
    Extract {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Scan a file for credentials and print a redacted copy
    Scan {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        redact: bool,
    },
    /// Show today's spend against the tier budget
    Budget {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "free")]
        tier: String,
    },
    /// Spend per provider over the trailing window
    Costs {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Manage model A/B experiments
    Experiment {
        #[command(subcommand)]
        command: ExperimentCommands,
    },
    /// Inspect or purge the repository metadata cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Show an analysis job
    Job {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum ExperimentCommands {
    /// Create or replace an experiment; it becomes the active one for its operation
    Create {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "skill-extraction")]
        operation: String,
        #[arg(long)]
        control: String,
        #[arg(long)]
        treatment: String,
        /// Percent of identities routed to treatment
        #[arg(long, default_value_t = 50)]
        split: u8,
    },
    Deactivate {
        #[arg(long)]
        id: String,
    },
    /// Per-arm metrics and a winner
    Report {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    Stats,
    /// Delete expired entries
    Purge,
    /// Delete every entry for one owner
    Clear {
        #[arg(long)]
        owner: String,
    },
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SKILL_HARNESS_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| format!("failed to initialize tracing subscriber: {e}"))?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_orchestrator(
    config: &Config,
    store: Arc<SqliteStore>,
) -> Result<FallbackOrchestrator<CostMeter>, Box<dyn std::error::Error>> {
    let chain = build_chain(&config.providers)?;
    let meter = Arc::new(CostMeter::new(store.clone(), config.budgets));
    let gateway = ProviderGateway::with_config(
        meter,
        GatewayConfig {
            timeout: config.providers.timeout,
        },
    );
    Ok(FallbackOrchestrator::new(chain, gateway)
        .with_guard(SecretGuard::new(config.guard_block_at))
        .with_selector(ModelSelector::new(store)))
}

fn parse_variant(s: &str) -> Result<ModelVariant, Box<dyn std::error::Error>> {
    ModelVariant::from_str(s).ok_or_else(|| {
        let known: Vec<&str> = ModelVariant::ALL.iter().map(|v| v.as_str()).collect();
        format!("unknown model variant {s:?}; expected one of {}", known.join(", ")).into()
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let store = Arc::new(SqliteStore::new(&config.db_path)?);

    match cli.command {
        Commands::Worker { once } => {
            let selector = ModelSelector::new(store.clone());
            if let Some(experiment) = &config.experiment {
                selector.create_experiment(experiment).await?;
                info!(id = %experiment.id, "experiment loaded from environment");
            }
            let orchestrator = Arc::new(build_orchestrator(&config, store.clone())?);
            let repo_cache = RepoMetadataCache::new(store.clone(), &config.repo_cache)?;
            let processor = JobProcessor::new(
                store.clone(),
                store.clone(),
                orchestrator,
                repo_cache,
                config.worker.clone(),
            )?;

            if once {
                let report = processor.run_cycle().await?;
                print_json(&report)?;
                return Ok(());
            }

            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; finishing current cycle");
                    let _ = tx.send(true);
                }
            });
            processor.run(rx).await;
        }
        Commands::Enqueue {
            content_file,
            owner,
            kind,
        } => {
            let kind = ContentKind::from_str(&kind)
                .ok_or_else(|| format!("unknown content kind {kind:?}"))?;
            let body = std::fs::read_to_string(content_file)?;
            let content = ContentPayload::new(kind, body, owner);
            let job = submit(store.as_ref(), store.as_ref(), &content).await?;
            println!("{}", job.id);
        }
        Commands::Extract { file, owner } => {
            let text = std::fs::read_to_string(&file)?;
            let orchestrator = build_orchestrator(&config, store)?;
            let ctx = ExtractionContext {
                content_id: Some(file.display().to_string()),
                owner_id: owner,
                job_id: None,
            };
            let extraction = orchestrator.extract(&ctx, &text).await?;
            print_json(&extraction)?;
        }
        Commands::Scan { file, redact: show } => {
            let text = std::fs::read_to_string(file)?;
            let report = scan(&text);
            if show {
                print!("{}", redact(&text, &report));
            } else {
                print_json(&report)?;
            }
        }
        Commands::Budget { owner, tier } => {
            let tier = Tier::from_str(&tier).ok_or_else(|| format!("unknown tier {tier:?}"))?;
            let meter = CostMeter::new(store, config.budgets);
            let status = meter.check_budget(&owner, tier).await;
            println!(
                "{owner} ({tier}): {} of {} used today, {} remaining{}",
                format_cost(status.used_usd),
                format_cost(status.limit_usd),
                format_cost(status.remaining_usd()),
                if status.exceeded { " [EXCEEDED]" } else { "" }
            );
        }
        Commands::Costs { owner, days } => {
            let meter = CostMeter::new(store, config.budgets);
            let totals = meter.owner_totals(&owner).await?;
            let by_provider = meter.cost_by_provider(&owner, days).await?;
            print_json(&serde_json::json!({
                "owner_id": owner,
                "totals": totals,
                "window_days": days,
                "by_provider": by_provider,
            }))?;
        }
        Commands::Experiment { command } => {
            let selector = ModelSelector::new(store);
            match command {
                ExperimentCommands::Create {
                    id,
                    name,
                    operation,
                    control,
                    treatment,
                    split,
                } => {
                    let operation = Operation::from_str(&operation)
                        .ok_or_else(|| format!("unknown operation {operation:?}"))?;
                    let experiment = ExperimentConfig::new(
                        id,
                        name,
                        operation,
                        parse_variant(&control)?,
                        parse_variant(&treatment)?,
                        split,
                    );
                    selector.create_experiment(&experiment).await?;
                    println!("experiment {} active", experiment.id);
                }
                ExperimentCommands::Deactivate { id } => {
                    selector.deactivate_experiment(&id).await?;
                    println!("experiment {id} deactivated");
                }
                ExperimentCommands::Report { id } => {
                    let metrics = selector.aggregate(&id).await?;
                    let comparison = compare(&metrics.control, &metrics.treatment);
                    print_json(&serde_json::json!({
                        "test_id": id,
                        "metrics": metrics,
                        "comparison": comparison,
                    }))?;
                }
            }
        }
        Commands::Cache { command } => {
            let cache = RepoMetadataCache::new(store, &config.repo_cache)?;
            match command {
                CacheCommands::Stats => print_json(&cache.stats().await?)?,
                CacheCommands::Purge => {
                    let removed = cache.purge_expired().await?;
                    println!("purged {removed} expired entries");
                }
                CacheCommands::Clear { owner } => {
                    let removed = cache.clear_owner(&owner).await?;
                    println!("removed {removed} entries for {owner}");
                }
            }
        }
        Commands::Job { id } => match store.get_job(&id).await? {
            Some(job) => print_json(&job)?,
            None => return Err(format!("job {id} not found").into()),
        },
    }

    Ok(())
}
