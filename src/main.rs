use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_agents::{HttpAgentInvoker, OpenAiTransformer};
use weft_core::{
    CatalogSource, ChainDefinition, ConfirmationDecision, EngineEvent, FieldMapping, FileCatalog,
    NodeStatus, Recipe, Run, RunId, RunSink, RunStatus, WeftConfig,
};
use weft_engine::{ConfirmationBroker, Engine, RunOptions};
use weft_store::{SqliteRecipeStore, SqliteRunStore};

#[derive(Parser)]
#[command(name = "weft", version, about = "Schema-aware orchestration for chains of HTTP agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and execute a chain
    Run {
        /// Chain definition (JSON)
        chain: PathBuf,
        /// Agent catalog (JSON); overrides engine.catalog_path
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Allow generative transforms on every edge without asking
        #[arg(long)]
        confirm_generative: bool,
        /// Pre-confirm the generative transform on one edge (repeatable)
        #[arg(long = "confirm-edge", value_name = "EDGE_ID")]
        confirm_edges: Vec<String>,
        /// Print the finished run as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a chain without running it
    Validate {
        /// Chain definition (JSON)
        chain: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Score how well one agent's output satisfies another's input
    Score {
        /// Producing agent id
        source: String,
        /// Consuming agent id
        target: String,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show a recorded run
    Show {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List recent runs
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Manage accepted transform recipes
    Recipe {
        #[command(subcommand)]
        action: RecipeAction,
    },
    /// Start the HTTP gateway
    Serve {
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum RecipeAction {
    /// Accept a field mapping between two agents
    Add {
        source: String,
        target: String,
        /// Field mapping as JSON, e.g. '{"text": {"field": "summary", "via": "alias"}}'
        #[arg(long)]
        mapping: String,
        #[arg(long, default_value = "0.8")]
        confidence: f64,
    },
    /// List accepted recipes
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            chain,
            catalog,
            confirm_generative,
            confirm_edges,
            json,
        } => {
            let chain = read_chain(&chain)?;
            let engine = build_engine(&config, catalog)?;
            let options = RunOptions {
                confirm_all_generative: confirm_generative,
                confirmed_edges: confirm_edges.into_iter().collect(),
                interactive: !confirm_generative,
            };
            let run = run_chain(&engine, chain, options).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run);
            }
            if run.status != RunStatus::Succeeded {
                anyhow::bail!("run {} failed", run.id);
            }
        }
        Commands::Validate { chain, catalog } => {
            let chain = read_chain(&chain)?;
            let engine = build_engine(&config, catalog)?;
            match engine.validate(&chain).await {
                Ok(graph) => {
                    println!("valid ({} nodes)", graph.len());
                    println!("order: {}", graph.order().join(" -> "));
                }
                Err(e) => anyhow::bail!("invalid chain: {}", e),
            }
        }
        Commands::Score {
            source,
            target,
            catalog,
            json,
        } => {
            let catalog_path = catalog.unwrap_or_else(|| config.catalog_path());
            let snapshot = FileCatalog::new(catalog_path).snapshot().await?;
            let source_agent = snapshot.require(&source)?;
            let target_agent = snapshot.require(&target)?;
            let engine = build_engine(&config, None)?;
            let result = engine.score(&source_agent.output_schema, &target_agent.input_schema);
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{} -> {}", source, target);
                println!("  score:          {:.3}", result.score);
                println!("  classification: {}", result.classification);
                for (field, from) in result.mapping.iter() {
                    println!("  {:<16}<- {}", field, serde_json::to_string(from)?);
                }
                if !result.unmatched_required.is_empty() {
                    println!("  unmatched required: {}", result.unmatched_required.join(", "));
                }
                if !result.unmatched_optional.is_empty() {
                    println!("  unmatched optional: {}", result.unmatched_optional.join(", "));
                }
            }
        }
        Commands::Show { run_id, json } => {
            let store = SqliteRunStore::open(&config.database_path())?;
            let run = store
                .load_run(RunId::from_str(&run_id))
                .await?
                .with_context(|| format!("run {} not found", run_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run);
            }
        }
        Commands::Runs { limit } => {
            let store = SqliteRunStore::open(&config.database_path())?;
            let runs = store.list_runs(limit).await?;
            if runs.is_empty() {
                println!("No runs recorded yet.");
            }
            for run in runs {
                println!(
                    "{}  {:<9}  ${:<8.4}  {} nodes  {}  {}",
                    run.id,
                    run.status,
                    run.total_cost,
                    run.nodes_recorded,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.chain_id.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Recipe { action } => {
            let store = SqliteRecipeStore::open(&config.database_path())?;
            match action {
                RecipeAction::Add {
                    source,
                    target,
                    mapping,
                    confidence,
                } => {
                    let mapping: FieldMapping =
                        serde_json::from_str(&mapping).context("mapping is not valid JSON")?;
                    store.accept(&Recipe {
                        source_agent_id: source.clone(),
                        target_agent_id: target.clone(),
                        mapping,
                        confidence,
                        accepted_at: chrono::Utc::now(),
                    })?;
                    println!("Accepted recipe {} -> {}", source, target);
                }
                RecipeAction::List => {
                    let recipes = store.list()?;
                    if recipes.is_empty() {
                        println!("No recipes accepted yet.");
                    }
                    for recipe in recipes {
                        println!(
                            "{} -> {}  confidence {:.2}  {} fields  {}",
                            recipe.source_agent_id,
                            recipe.target_agent_id,
                            recipe.confidence,
                            recipe.mapping.len(),
                            recipe.accepted_at.format("%Y-%m-%d"),
                        );
                    }
                }
            }
        }
        Commands::Serve { catalog } => {
            let engine = build_engine(&config, catalog)?;
            info!(bind = %config.gateway.bind, "Starting HTTP gateway");
            let server = weft_gateway::GatewayServer::new(config.gateway.clone(), engine);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<WeftConfig> {
    if path.exists() {
        return Ok(WeftConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".weft").join("config.toml"));
    if let Some(ref path) = home_config {
        if path.exists() {
            info!(path = %path.display(), "Loading config from home directory");
            return Ok(WeftConfig::load(path)?);
        }
    }
    warn!("No config file found, using defaults");
    Ok(WeftConfig::default())
}

fn read_chain(path: &Path) -> anyhow::Result<ChainDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read chain {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not a chain", path.display()))
}

fn build_engine(config: &WeftConfig, catalog: Option<PathBuf>) -> anyhow::Result<Engine> {
    let db_path = config.database_path();
    let runs = Arc::new(SqliteRunStore::open(&db_path)?);
    let recipes = Arc::new(SqliteRecipeStore::open(&db_path)?);
    let catalog_path = catalog.unwrap_or_else(|| config.catalog_path());

    let mut builder = Engine::builder(config.clone())
        .catalog(Arc::new(FileCatalog::new(catalog_path)))
        .invoker(Arc::new(HttpAgentInvoker::new()))
        .sink(runs)
        .recipes(recipes);

    if config.generative.enabled {
        builder = builder.generator(Arc::new(OpenAiTransformer::from_config(&config.generative)));
    }

    if config.log.enabled {
        builder = builder.run_logs(config.log_dir(), config.log.level);
        info!("Run logs enabled (level {})", config.log.level);
    }

    Ok(builder.build()?)
}

/// Execute `chain`, streaming progress to stderr and prompting for confirmations.
async fn run_chain(engine: &Engine, chain: ChainDefinition, options: RunOptions) -> Run {
    let mut rx = engine.event_bus().subscribe();
    let broker = engine.broker();

    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                EngineEvent::RunStarted { run_id, nodes } => {
                    eprintln!("[run {}: {} nodes]", run_id, nodes);
                }
                EngineEvent::NodeStarted { node_id, .. } => {
                    eprintln!("[{}: started]", node_id);
                }
                EngineEvent::NodeCompleted {
                    node_id,
                    cost,
                    duration_ms,
                    ..
                } => {
                    eprintln!("[{}: ok] {}ms ${:.4}", node_id, duration_ms, cost);
                }
                EngineEvent::NodeFailed { node_id, error, .. } => {
                    eprintln!("[{}: FAILED] {}", node_id, truncate(&error.message, 200));
                }
                EngineEvent::TransformApplied {
                    edge_id,
                    method,
                    succeeded,
                    ..
                } => {
                    let outcome = if succeeded { "ok" } else { "failed" };
                    eprintln!("[edge {}: {} {}]", edge_id, method, outcome);
                }
                EngineEvent::ConfirmationRequested { request } => {
                    eprintln!(
                        "\n[CONFIRM] edge {} scores {:.2}; unmatched: {}",
                        request.edge_id,
                        request.score,
                        request.unmatched_required.join(", ")
                    );
                    prompt_confirmation(broker.clone(), request.id, request.estimated_cost).await;
                }
                EngineEvent::ConfirmationResolved { .. } => {}
                EngineEvent::RunFinished { .. } => break,
            }
        }
    });

    let run = engine.execute(chain, options).await;
    print_handle.abort();
    run
}

async fn prompt_confirmation(broker: Arc<ConfirmationBroker>, request_id: String, cost: f64) {
    let answer = tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(format!("Run a generative transform (est. ${:.4})?", cost))
            .default(false)
            .interact()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false);

    let decision = if answer {
        ConfirmationDecision::Approved
    } else {
        ConfirmationDecision::Denied {
            reason: "denied by user".into(),
        }
    };
    broker.respond(&request_id, decision).await;
}

fn print_run(run: &Run) {
    println!("Run {}  [{}]", run.id, run.status);
    if let Some(ref chain_id) = run.chain.id {
        println!("  chain:   {}", chain_id);
    }
    println!("  catalog: {}", run.catalog_version);
    println!("  cost:    ${:.4}", run.total_cost);
    if let Some(done) = run.completed_at {
        let ms = (done - run.started_at).num_milliseconds();
        println!("  elapsed: {}ms", ms);
    }

    println!("\nNodes:");
    for result in &run.node_results {
        let status = match result.status {
            NodeStatus::Succeeded => "ok",
            NodeStatus::Failed => "FAILED",
        };
        println!(
            "  {:<16} {:<6} attempts {}  ${:.4}  {}ms",
            result.node_id, status, result.attempts, result.cost, result.duration_ms
        );
        if let Some(ref error) = result.error {
            println!("    {}", truncate(&error.message, 200));
        }
    }

    if !run.transforms.is_empty() {
        println!("\nTransforms:");
        for t in &run.transforms {
            println!(
                "  {:<24} {:<13} confidence {:.2}  ${:.4}{}",
                t.edge_id,
                t.method.as_str(),
                t.confidence,
                t.cost,
                if t.succeeded { "" } else { "  FAILED" }
            );
        }
    }

    if let Some(ref error) = run.error {
        println!("\nError: {}", error);
    }
    io::stdout().flush().ok();
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
