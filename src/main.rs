//! RLM run pipeline - execution core for candidate retrieval, the bounded
//! program interpreter, and the three-round orchestrator.
//!
//! The binary entry point: command line interface, configuration loading,
//! and tracing-subscriber initialization (§10.1, §10.4).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rlm_api::{ApiServer, ApiState};
use rlm_cache::GlimpseCache;
use rlm_core::candidate_store::CandidateStore;
use rlm_core::config::ConfigManager;
use rlm_core::retrieval::RetrievalService;
use rlm_core::run_store::RunStore;
use rlm_engine::executor::limits::ExecutionLimits;
use rlm_engine::executor::{map_outcome, ProgramExecutor};
use rlm_engine::rootlm::{MockAdapter, RootLmAdapter};
use rlm_engine::trace::TraceLogger;

/// Command line interface for the RLM run pipeline.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path, read via RLM_CONFIG_FILE if unset here.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API server (`/v1/rlm/assemble`, `/v1/rlm/run`, `/health`).
    Serve,

    /// Pretty-print a run's JSON-lines trace without touching the database.
    Replay {
        #[arg(long)]
        run_id: String,

        #[arg(long)]
        trace_dir: Option<String>,
    },

    /// Run the Program Executor once against a session/query, bypassing the
    /// three-round orchestrator and the HTTP layer, and print the result.
    AssembleDemo {
        #[arg(long)]
        session_id: String,

        #[arg(long)]
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rlm=info,tower_http=info")))
        .init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("RLM_CONFIG_FILE", path);
    }
    let config = ConfigManager::load().context("failed to load RLM configuration")?;

    match args.command {
        Command::Serve => run_serve(config).await,
        Command::Replay { run_id, trace_dir } => run_replay(config, run_id, trace_dir),
        Command::AssembleDemo { session_id, query } => run_assemble_demo(config, session_id, query).await,
    }
}

async fn connect_pool(database_url: &str) -> Result<sqlx::sqlite::SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .with_context(|| format!("failed to connect to {database_url}"))?;
    sqlx::migrate!("./migrations").run(&pool).await.context("failed to run schema migrations")?;
    Ok(pool)
}

async fn run_serve(config: rlm_core::config::RlmConfig) -> Result<()> {
    info!("starting RLM pipeline in server mode");
    let pool = connect_pool(&config.database_url).await?;
    let cache = GlimpseCache::new(&config.redis_url).context("failed to build glimpse cache")?;
    let trace = TraceLogger::new(config.trace_dir.clone());
    let vllm = config.vllm.clone();

    let state = ApiState { pool, cache, vllm, trace, config };
    let server = ApiServer::new(state);
    server.start().await
}

fn run_replay(config: rlm_core::config::RlmConfig, run_id: String, trace_dir: Option<String>) -> Result<()> {
    let dir = trace_dir.unwrap_or(config.trace_dir);
    let trace = TraceLogger::new(dir);
    let lines = trace.replay(&run_id).context("failed to read trace file")?;
    if lines.is_empty() {
        println!("no trace found for run {run_id}");
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

async fn run_assemble_demo(config: rlm_core::config::RlmConfig, session_id: String, query: String) -> Result<()> {
    info!(%session_id, "running a one-shot assemble demo");
    let pool = connect_pool(&config.database_url).await?;
    let cache = GlimpseCache::new(&config.redis_url).context("failed to build glimpse cache")?;

    let store = CandidateStore::new(pool.clone());
    let run_store = RunStore::new(pool);
    let retrieval = RetrievalService::new(&store);

    let index = retrieval
        .build_candidate_index(&session_id, &query, Default::default())
        .await
        .context("candidate retrieval failed")?;
    let index_json = serde_json::to_value(&index)?;
    let run_id = run_store.insert_run(&session_id, &query, &json!({}), &index_json).await?;

    let limits = ExecutionLimits::assembly_default();
    let program = MockAdapter
        .generate_program(&index, &json!({"stage": "assemble"}), &limits.snapshot(), &json!({}))
        .await
        .map(|r| r.program)
        .unwrap_or(json!({"steps": []}));

    let executor = ProgramExecutor::new(&store, &cache);
    let execution = executor.execute(&program, &index, &run_id, &limits).await;
    let (status, assembled_context, _events) = map_outcome(execution, &index, 20);

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "run_id": run_id,
            "status": status,
            "assembled_context": assembled_context,
        }))?
    );
    Ok(())
}
