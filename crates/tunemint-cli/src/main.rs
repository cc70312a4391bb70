// ============================================================================
// tunemint — CLI driver for the generation orchestration engine
// ============================================================================
// Usage:
//   tunemint generate --prompt "lofi beat" [--style lofi --title X --custom]
//   tunemint status TASK_ID                 One-shot service status
//   tunemint check TASK_ID                  Re-check a missing task
//   tunemint library                        Show the visible collection
//   tunemint pending                        Show the pending-task set
//   tunemint quota                          Generations left today
//   tunemint listen                         Run the callback listener loop
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tunemint_core::callback::spawn_listener;
use tunemint_core::config::Config;
use tunemint_core::orchestrator::{GenerationOrchestrator, OrchestratorConfig};
use tunemint_core::{
    GenerationParams, GenerationService, MusicModel, PinataClient, SolanaLedger, SunoClient,
    TaskDb, VocalGender,
};

/// Tunemint generation orchestration driver
#[derive(Parser)]
#[command(name = "tunemint", version, about = "Drive AI-music generation through ledger and storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a generation and register it on the ledger
    Generate {
        /// Description of the song to generate
        #[arg(long)]
        prompt: String,

        /// Style/genre hint (advanced mode)
        #[arg(long)]
        style: Option<String>,

        /// Track title (advanced mode)
        #[arg(long)]
        title: Option<String>,

        /// Advanced mode: style/title/lyrics are caller-supplied
        #[arg(long)]
        custom: bool,

        /// Generate without vocals
        #[arg(long)]
        instrumental: bool,

        /// Model version: V3_5, V4, V4_5, V5
        #[arg(long, default_value = "V4")]
        model: String,

        /// Vocal gender: m or f
        #[arg(long)]
        vocal_gender: Option<String>,

        /// Keep the process alive and poll until the task completes
        #[arg(long)]
        wait: bool,
    },

    /// One-shot status query against the generation service
    Status {
        task_id: String,
    },

    /// Re-check a task whose results never arrived
    Check {
        task_id: String,
    },

    /// Show the visible music collection
    Library,

    /// Show the pending-task set and status map
    Pending,

    /// Show generations left under today's quota
    Quota,

    /// Run the callback listener and reconcile pushed completions
    Listen,
}

fn parse_model(s: &str) -> Result<MusicModel> {
    match s.to_uppercase().replace('.', "_").as_str() {
        "V3_5" => Ok(MusicModel::V3_5),
        "V4" => Ok(MusicModel::V4),
        "V4_5" => Ok(MusicModel::V4_5),
        "V5" => Ok(MusicModel::V5),
        _ => anyhow::bail!("Unknown model '{}'. Valid values: V3_5, V4, V4_5, V5", s),
    }
}

fn parse_vocal_gender(s: &str) -> Result<VocalGender> {
    match s.to_lowercase().as_str() {
        "m" | "male" => Ok(VocalGender::Male),
        "f" | "female" => Ok(VocalGender::Female),
        _ => anyhow::bail!("Unknown vocal gender '{}'. Valid values: m, f", s),
    }
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

async fn build_orchestrator(config: &Config) -> Result<Arc<GenerationOrchestrator>> {
    let service: Arc<dyn GenerationService> = Arc::new(match &config.suno_base_url {
        Some(base) => SunoClient::with_base_url(config.suno_api_key.clone(), base.clone()),
        None => SunoClient::new(config.suno_api_key.clone()),
    });

    let ledger = Arc::new(SolanaLedger::new(&config.rpc_url, config.ws_url.clone()));
    if let Some(path) = &config.keypair_path {
        let address = ledger.load_keypair(path).await?;
        info!("Wallet bound: {}", address);
    } else {
        warn!("TUNEMINT_KEYPAIR_PATH not set; ledger writes will fail");
    }

    let store = Arc::new(match &config.pinata_gateway {
        Some(gw) => PinataClient::with_gateway(config.pinata_jwt.clone(), gw.clone()),
        None => PinataClient::new(config.pinata_jwt.clone()),
    });

    let db = Arc::new(TaskDb::open(config.db_path.as_deref())?);

    let orch = GenerationOrchestrator::new(
        service,
        ledger,
        store,
        Some(db),
        OrchestratorConfig {
            callback_url: config.callback_url.clone(),
            ..Default::default()
        },
    );

    orch.restore_pending().await?;
    if let Err(e) = orch.refresh_membership().await {
        warn!("Ledger membership read failed: {}", e);
    }

    Ok(orch)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let orch = build_orchestrator(&config).await?;

    match cli.command {
        Commands::Generate {
            prompt,
            style,
            title,
            custom,
            instrumental,
            model,
            vocal_gender,
            wait,
        } => {
            let params = GenerationParams {
                prompt,
                style,
                title,
                custom_mode: custom,
                instrumental,
                model: parse_model(&model)?,
                vocal_gender: vocal_gender.as_deref().map(parse_vocal_gender).transpose()?,
                lyrics_mode: None,
                fee_override_lamports: None,
            };

            let task_id = orch.generate(params).await?;
            println!("Generation started: {}", task_id);

            if wait {
                cmd_wait(&orch, &task_id).await?;
            } else {
                println!("Results arrive via callback/poll; run `tunemint check {}` later.", task_id);
            }
            Ok(())
        }
        Commands::Status { task_id } => cmd_status(&config, &task_id).await,
        Commands::Check { task_id } => {
            orch.check_missing_task(&task_id).await?;
            cmd_pending(&orch).await
        }
        Commands::Library => cmd_library(&orch).await,
        Commands::Pending => cmd_pending(&orch).await,
        Commands::Quota => cmd_quota(&orch).await,
        Commands::Listen => cmd_listen(&config, orch).await,
    }
}

async fn cmd_wait(orch: &Arc<GenerationOrchestrator>, task_id: &str) -> Result<()> {
    println!("Waiting for task {} to complete...", task_id);
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(15)).await;
        orch.check_missing_task(task_id).await?;

        if !orch.pending_tasks().await.contains(task_id) {
            break;
        }
        if let Some(entry) = orch.status_map().await.get(task_id) {
            println!("  ... {:?} ({} tracks)", entry.status, entry.track_count);
        }
    }
    cmd_library(orch).await
}

async fn cmd_status(config: &Config, task_id: &str) -> Result<()> {
    let service = match &config.suno_base_url {
        Some(base) => SunoClient::with_base_url(config.suno_api_key.clone(), base.clone()),
        None => SunoClient::new(config.suno_api_key.clone()),
    };
    let event = service
        .get_task_status(task_id)
        .await
        .map_err(|e| anyhow!("{}", e))?;

    println!("Task:   {}", event.task_id);
    println!("Status: {:?} (code {})", event.status, event.code);
    println!("Tracks: {}", event.tracks.len());
    for t in &event.tracks {
        println!("  - {} \"{}\" ({:.0}s)", t.id, t.title, t.duration_secs);
    }
    Ok(())
}

async fn cmd_library(orch: &Arc<GenerationOrchestrator>) -> Result<()> {
    let visible = orch.visible_collection().await;

    if visible.is_empty() {
        println!("Library is empty.");
        return Ok(());
    }

    println!(
        "{:<34}  {:<34}  {:<24}  {:>6}  {}",
        "ID", "TASK", "TITLE", "SECS", "AUDIO"
    );
    println!("{}", "-".repeat(120));

    for artifact in &visible {
        if artifact.placeholder {
            println!("{:<34}  {:<34}  (generating...)", artifact.id, artifact.task_id);
            continue;
        }
        let title: String = artifact.title.chars().take(24).collect();
        println!(
            "{:<34}  {:<34}  {:<24}  {:>6.0}  {}",
            artifact.id,
            artifact.task_id,
            title,
            artifact.duration_secs,
            artifact.audio.best_url()
        );
    }

    println!("\nTotal: {} entries", visible.len());
    Ok(())
}

async fn cmd_pending(orch: &Arc<GenerationOrchestrator>) -> Result<()> {
    let pending = orch.pending_tasks().await;
    let status = orch.status_map().await;

    if pending.is_empty() {
        println!("No pending tasks.");
    } else {
        println!("Pending tasks:");
        for task_id in &pending {
            match status.get(task_id) {
                Some(entry) => println!(
                    "  {}  {:?}  ({} tracks{})",
                    task_id,
                    entry.status,
                    entry.track_count,
                    if entry.needs_completion_retry {
                        ", completion retry needed"
                    } else {
                        ""
                    }
                ),
                None => println!("  {}", task_id),
            }
        }
    }
    Ok(())
}

async fn cmd_quota(orch: &Arc<GenerationOrchestrator>) -> Result<()> {
    let left = orch.daily_generations_left().await.map_err(|e| anyhow!("{}", e))?;
    println!("Generations left today: {}", left);
    Ok(())
}

async fn cmd_listen(config: &Config, orch: Arc<GenerationOrchestrator>) -> Result<()> {
    let port = config.callback_port.unwrap_or(8787);
    let mut events = spawn_listener(port)?;

    println!(
        "Listening for completion callbacks on port {} (started {})",
        port,
        format_timestamp(Utc::now().timestamp())
    );

    while let Some(event) = events.recv().await {
        let task_id = event.task_id.clone();
        match orch.handle_callback(event).await {
            Ok(outcome) => info!("Callback for {} -> {:?}", task_id, outcome),
            Err(e) => warn!("Callback for {} failed: {}", task_id, e),
        }
    }
    Ok(())
}
