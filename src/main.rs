use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mangaforge::agents::{AgentDeps, AgentSet, MetricsRegistry};
use mangaforge::config::FileConfig;
use mangaforge::events::EventBus;
use mangaforge::gateway::{HttpGateway, ModelGateway, StubGateway};
use mangaforge::orchestrator::driver::PipelineDeps;
use mangaforge::store::{MemoryStore, MokaCache, SqliteStore};
use mangaforge::supervisor::PipelineSupervisor;
use mangaforge::ui::{PipelineUi, print_progress};
use mangaforge_common::{GenerationParameters, PipelineEvent, SessionStatus};

#[derive(Parser)]
#[command(name = "mangaforge")]
#[command(version, about = "AI manga generation pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding mangaforge.toml (defaults to the current one).
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the seven-phase pipeline over an input text
    Run {
        /// Read the input text from a file
        #[arg(short, long, conflicts_with = "text")]
        input: Option<PathBuf>,
        /// Input text given inline
        #[arg(short, long)]
        text: Option<String>,
        /// Session title
        #[arg(long, default_value = "untitled")]
        title: String,
        /// Preferred genre
        #[arg(long, default_value = "")]
        genre: String,
        /// Gate critical and low-scoring phases on interactive feedback
        #[arg(long)]
        hitl: bool,
        /// Quality threshold for the HITL gate
        #[arg(long, default_value = "0.6")]
        quality_threshold: f64,
        /// Concurrent image generations in phase 5
        #[arg(long, default_value = "4")]
        max_parallel: usize,
        /// Use the deterministic stub backend instead of HTTP
        #[arg(long)]
        stub: bool,
    },
    /// Show a session's per-phase progress
    Status {
        /// Session id
        session_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if cli.verbose { "mangaforge=debug" } else { "mangaforge=warn" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let file_config = FileConfig::discover(&project_dir)?;

    match cli.command {
        Commands::Run {
            input,
            text,
            title,
            genre,
            hitl,
            quality_threshold,
            max_parallel,
            stub,
        } => {
            let input_text = match (input, text) {
                (Some(path), _) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read input file: {}", path.display()))?,
                (None, Some(text)) => text,
                (None, None) => return Err(anyhow!("provide --input <file> or --text <story>")),
            };

            let params = GenerationParameters {
                primary_genre: genre,
                quality_threshold,
                enable_hitl: hitl,
                max_parallel_image_generations: max_parallel,
                ..GenerationParameters::default()
            };

            let supervisor = Arc::new(build_supervisor(&file_config, stub)?);
            run_session(&supervisor, &title, &input_text, params, cli.verbose).await
        }
        Commands::Status { session_id } => {
            let supervisor = Arc::new(build_supervisor(&file_config, true)?);
            let snapshot = supervisor.get_progress(session_id).await?;
            print_progress(&snapshot);
            Ok(())
        }
    }
}

fn build_supervisor(file_config: &FileConfig, stub: bool) -> Result<PipelineSupervisor> {
    let gateway: Arc<dyn ModelGateway> = if stub || file_config.backend.base_url.is_empty() {
        Arc::new(StubGateway::new())
    } else {
        let api_key = std::env::var(&file_config.backend.api_key_env).with_context(|| {
            format!(
                "backend API key not found in ${}",
                file_config.backend.api_key_env
            )
        })?;
        Arc::new(
            HttpGateway::new(&file_config.backend.base_url, &api_key)
                .map_err(|e| anyhow!("failed to build HTTP gateway: {}", e))?,
        )
    };

    let config = file_config.pipeline_config();
    let agent_deps = AgentDeps::new(gateway).with_retry_policy(
        config.phase_max_retries,
        config.agent_backoff_base,
        config.image_backoff_base,
    );

    let deps = match file_config.db_path() {
        Some(path) => {
            let store = Arc::new(SqliteStore::new(&path)?);
            PipelineDeps {
                sessions: store.clone(),
                phase_results: store.clone(),
                content: store,
                cache: Arc::new(MokaCache::new()),
                agents: AgentSet::new(),
                agent_deps,
                events: EventBus::new(),
                metrics: Arc::new(MetricsRegistry::new()),
                config,
            }
        }
        None => {
            let store = MemoryStore::shared();
            PipelineDeps {
                sessions: store.clone(),
                phase_results: store.clone(),
                content: store,
                cache: Arc::new(MokaCache::new()),
                agents: AgentSet::new(),
                agent_deps,
                events: EventBus::new(),
                metrics: Arc::new(MetricsRegistry::new()),
                config,
            }
        }
    };

    Ok(PipelineSupervisor::new(deps))
}

async fn run_session(
    supervisor: &Arc<PipelineSupervisor>,
    title: &str,
    input_text: &str,
    params: GenerationParameters,
    verbose: bool,
) -> Result<()> {
    let mut events = supervisor.subscribe_events();
    let session_id = supervisor
        .submit("cli", title, input_text, params)
        .await
        .map_err(|e| anyhow!("submit failed: {}", e))?;

    let ui = PipelineUi::new(verbose);
    ui.print_header(title, &session_id.to_string());

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if event.session_id() != session_id {
            continue;
        }
        ui.handle_event(&event);

        match event {
            PipelineEvent::FeedbackRequested { phase, preview, .. } => {
                ui.print_preview(&preview);
                let decision = tokio::task::spawn_blocking(prompt_feedback)
                    .await
                    .context("feedback prompt failed")??;
                match decision {
                    FeedbackChoice::Approve => {
                        supervisor
                            .submit_feedback(session_id, phase, true, serde_json::Value::Null)
                            .await
                            .map_err(|e| anyhow!("feedback failed: {}", e))?;
                    }
                    FeedbackChoice::Reject(note) => {
                        supervisor
                            .submit_feedback(
                                session_id,
                                phase,
                                false,
                                serde_json::json!({"note": note}),
                            )
                            .await
                            .map_err(|e| anyhow!("feedback failed: {}", e))?;
                    }
                    FeedbackChoice::Cancel => {
                        supervisor
                            .cancel(session_id, Some("cancelled at feedback prompt"))
                            .await
                            .map_err(|e| anyhow!("cancel failed: {}", e))?;
                    }
                }
            }
            PipelineEvent::SessionCompleted { .. }
            | PipelineEvent::SessionFailed { .. }
            | PipelineEvent::SessionCancelled { .. } => break,
            _ => {}
        }
    }

    let snapshot = supervisor
        .get_progress(session_id)
        .await
        .map_err(|e| anyhow!("progress failed: {}", e))?;
    println!();
    print_progress(&snapshot);
    if verbose {
        mangaforge::ui::print_metrics(&supervisor.metrics());
    }

    if snapshot.status == SessionStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

enum FeedbackChoice {
    Approve,
    Reject(String),
    Cancel,
}

fn prompt_feedback() -> Result<FeedbackChoice> {
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Review this phase")
        .items(&["Approve", "Reject and revise", "Cancel session"])
        .default(0)
        .interact()?;
    Ok(match selection {
        0 => FeedbackChoice::Approve,
        1 => {
            let note: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("What should change?")
                .allow_empty(true)
                .interact_text()?;
            FeedbackChoice::Reject(note)
        }
        _ => FeedbackChoice::Cancel,
    })
}
