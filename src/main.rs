use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use conveyor::agent::invoker::{AgentInvoker, PromptLibrary};
use conveyor::agent::provider::ProviderFactory;
use conveyor::board::health::system_health;
use conveyor::board::models::{Domain, Ticket, TicketStatus};
use conveyor::board::store::{BoardStore, StoreHandle};
use conveyor::config::OrchestratorConfig;
use conveyor::events::EventBus;
use conveyor::rag::embed::default_embedder;
use conveyor::rag::index::Indexer;
use conveyor::rag::retrieve::Retriever;
use conveyor::rag::store::ChunkStore;
use conveyor::refine::RefinementEngine;
use conveyor::scheduler::control::Orchestrator;
use conveyor::workspace::git::GitManager;
use conveyor::workspace::merge::MergeQueue;
use conveyor::workspace::pool::WorkspacePool;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Autonomous multi-agent development pipeline")]
pub struct Cli {
    /// Project root holding .conveyor/ and the target repository.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .conveyor directory, board database, and default config
    Init,
    /// Run the orchestrator until interrupted
    Serve,
    /// Print board counts, health, and usage totals
    Status,
    /// Ticket management
    Ticket {
        #[command(subcommand)]
        command: TicketCommands,
    },
    /// Index expert prompts and codebase patterns into the chunk store
    Index,
    /// Read or write a persisted configuration override
    Config {
        key: String,
        value: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TicketCommands {
    /// Create a ticket in BACKLOG
    Add {
        title: String,
        #[arg(long, default_value = "backend")]
        domain: String,
        #[arg(long, default_value_t = 3)]
        priority: u8,
        #[arg(long)]
        description: Option<String>,
        /// File patterns used for conflict detection (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// List tickets with status
    List,
    /// Move a ticket straight to READY
    Ready { id: String },
    /// Move a ticket to APPROVED so refinement picks it up
    Approve { id: String },
}

fn conveyor_dir(root: &std::path::Path) -> PathBuf {
    root.join(".conveyor")
}

fn open_store(config: &OrchestratorConfig, root: &std::path::Path) -> Result<BoardStore> {
    let db_path = if config.db_path.is_absolute() {
        config.db_path.clone()
    } else {
        root.join(&config.db_path)
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(BoardStore::open(&db_path)?)
}

fn build_orchestrator(
    config: OrchestratorConfig,
    root: &std::path::Path,
) -> Result<Orchestrator> {
    let mut config = config;
    let store = open_store(&config, root)?;
    config.apply_store_overrides(&store)?;
    let store = StoreHandle::new(store);

    let git = Arc::new(GitManager::new(&config.repo_path, config.workspace.clone()));
    let bus = EventBus::default();
    let pool = Arc::new(WorkspacePool::new(
        store.clone(),
        Arc::clone(&git),
        bus.clone(),
        config.workspace.max_global_worktrees,
        &config.workspace.branch_prefix,
    ));
    let merge_queue = Arc::new(MergeQueue::new(
        store.clone(),
        Arc::clone(&git),
        Arc::clone(&pool),
        bus.clone(),
        config.workspace.max_merge_attempts,
    ));

    let retriever = if config.rag.enabled {
        let chunk_db = if config.rag.vector_db_path.is_absolute() {
            config.rag.vector_db_path.clone()
        } else {
            root.join(&config.rag.vector_db_path)
        };
        match ChunkStore::open(&chunk_db) {
            Ok(chunks) => Some(Arc::new(Retriever::new(
                chunks,
                default_embedder(),
                config.rag.token_budget,
            ))),
            Err(e) => {
                tracing::warn!(error = %e, "chunk store unavailable, retrieval disabled");
                None
            }
        }
    } else {
        None
    };

    let invoker = Arc::new(AgentInvoker::new(
        store.clone(),
        Arc::new(ProviderFactory::new()),
        retriever,
        PromptLibrary::new(Some(conveyor_dir(root).join("prompts"))),
        config.agent_timeout(),
        config.scheduler.enable_audit_logging,
        config.agents.model.clone(),
        config.agents.cli_command.clone(),
    ));
    let refine = Arc::new(RefinementEngine::new(
        store.clone(),
        Arc::clone(&invoker) as Arc<dyn conveyor::agent::AgentRunner>,
        config.scheduler.max_refinement_rounds,
    ));

    Ok(Orchestrator::new(
        store,
        pool,
        git,
        merge_queue,
        invoker,
        refine,
        bus,
        config,
    ))
}

async fn cmd_serve(config: OrchestratorConfig, root: &std::path::Path) -> Result<()> {
    let orchestrator = build_orchestrator(config, root)?;
    orchestrator.start().await?;
    println!("conveyor running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    let metrics = orchestrator.stop().await?;
    println!(
        "stopped after {} cycles: {} runs spawned, {} succeeded, {} failed, {} tickets completed",
        metrics.cycles, metrics.spawned, metrics.succeeded, metrics.failed, metrics.tickets_completed
    );
    Ok(())
}

fn cmd_status(config: &OrchestratorConfig, root: &std::path::Path) -> Result<()> {
    let store = open_store(config, root)?;
    let counts = store.counts_by_status()?;
    let mut ordered: Vec<_> = counts.into_iter().collect();
    ordered.sort();
    println!("tickets by status:");
    for (status, count) in &ordered {
        println!("  {:<18} {}", status, count);
    }
    let tickets = store.list_all()?;
    println!("health: {}", system_health(&tickets).as_str());
    for ticket in tickets.iter().filter(|t| t.status == TicketStatus::Blocked) {
        let reason = conveyor::board::health::blocked_reason(&store, ticket)?;
        println!("  blocked {}: {:?} - {}", ticket.id, reason.kind, reason.detail);
    }
    let usage = store.usage_totals()?;
    println!(
        "usage: {} calls, {} tokens in, {} tokens out",
        usage.calls, usage.tokens_in, usage.tokens_out
    );
    Ok(())
}

fn cmd_ticket(
    config: &OrchestratorConfig,
    root: &std::path::Path,
    command: TicketCommands,
) -> Result<()> {
    let mut store = open_store(config, root)?;
    match command {
        TicketCommands::Add {
            title,
            domain,
            priority,
            description,
            files,
        } => {
            let domain = Domain::parse(&domain).map_err(|e| anyhow::anyhow!(e))?;
            let count = store.list_all()?.len();
            let id = format!("T-{}", count + 1);
            let mut ticket = Ticket::new(&id, &title, domain);
            ticket.priority = priority.clamp(1, 4);
            ticket.description = description.unwrap_or_default();
            ticket.files = files;
            store.create_ticket(&ticket)?;
            println!("created {} ({})", ticket.id, ticket.title);
        }
        TicketCommands::List => {
            for ticket in store.list_all()? {
                println!(
                    "{:<8} {:<16} p{} {:<10} {}",
                    ticket.id,
                    ticket.status.as_str(),
                    ticket.priority,
                    ticket.domain.as_str(),
                    ticket.title
                );
            }
        }
        TicketCommands::Ready { id } => {
            store.update_status(&id, &TicketStatus::Ready, "operator", None)?;
            println!("{} -> ready", id);
        }
        TicketCommands::Approve { id } => {
            store.update_status(&id, &TicketStatus::Approved, "operator", None)?;
            println!("{} -> approved", id);
        }
    }
    Ok(())
}

async fn cmd_index(config: &OrchestratorConfig, root: &std::path::Path) -> Result<()> {
    let chunk_db = if config.rag.vector_db_path.is_absolute() {
        config.rag.vector_db_path.clone()
    } else {
        root.join(&config.rag.vector_db_path)
    };
    let store = ChunkStore::open(&chunk_db)?;
    let embedder = default_embedder();
    let indexer = Indexer::new(&store, embedder.as_ref());

    let mut written = 0;
    let experts_dir = conveyor_dir(root).join("prompts").join("experts");
    if experts_dir.is_dir() {
        for entry in std::fs::read_dir(&experts_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let domain = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("shared")
                .to_string();
            let content = std::fs::read_to_string(&path)?;
            written += indexer.index_expert_markdown(&domain, &content).await?;
        }
    }
    written += indexer
        .index_codebase(root, &config.rag.index_patterns)
        .await?;
    println!("indexed {} chunks ({} total in store)", written, store.count()?);
    Ok(())
}

fn cmd_init(root: &std::path::Path) -> Result<()> {
    let dir = conveyor_dir(root);
    std::fs::create_dir_all(dir.join("prompts").join("experts"))?;
    let config_path = dir.join("conveyor.toml");
    if !config_path.exists() {
        let defaults = toml::to_string_pretty(&OrchestratorConfig::default())
            .context("Failed to render default config")?;
        std::fs::write(&config_path, defaults)?;
    }
    let config = OrchestratorConfig::load(root)?;
    open_store(&config, root)?;
    println!("initialised {}", dir.display());
    Ok(())
}

fn cmd_config(
    config: &OrchestratorConfig,
    root: &std::path::Path,
    key: &str,
    value: Option<String>,
) -> Result<()> {
    let store = open_store(config, root)?;
    match value {
        Some(value) => {
            store.set_config(key, &value)?;
            println!("{} = {}", key, value);
        }
        None => match store.get_config(key)? {
            Some(value) => println!("{} = {}", key, value),
            None => println!("{} is not set", key),
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let root = cli
        .project_dir
        .clone()
        .unwrap_or(std::env::current_dir().context("Failed to resolve working directory")?);
    let config = OrchestratorConfig::load(&root)?;

    match cli.command {
        Commands::Init => cmd_init(&root),
        Commands::Serve => cmd_serve(config, &root).await,
        Commands::Status => cmd_status(&config, &root),
        Commands::Ticket { command } => cmd_ticket(&config, &root, command),
        Commands::Index => cmd_index(&config, &root).await,
        Commands::Config { key, value } => cmd_config(&config, &root, &key, value),
    }
}
