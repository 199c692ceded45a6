mod console;
mod replay;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::AppConfig;
use trellis_core::traits::{MemoryStore, ModelClient, Surface};
use trellis_core::types::AgentIdentity;
use trellis_engine::thread::ThreadEntry;
use trellis_engine::{
    Engine, HierarchyStore, NodeKind, PlaybookRegistry, RunLogger, RunStatus, SessionRegistry,
    SystemContext, ThreadHierarchy, ThreadLimits,
};
use trellis_memory::SqliteMemory;
use trellis_tools::ToolRegistry;

use console::StdoutSurface;
use replay::ReplayModel;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Playbook execution engine with nested sessions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate every playbook in a directory
    Validate {
        /// Playbook directory (default: from config)
        dir: Option<PathBuf>,
    },
    /// Print a playbook's nodes and transitions
    Show {
        name: String,
    },
    /// Run a playbook against a scripted model
    Run {
        name: String,
        /// Argument as key=value (value parsed as JSON when it is JSON)
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
        /// Agent id the run acts for
        #[arg(long, default_value = "default")]
        agent: String,
        /// Display name of the agent
        #[arg(long)]
        agent_name: Option<String>,
        /// JSON array of canned model responses
        #[arg(long)]
        script: Option<PathBuf>,
        /// Keep top-level records out of the run output
        #[arg(long)]
        orchestration: bool,
    },
    /// Print persisted thread hierarchies
    Threads {
        /// Show one agent's hierarchy in full
        #[arg(long)]
        agent: Option<String>,
    },
    /// Query the memory store
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
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
enum MemoryAction {
    /// Full-text search over stored entries
    Search {
        query: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trellis=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "trellis", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { dir } => {
            let dir = dir.unwrap_or_else(|| config.playbook_dir());
            let registry = PlaybookRegistry::load_dir(&dir)
                .with_context(|| format!("validating {}", dir.display()))?;
            for name in registry.names() {
                println!("ok  {}", name);
            }
            println!("{} playbook(s) valid", registry.len());
        }
        Commands::Show { name } => {
            let registry = PlaybookRegistry::load_dir(&config.playbook_dir())?;
            let def = registry.require(&name)?;
            print_playbook(&def);
        }
        Commands::Run {
            name,
            args,
            agent,
            agent_name,
            script,
            orchestration,
        } => {
            let args = parse_args(&args)?;
            let identity = AgentIdentity::new(&agent, agent_name.unwrap_or_else(|| agent.clone()));
            run_playbook(&config, &name, args, identity, script.as_deref(), orchestration).await?;
        }
        Commands::Threads { agent } => {
            let store = HierarchyStore::open(&threads_db_path(&config))?;
            match agent {
                Some(agent) => {
                    let limits = ThreadLimits::from(&config.threads);
                    match store.load(&agent, limits)? {
                        Some(hierarchy) => print_hierarchy(&hierarchy),
                        None => println!("No sessions stored for '{}'", agent),
                    }
                }
                None => {
                    let stored = store.list()?;
                    if stored.is_empty() {
                        println!("No sessions stored.");
                    }
                    for entry in stored {
                        println!(
                            "{:<20} {:>4} thread(s)  updated {}",
                            entry.agent_id,
                            entry.threads,
                            entry.updated_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
            }
        }
        Commands::Memory {
            action: MemoryAction::Search { query, limit },
        } => {
            let memory = SqliteMemory::open(&config.memory_db_path())?;
            let hits = memory.search(&query, limit)?;
            if hits.is_empty() {
                println!("No matches.");
            }
            for hit in hits {
                println!(
                    "{} {}/{} [{}] {}",
                    hit.timestamp.format("%Y-%m-%d %H:%M"),
                    hit.agent_id,
                    hit.role,
                    hit.tags.join(","),
                    truncate(&hit.content, 120)
                );
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        // Handled before config loading.
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".trellis").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn threads_db_path(config: &AppConfig) -> PathBuf {
    config.workspace_dir().join("threads.db")
}

async fn run_playbook(
    config: &AppConfig,
    name: &str,
    args: BTreeMap<String, serde_json::Value>,
    identity: AgentIdentity,
    script: Option<&Path>,
    orchestration: bool,
) -> anyhow::Result<()> {
    let playbooks = Arc::new(PlaybookRegistry::load_dir(&config.playbook_dir())?);
    let model: Arc<dyn ModelClient> = Arc::new(match script {
        Some(path) => ReplayModel::from_path(path)
            .with_context(|| format!("loading script {}", path.display()))?,
        None => ReplayModel::new(Vec::new()),
    });
    let memory: Arc<dyn MemoryStore> = Arc::new(SqliteMemory::open(&config.memory_db_path())?);
    let surface: Arc<dyn Surface> = Arc::new(StdoutSurface);
    let sessions = SessionRegistry::new(&config.threads)
        .with_store(HierarchyStore::open(&threads_db_path(config))?);

    let engine = Engine::new(playbooks, model, memory, surface, config.clone())
        .with_tools(Arc::new(ToolRegistry::with_builtins()))
        .with_sessions(Arc::new(sessions));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling run");
            ctrl_c.cancel();
        }
    });

    let logger_cancel = CancellationToken::new();
    let logger = match (config.log_dir(), config.log.as_ref()) {
        (Some(dir), Some(log)) => {
            let events = Arc::clone(engine.events());
            let task = tokio::spawn(RunLogger::new(dir, log.level).run(
                Arc::clone(&events),
                identity.id.clone(),
                logger_cancel.clone(),
            ));
            while events.subscriber_count() == 0 && !task.is_finished() {
                tokio::task::yield_now().await;
            }
            Some(task)
        }
        _ => None,
    };

    let ctx = SystemContext::new(identity)
        .with_cancel(cancel)
        .with_environment("cwd", std::env::current_dir()?.display().to_string())
        .orchestration(orchestration);
    let result = engine.run(name, args, ctx).await;

    if let Some(task) = logger {
        logger_cancel.cancel();
        task.await.ok();
    }

    let outcome = result?;
    let usage = outcome.usage();
    match outcome.status {
        RunStatus::Completed => println!(
            "Completed in {} step(s), {} output(s), {} tokens",
            outcome.steps,
            outcome.outputs.len(),
            usage.total()
        ),
        RunStatus::Cancelled => println!(
            "Cancelled after {} step(s), {} output(s)",
            outcome.steps,
            outcome.outputs.len()
        ),
    }
    if let Some(last) = outcome.last() {
        println!("last = {}", last);
    }
    Ok(())
}

/// `key=value`; the value is taken as JSON when it parses, else as a string.
fn parse_args(raw: &[String]) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
    let mut args = BTreeMap::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("argument '{}' is not key=value", item))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        args.insert(key.trim().to_string(), value);
    }
    Ok(args)
}

fn print_playbook(def: &trellis_engine::PlaybookDefinition) {
    println!("{}", def.name);
    if let Some(description) = &def.description {
        println!("  {}", description);
    }
    for param in &def.input_schema {
        println!("  param {}: {}", param.name, param.description);
    }
    println!("  start: {}", def.start_node);
    for node in &def.nodes {
        let detail = match &node.kind {
            NodeKind::Generate(n) => format!(" profile={}", n.profile),
            NodeKind::InvokeTool(n) => format!(" tool={}", n.tool),
            NodeKind::Invoke(n) => format!(" playbook={} mode={:?}", n.playbook, n.mode),
            _ => String::new(),
        };
        println!("  - {} ({}){}", node.id, node.kind.type_name(), detail);
        for edge in &node.conditional_next {
            println!("      when {} -> {}", edge.when, edge.to);
        }
        if let NodeKind::Invoke(invoke) = &node.kind {
            if let Some(target) = &invoke.on_failure {
                println!("      on failure -> {}", target);
            }
        }
        match &node.next {
            Some(next) => println!("      -> {}", next),
            None if node.conditional_next.is_empty() => println!("      (end)"),
            None => {}
        }
    }
}

fn print_hierarchy(hierarchy: &ThreadHierarchy) {
    let root = hierarchy.root_id().clone();
    print_thread(hierarchy, &root, &root);
}

fn print_thread(
    hierarchy: &ThreadHierarchy,
    id: &trellis_core::types::ThreadId,
    reader: &trellis_core::types::ThreadId,
) {
    let Some(thread) = hierarchy.get(id) else {
        return;
    };
    let indent = "  ".repeat(thread.depth);
    let active = if hierarchy.active_id() == id { " *" } else { "" };
    println!(
        "{}{} [{}] depth={} budget={}{}",
        indent,
        id.short(),
        thread.status.as_str(),
        thread.depth,
        thread.budget,
        active
    );
    for entry in &thread.entries {
        match entry {
            ThreadEntry::Message { role, content, .. } => {
                println!("{}  {}: {}", indent, role.as_str(), truncate(content, 100));
            }
            ThreadEntry::Anchor { child } => {
                for line in hierarchy.render_anchor(child, reader).lines() {
                    println!("{}  | {}", indent, line);
                }
                print_thread(hierarchy, child, reader);
            }
        }
    }
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

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = parse_args(&[
            "name=Ada".to_string(),
            "count=3".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(args["name"], serde_json::json!("Ada"));
        assert_eq!(args["count"], serde_json::json!(3));
        assert_eq!(args["tags"], serde_json::json!(["a", "b"]));
        assert!(parse_args(&["oops".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "trellis", "run", "greet", "--arg", "name=Ada", "--agent", "ada",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { name, args, agent, .. } => {
                assert_eq!(name, "greet");
                assert_eq!(args, vec!["name=Ada"]);
                assert_eq!(agent, "ada");
            }
            _ => panic!("expected run"),
        }
    }
}
