mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::AppConfig;
use trellis_core::event::EventBus;
use trellis_core::hooks::EventHooks;
use trellis_core::policy::DefaultPolicy;
use trellis_core::types::{ContextMode, GraphId, NodeId};
use trellis_engine::{
    AncestorClosure, ContextAssembler, ContextBudgetManager, ContextRequest, EventLogger, FullClosure,
    GraphAudit, GraphEngine, Scheduler, WindowedAssembler,
};
use trellis_store::SqliteStore;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Persistent graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "TRELLIS_CONFIG", default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and write a default config
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Check graphs for structural problems
    Audit {
        /// Graph to audit (default: every graph)
        #[arg(long)]
        graph: Option<String>,
        /// Apply the automatic repairs
        #[arg(long)]
        repair: bool,
        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fail running nodes whose lease has expired
    Reclaim,
    /// Apply pending visibility patches on every graph
    Sweep,
    /// Print the context assembled for a node
    Context {
        /// Graph id
        graph: String,
        /// Target node id
        node: String,
        /// Assembly strategy
        #[arg(long, value_enum, default_value = "ancestor")]
        assembler: AssemblerArg,
        /// Payload mode (default: from config)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Turns kept by the windowed assembler (default: from config)
        #[arg(long)]
        window: Option<usize>,
        /// Fit the windowed context to the configured token budget
        #[arg(long)]
        budget: bool,
    },
    /// Run system health checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AssemblerArg {
    Ancestor,
    Full,
    Windowed,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Preview,
    Full,
}

impl From<ModeArg> for ContextMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Preview => ContextMode::Preview,
            ModeArg::Full => ContextMode::Full,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
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

    if let Commands::Init { force } = &cli.command {
        return init(&cli.config, *force);
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config not found, using defaults");
        AppConfig::default()
    };

    if let Commands::Doctor = &cli.command {
        println!("trellis doctor");
        println!();
        let failures = doctor::run_doctor(&config);
        if failures > 0 {
            std::process::exit(1);
        }
        return Ok(());
    }

    let store = SqliteStore::open_with_timeout(
        &config.store_path(),
        Duration::from_millis(config.store.busy_timeout_ms),
    )?;
    let event_bus = Arc::new(EventBus::default());
    let engine = Arc::new(GraphEngine::new(
        Arc::new(store),
        Arc::new(DefaultPolicy::from_config(&config.context)),
        EventHooks::new().with_sink(event_bus.clone()),
    ));

    let cancel = CancellationToken::new();
    let logger = config.log_dir().map(|dir| {
        tokio::spawn(EventLogger::new(dir).run(event_bus.clone(), cancel.clone()))
    });
    if let Some(handle) = &logger {
        // Events published before the logger subscribes are dropped
        while event_bus.receiver_count() == 0 && !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    }

    let result = match cli.command {
        Commands::Audit { graph, repair, json } => audit(&engine, graph, repair, json),
        Commands::Reclaim => {
            let reclaimed = Scheduler::new(engine.clone(), &config.scheduler).reclaim_all()?;
            println!("Reclaimed {} expired leases", reclaimed);
            Ok(())
        }
        Commands::Sweep => {
            let applied = Scheduler::new(engine.clone(), &config.scheduler).sweep_patches()?;
            println!("Applied {} visibility patches", applied);
            Ok(())
        }
        Commands::Context {
            graph,
            node,
            assembler,
            mode,
            window,
            budget,
        } => {
            let graph_id = GraphId::from_string(&graph);
            let node_id = NodeId::from_string(&node);
            let mode = mode.map(ContextMode::from).unwrap_or(config.context.mode);
            if budget {
                let mut context = config.context.clone();
                context.mode = mode;
                if let Some(window) = window {
                    context.window_turns = window;
                }
                let manager = ContextBudgetManager::new(config.budget.clone(), context);
                let fitted = manager.fit(&engine, &graph_id, &node_id, Vec::new()).await?;
                println!("{}", serde_json::to_string_pretty(&fitted)?);
            } else {
                let assembler: Box<dyn ContextAssembler> = match assembler {
                    AssemblerArg::Ancestor => Box::new(AncestorClosure),
                    AssemblerArg::Full => Box::new(FullClosure),
                    AssemblerArg::Windowed => {
                        let windowed = WindowedAssembler::from_config(&config.context);
                        Box::new(match window {
                            Some(n) => windowed.with_window(n),
                            None => windowed,
                        })
                    }
                };
                let request = ContextRequest::new(node_id).with_mode(mode);
                let assembled = engine.assemble(&graph_id, assembler.as_ref(), &request)?;
                println!("{}", serde_json::to_string_pretty(&assembled)?);
            }
            Ok(())
        }
        Commands::Init { .. } | Commands::Doctor | Commands::Completions { .. } => Ok(()),
    };

    // Let the logger drain before exit
    cancel.cancel();
    if let Some(handle) = logger {
        handle.await.ok();
    }
    result
}

fn init(config_path: &Path, force: bool) -> anyhow::Result<()> {
    let config = if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
        AppConfig::load(config_path)?
    } else {
        let config = AppConfig::default();
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, toml::to_string_pretty(&config)?)?;
        println!("Wrote {}", config_path.display());
        config
    };

    let db_path = config.store_path();
    let store = SqliteStore::open(&db_path)?;
    info!(path = %db_path.display(), graphs = store.graph_ids()?.len(), "Database ready");
    println!("Database ready at {}", db_path.display());
    Ok(())
}

fn audit(engine: &Arc<GraphEngine>, graph: Option<String>, repair: bool, json: bool) -> anyhow::Result<()> {
    let graphs = match graph {
        Some(id) => vec![GraphId::from_string(&id)],
        None => engine.store().graph_ids()?,
    };
    let audit = GraphAudit::new(engine.clone());

    let mut dirty = 0;
    for graph_id in &graphs {
        if repair {
            let summary = audit.repair(graph_id)?;
            if json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!(
                    "{}: reclaimed {}, skipped {}, archived {} edges, applied {} patches, repaired {} leaves, {} issues remain",
                    graph_id,
                    summary.reclaimed.len(),
                    summary.skipped.len(),
                    summary.archived_edges,
                    summary.patches_applied.len(),
                    summary.leaves_repaired.len(),
                    summary.remaining.issues.len()
                );
            }
            if !summary.remaining.is_clean() {
                dirty += 1;
            }
            continue;
        }

        let report = audit.scan(graph_id)?;
        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else if report.is_clean() {
            println!("{}: clean ({} nodes, {} edges)", graph_id, report.scanned_nodes, report.scanned_edges);
        } else {
            println!("{}: {} issues", graph_id, report.issues.len());
            for issue in &report.issues {
                println!("  [{:?}] {:?}: {}", issue.severity, issue.kind, issue.message);
            }
        }
        if !report.is_clean() {
            dirty += 1;
        }
    }

    if !json {
        println!();
        println!("  {} graphs audited, {} with issues", graphs.len(), dirty);
    }
    Ok(())
}
