// src/main.rs

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use depstage::model::Flag;
use depstage::pipeline::queue;
use depstage::{
    ArtifactStore, Dispatcher, Engine, EngineConfig, HttpStore, MemoryStore, NewRequest,
    PackageManager, Request, StaleSweeper, WorkerPool,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "depstage")]
#[command(author, version, about = "Hermetic dependency staging worker", long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults plus environment overrides when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the request database
    Init,
    /// Submit a request and queue its first step
    Submit {
        /// Repository URL
        #[arg(long)]
        repo: String,

        /// Full commit id to stage
        #[arg(long = "ref")]
        git_ref: String,

        /// Package manager to run (repeatable)
        #[arg(long = "pkg-manager", required = true)]
        pkg_managers: Vec<String>,

        /// Package directory for a manager, as PM=SUBPATH (repeatable)
        #[arg(long = "package")]
        packages: Vec<String>,

        /// Request flag (repeatable)
        #[arg(long = "flag")]
        flags: Vec<String>,
    },
    /// Run queued steps
    Work {
        /// Number of worker threads
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Keep polling once the queue is empty
        #[arg(long)]
        follow: bool,

        /// Stage into an in-memory store instead of the configured one
        #[arg(long)]
        dry_run: bool,
    },
    /// Expire complete requests older than the request lifetime
    Sweep {
        /// Tear down against an in-memory store instead of the configured one
        #[arg(long)]
        dry_run: bool,
    },
    /// Show a request's state, history and tasks
    Status {
        /// Request id
        id: i64,
    },
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
    }
}

/// Parse a `PM=SUBPATH` argument
fn parse_package_arg(arg: &str) -> Result<(PackageManager, PathBuf)> {
    let (manager, subpath) = arg
        .split_once('=')
        .with_context(|| format!("Expected PM=SUBPATH, got {arg}"))?;
    Ok((manager.trim().parse()?, PathBuf::from(subpath.trim())))
}

fn build_request(
    repo: String,
    git_ref: String,
    pkg_managers: &[String],
    packages: &[String],
    flags: &[String],
) -> Result<NewRequest> {
    let package_managers = pkg_managers
        .iter()
        .map(|pm| pm.parse::<PackageManager>())
        .collect::<depstage::Result<Vec<_>>>()?;

    let mut by_manager: BTreeMap<PackageManager, Vec<PathBuf>> = BTreeMap::new();
    for arg in packages {
        let (manager, subpath) = parse_package_arg(arg)?;
        by_manager.entry(manager).or_default().push(subpath);
    }

    let flags = flags
        .iter()
        .map(|f| f.parse::<Flag>())
        .collect::<depstage::Result<_>>()?;

    Ok(NewRequest {
        repo,
        git_ref,
        package_managers,
        packages: by_manager,
        flags,
        dependency_replacements: Vec::new(),
    })
}

fn build_engine(config: Arc<EngineConfig>, dry_run: bool) -> Result<Arc<Engine>> {
    let store: Arc<dyn ArtifactStore> = if dry_run {
        info!("Dry run: staging into an in-memory store");
        Arc::new(MemoryStore::default())
    } else {
        Arc::new(HttpStore::new(
            &config.store,
            Some(config.store_timeout()?),
            config.retry_policy()?,
        )?)
    };
    Ok(Arc::new(Engine::networked(config, store)?))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let db_path = config.worker.db_path.clone();

    match cli.command {
        Some(Commands::Init) => {
            info!("Initializing the request database at {}", db_path.display());
            depstage::db::init(&db_path)?;
            println!("Database initialized at {}", db_path.display());
            Ok(())
        }
        Some(Commands::Submit {
            repo,
            git_ref,
            pkg_managers,
            packages,
            flags,
        }) => {
            let new = build_request(repo, git_ref, &pkg_managers, &packages, &flags)?;
            let mut conn = depstage::db::open(&db_path)?;
            let request = Dispatcher::new(&mut conn).submit(new)?;
            println!("Submitted request {}", request.id);
            Ok(())
        }
        Some(Commands::Work {
            workers,
            follow,
            dry_run,
        }) => {
            let engine = build_engine(Arc::new(config), dry_run)?;
            let handled = WorkerPool::new(engine, db_path, workers)
                .with_poll_interval(Duration::from_secs(2))
                .run(follow)?;
            println!("Processed {handled} tasks");
            Ok(())
        }
        Some(Commands::Sweep { dry_run }) => {
            let engine = build_engine(Arc::new(config), dry_run)?;
            let conn = depstage::db::open(&db_path)?;
            let expired = StaleSweeper::new(engine).run(&conn, Utc::now())?;
            println!("Expired {} requests", expired.len());
            Ok(())
        }
        Some(Commands::Status { id }) => {
            let conn = depstage::db::open(&db_path)?;
            let request = Request::get(&conn, id)?;
            println!("Request {}: {} ({})", request.id, request.state, request.state_reason);
            println!("  Repository: {} @ {}", request.repo, request.git_ref);
            let managers: Vec<&str> = request.package_managers.iter().map(|pm| pm.as_str()).collect();
            println!("  Package managers: {}", managers.join(", "));
            println!("  History:");
            for change in request.history(&conn)? {
                println!("    {} {} ({})", change.at.to_rfc3339(), change.state, change.reason);
            }
            println!("  Tasks:");
            for task in queue::tasks_for_request(&conn, request.id)? {
                match task.error {
                    Some(error) => println!("    {} {} ({})", task.step, task.status, error),
                    None => println!("    {} {}", task.step, task.status),
                }
            }
            Ok(())
        }
        None => {
            println!("depstage v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'depstage --help' for usage information");
            Ok(())
        }
    }
}
