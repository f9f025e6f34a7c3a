use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wp_migrate::config::{self, Config};
use wp_migrate::db::{RecordFilter, StateStore, StoreError};
use wp_migrate::discovery::{Discovery, HtmlDiscovery};
use wp_migrate::media::HttpMediaFetcher;
use wp_migrate::migrate::{Migrator, RunError, RunOptions, RunSummary};
use wp_migrate::model::{MigrationStatus, SourceId};
use wp_migrate::publisher::Publisher;
use wp_migrate::wordpress::WordPressClient;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Migrate blog posts to WordPress exactly once, resuming across runs"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover source posts and publish the ones not yet migrated
    Run(RunArgs),
    /// Show recorded migration state
    Status {
        /// Only list failed posts
        #[arg(long)]
        failed: bool,
    },
    /// Settle a post whose creation could not be confirmed
    Resolve(ResolveArgs),
    /// Forget all recorded state (posts already on WordPress stay there)
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Print a sample configuration file
    ExampleConfig,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Override `source.url` from the config
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Remove a lock left behind by a crashed run before starting
    #[arg(long)]
    break_lock: bool,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("outcome").required(true).args(["destination_id", "not_created"])))]
struct ResolveArgs {
    /// Source post URL as recorded by `status`
    source_url: String,
    /// The post exists on WordPress under this id
    #[arg(long)]
    destination_id: Option<u64>,
    /// The post is not on WordPress; retry it on the next run
    #[arg(long)]
    not_created: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    if let Command::ExampleConfig = cli.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&cli.config))
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cfg.ensure_dirs()?;
    let store = StateStore::open(&cfg.database_url()).await?;

    match cli.command {
        Command::Run(args) => run(cfg, store, args).await,
        Command::Status { failed } => status(&store, failed).await,
        Command::Resolve(args) => resolve(&store, args).await,
        Command::Reset { yes } => {
            if !yes {
                bail!("refusing to reset migration state without --yes");
            }
            let n = store.reset().await?;
            HttpMediaFetcher::new(cfg.media_dir())?.clear().await?;
            println!("removed {n} migration records");
            Ok(())
        }
        Command::ExampleConfig => Ok(()),
    }
}

async fn run(mut cfg: Config, store: StateStore, args: RunArgs) -> Result<()> {
    if let Some(source) = args.source {
        cfg.source.url = source;
    }
    if let Some(workers) = args.workers {
        cfg.app.workers = workers.max(1);
    }
    if let Some(max_attempts) = args.max_attempts {
        cfg.app.max_attempts = max_attempts.max(1);
    }
    if args.break_lock && store.break_run_lock().await? {
        warn!("removed existing migration lock");
    }

    let client = WordPressClient::new(&cfg.wordpress.site)?;
    let fetcher = HttpMediaFetcher::new(cfg.media_dir())?;
    let discovery = HtmlDiscovery::new(&cfg.source.selectors)?;
    let opts = RunOptions {
        workers: cfg.app.workers,
        retry: cfg.retry_policy(),
        lock_ttl: Duration::from_secs(cfg.app.lock_ttl_seconds),
        transform: cfg.transform_options(),
        defaults: cfg.post_defaults(),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight posts");
            on_signal.cancel();
        }
    });

    let migrator = Migrator::new(
        store,
        Arc::new(fetcher.clone()),
        Publisher::new(Arc::new(client)),
        cfg.credentials(),
        opts,
    )
    .with_cancel(cancel);
    info!(run_id = migrator.run_id(), source = %cfg.source.url, "starting migration");

    let posts = discovery.discover(&cfg.source.url).await?;
    let outcome = migrator.run(posts).await;
    let summary = match &outcome {
        Ok(summary) => summary,
        Err(aborted) => aborted.summary.as_ref(),
    };
    print_summary(summary, args.json)?;

    let locked_out = matches!(
        &outcome,
        Err(aborted) if matches!(aborted.error, RunError::Store(StoreError::RunLocked { .. }))
    );
    if !locked_out {
        fetcher.clear().await?;
    }
    outcome?;
    Ok(())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{summary}");
    }
    Ok(())
}

async fn resolve(store: &StateStore, args: ResolveArgs) -> Result<()> {
    let id = SourceId::from_url(&args.source_url)?;
    let destination_id = match (args.not_created, args.destination_id) {
        (false, Some(dest)) => Some(dest.to_string()),
        _ => None,
    };
    store.resolve_unconfirmed(&id, destination_id.as_deref()).await?;
    match destination_id {
        Some(dest) => println!("{id} recorded as published -> {dest}"),
        None => println!("{id} will be retried on the next run"),
    }
    Ok(())
}

async fn status(store: &StateStore, failed_only: bool) -> Result<()> {
    let filter = if failed_only {
        RecordFilter::Status(MigrationStatus::Failed)
    } else {
        RecordFilter::All
    };
    let counts = store.counts().await?;
    println!(
        "published: {}  failed: {}  pending: {}  unconfirmed: {}",
        counts.published, counts.failed, counts.pending, counts.unconfirmed
    );
    for rec in store.list_records(filter).await? {
        let detail = match (&rec.destination_id, &rec.failure_kind) {
            (Some(dest), _) => format!("-> {dest}"),
            (None, Some(kind)) => format!(
                "{kind}: {}",
                rec.failure_reason.as_deref().unwrap_or_default()
            ),
            (None, None) => String::new(),
        };
        println!(
            "{:<9} {:>2}  {}  {}",
            rec.status, rec.attempt_count, rec.source_id, detail
        );
    }
    Ok(())
}
