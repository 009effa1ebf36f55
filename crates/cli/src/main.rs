//! kusage CLI
//!
//! Ranks pods or containers by how close their usage is to their limits,
//! reading pod specs from the core API and usage from metrics-server.

mod client;
mod output;
mod settings;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use usage_lib::{
    sort_rows, top_n, BatchCollector, ClusterSource, CollectOptions, Granularity, MissPolicy,
    ResourceKind, RunStats, SortKey, StreamingCollector,
};

use output::{OutputFormat, View};
use settings::Settings;

/// Rank pods and containers by resource usage-to-limit ratio
#[derive(Parser)]
#[command(name = "kusage")]
#[command(author, version, about = "kusage: rank pods/containers by resource usage-to-limit ratio", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (default: $KUBECONFIG, ~/.kube/config, then in-cluster)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Settings file (default: ~/.config/kusage/config.{toml,json,yaml})
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Log format on stderr
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rank pods by aggregate usage across their containers
    Pods(ScanArgs),

    /// Rank individual containers
    Containers(ScanArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// List across all namespaces
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Namespace to scan (ignored with -A)
    #[arg(long, short, default_value = "default")]
    pub namespace: String,

    /// Label selector, e.g. app=web,tier!=cache
    #[arg(long, short = 'l')]
    pub selector: Option<String>,

    /// Regex of namespaces to exclude, e.g. ^(kube-system|monitoring)$
    #[arg(long = "nx", value_name = "REGEX")]
    pub exclude_namespaces: Option<String>,

    /// Regex matched against the sorted k=v,... label string to exclude workloads
    #[arg(long = "lx", value_name = "REGEX")]
    pub exclude_labels: Option<String>,

    /// Resource to score: memory|cpu
    #[arg(long, default_value = "memory")]
    pub resource: ResourceKind,

    /// Sort key: pct|usage|limit
    #[arg(long, default_value = "pct")]
    pub sort: SortKey,

    /// Show the top N rows (0 shows all)
    #[arg(long, default_value_t = 20)]
    pub top: usize,

    /// Suppress table headers
    #[arg(long)]
    pub no_headers: bool,

    /// Items to fetch per API call
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Maximum concurrent API calls
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Memory ceiling for in-flight pages, in MB
    #[arg(long, value_name = "MB")]
    pub max_memory: Option<u64>,

    /// Deadline for the whole collection, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Collection engine
    #[arg(long, value_enum, default_value = "streaming")]
    pub engine: Engine,

    /// Samples seen before their pod: defer|drop
    #[arg(long, default_value = "defer")]
    pub miss_policy: MissPolicy,

    /// Log a performance summary when done
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum Engine {
    /// Index and correlate while pages arrive
    #[default]
    Streaming,
    /// Fetch everything, then correlate
    Batch,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,usage_lib={level},kusage={level}")));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

fn compile_regex(pattern: Option<&str>, flag: &str) -> Result<Option<Regex>> {
    pattern
        .filter(|p| !p.is_empty())
        .map(|p| Regex::new(p).with_context(|| format!("invalid {flag} regex {p:?}")))
        .transpose()
}

/// Merge settings and flags into validated options
fn build_options(
    args: &ScanArgs,
    granularity: Granularity,
    settings: &Settings,
) -> Result<CollectOptions> {
    let mut options = settings.collect_options();

    options.namespace = (!args.all_namespaces).then(|| args.namespace.clone());
    options.label_selector = args.selector.clone();
    options.exclude_namespaces = compile_regex(args.exclude_namespaces.as_deref(), "--nx")?;
    options.exclude_labels = compile_regex(args.exclude_labels.as_deref(), "--lx")?;
    options.granularity = granularity;
    options.resource = args.resource;
    options.miss_policy = args.miss_policy;

    if let Some(page_size) = args.page_size {
        options.page_size = page_size;
    }
    if let Some(max_concurrency) = args.max_concurrency {
        options.max_concurrency = max_concurrency;
    }
    if let Some(max_memory) = args.max_memory {
        options.max_memory_mb = max_memory;
    }
    if let Some(timeout) = args.timeout {
        options.timeout = std::time::Duration::from_secs(timeout);
    }

    options.validate().context("Invalid collection options")?;
    Ok(options)
}

/// Collect, rank and print; returns the number of rows shown
async fn run(
    cli: &Cli,
    args: &ScanArgs,
    granularity: Granularity,
    settings: &Settings,
    stats: &mut RunStats,
) -> Result<usize> {
    let options = build_options(args, granularity, settings)?;
    debug!(
        namespace = options.namespace.as_deref().unwrap_or("*"),
        resource = %options.resource,
        engine = ?args.engine,
        page_size = options.page_size,
        max_concurrency = options.max_concurrency,
        "Starting collection"
    );

    let source: Arc<dyn ClusterSource> =
        Arc::new(client::KubeSource::connect(cli.kubeconfig.as_deref()).await?);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling collection");
            on_interrupt.cancel();
        }
    });

    let breaker = settings.breaker();
    let mut rows = match args.engine {
        Engine::Streaming => {
            let collector = StreamingCollector::with_breaker_config(source, breaker);
            let result = collector.collect(options, cancel).await;
            debug!(phase = ?collector.run_state().phase(), "Streaming collection finished");
            result?
        }
        Engine::Batch => {
            BatchCollector::with_breaker_config(source, breaker)
                .collect(&options, cancel)
                .await?
        }
    };
    stats.finish_collection();

    sort_rows(&mut rows, args.sort);
    let rows = top_n(rows, args.top);
    stats.finish_analysis();

    let view = View {
        granularity,
        resource: args.resource,
        no_headers: args.no_headers,
    };
    output::print_rows(&rows, cli.output, &view)?;
    Ok(rows.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    let settings = Settings::load(cli.config.as_deref())?;

    let (granularity, args) = match &cli.command {
        Commands::Pods(args) => (Granularity::Aggregate, args),
        Commands::Containers(args) => (Granularity::PerSubUnit, args),
    };

    let mut stats = RunStats::new();
    let result = run(&cli, args, granularity, &settings, &mut stats).await;

    if let Err(err) = &result {
        stats.record_error(format!("{err:#}"));
    }
    if args.metrics {
        let shown = result.as_ref().copied().unwrap_or(0);
        stats.summary(shown).log_summary();
    }

    result.map(|_| ())
}
