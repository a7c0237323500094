//! CLI entrypoint for `leakscope`.
//!
//! `ingest` streams each leak dump through the enrichment pipeline on a
//! single-threaded runtime and prints a run summary; `query` counts, lists,
//! and optionally exports stored entries using the store's filters.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{LevelFilter, error, info};
use leakscope::{
    config::{
        DEFAULT_BATCH_SIZE, DEFAULT_CONNECT_RETRIES, DEFAULT_PROBE_CONCURRENCY, DEFAULT_THRESHOLD,
        PipelineConfig,
    },
    export::save_entries_csv,
    io::{DEFAULT_MMAP_THRESHOLD_BYTES, iter_lines_auto},
    pipeline::{Pipeline, PipelineError},
    report::{render_entries, render_run_summary},
    resolve::SystemResolver,
    store::{DEFAULT_DATABASE_URL, DEFAULT_PAGE_LIMIT, Page, RecordFilter, RecordStore, SqliteStore},
};

#[derive(Parser, Debug)]
#[command(
    name = "leakscope",
    version,
    about = "Credential leak ingestion and address enrichment"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Database connection URL
    #[arg(
        long = "database",
        env = "LEAKSCOPE_DATABASE_URL",
        default_value = DEFAULT_DATABASE_URL,
        global = true
    )]
    database: String,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Control color output (auto, always, never)
    #[arg(long = "color", value_enum, default_value_t = ColorChoice::Auto, global = true)]
    color: ColorChoice,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify, group, enrich and store leak dump files
    Ingest(IngestArgs),
    /// Count, list or export stored entries
    Query(QueryArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Path to the leak dump file(s)
    #[arg(short = 'f', long = "files", required = true)]
    files: Vec<PathBuf>,

    /// Minimum lines per address (exclusive) before it is enriched
    #[arg(long = "threshold", default_value_t = DEFAULT_THRESHOLD)]
    threshold: usize,

    /// Addresses enriched concurrently per batch
    #[arg(long = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// HTTP probes in flight at once
    #[arg(long = "probe-concurrency", default_value_t = DEFAULT_PROBE_CONCURRENCY)]
    probe_concurrency: usize,

    /// Per-probe timeout in seconds
    #[arg(long = "timeout", default_value_t = 10)]
    timeout_secs: u64,

    /// Extra attempts when a probe cannot connect
    #[arg(long = "connect-retries", default_value_t = DEFAULT_CONNECT_RETRIES)]
    connect_retries: usize,

    /// Override mmap threshold in bytes. If zero, disable mmap.
    #[arg(long = "mmap-threshold", default_value_t = DEFAULT_MMAP_THRESHOLD_BYTES)]
    mmap_threshold: u64,

    /// Suppress summary output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Exact source file name
    #[arg(long = "file-name")]
    file_name: Option<String>,

    /// Address substring
    #[arg(long = "address")]
    address: Option<String>,

    /// Exact IP address
    #[arg(long = "ip")]
    ip_address: Option<String>,

    /// URL path substring
    #[arg(long = "path")]
    url_path: Option<String>,

    /// Required tag (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Exact port
    #[arg(long = "port")]
    port: Option<u16>,

    /// Exact application label
    #[arg(long = "application")]
    application: Option<String>,

    #[arg(long = "offset", default_value_t = 0)]
    offset: u64,

    #[arg(long = "limit", default_value_t = DEFAULT_PAGE_LIMIT)]
    limit: u64,

    /// Print only the number of matching entries
    #[arg(long = "count")]
    count: bool,

    /// Write the listed page as CSV into this directory
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

fn verify_inputs(args: &IngestArgs) -> Result<()> {
    if args.files.is_empty() {
        bail!("no input files provided (-f/--files)");
    }
    for p in &args.files {
        if !p.is_file() {
            bail!("input file not found: {}", p.display());
        }
    }
    Ok(())
}

fn pipeline_config(args: &IngestArgs) -> PipelineConfig {
    PipelineConfig {
        threshold: args.threshold,
        batch_size: args.batch_size,
        probe_concurrency: args.probe_concurrency,
        probe_timeout: Duration::from_secs(args.timeout_secs),
        connect_retries: args.connect_retries,
        ..PipelineConfig::default()
    }
}

fn label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn open_store(url: &str) -> Option<SqliteStore> {
    match SqliteStore::open(url).await {
        Ok(store) => Some(store),
        Err(e) => {
            error!("failed to open database {}: {}", url, e);
            None
        }
    }
}

async fn ingest(database: &str, args: IngestArgs) -> i32 {
    if let Err(e) = verify_inputs(&args) {
        error!("{}", e);
        return 2;
    }
    let Some(store) = open_store(database).await else {
        return 3;
    };
    let pipeline = match Pipeline::new(
        pipeline_config(&args),
        Arc::new(SystemResolver),
        Arc::new(store),
    ) {
        Ok(p) => p,
        Err(e) => {
            error!("failed to set up prober: {}", e);
            return 4;
        }
    };
    let threshold = if args.mmap_threshold == 0 {
        u64::MAX
    } else {
        args.mmap_threshold
    };

    for path in &args.files {
        let lines = match iter_lines_auto(path, threshold) {
            Ok(lines) => lines,
            Err(e) => {
                error!("failed to read {}: {:#}", path.display(), e);
                return 2;
            }
        };
        info!("ingesting {}", path.display());
        match pipeline.process_lines(&label(path), lines).await {
            Ok(summary) => {
                if !args.quiet {
                    println!("{}", render_run_summary(&summary));
                }
            }
            Err(PipelineError::Read(e)) => {
                error!("failed to read {}: {}", path.display(), e);
                return 2;
            }
            Err(e) => {
                error!("failed to process {}: {}", path.display(), e);
                return 4;
            }
        }
    }
    0
}

async fn query(database: &str, args: QueryArgs) -> i32 {
    let Some(store) = open_store(database).await else {
        return 3;
    };
    let filter = RecordFilter {
        file_name: args.file_name,
        address: args.address,
        ip_address: args.ip_address,
        url_path: args.url_path,
        tags: args.tags,
        port: args.port,
        application: args.application,
    };
    let total = match store.count(&filter).await {
        Ok(n) => n,
        Err(e) => {
            error!("count failed: {}", e);
            return 4;
        }
    };
    if args.count {
        println!("{}", total);
        return 0;
    }
    let page = Page {
        offset: args.offset,
        limit: args.limit,
    };
    let entries = match store.search(&filter, page).await {
        Ok(entries) => entries,
        Err(e) => {
            error!("search failed: {}", e);
            return 4;
        }
    };
    println!("{}", render_entries(&entries, total));

    if let Some(outdir) = args.output {
        if let Err(e) = fs::create_dir_all(&outdir) {
            error!(
                "failed to create output directory {}: {}",
                outdir.display(),
                e
            );
            return 5;
        }
        let ts = chrono::Local::now().format("%Y.%m.%d_%H.%M.%S");
        let csv = outdir.join(format!("leakscope_entries_{}.csv", ts));
        if let Err(e) = save_entries_csv(&entries, &csv) {
            error!("failed to write {}: {}", csv.display(), e);
            return 5;
        }
        info!("wrote {} entries to {}", entries.len(), csv.display());
    }
    0
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    match cli.color {
        ColorChoice::Always => {
            colored::control::set_override(true);
        }
        ColorChoice::Never => {
            colored::control::set_override(false);
        }
        ColorChoice::Auto => {}
    }

    // Enrichment runs on one cooperative scheduler thread; DNS lookups are
    // pushed to the blocking pool.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(async move {
        match cli.command {
            Command::Ingest(args) => ingest(&cli.database, args).await,
            Command::Query(args) => query(&cli.database, args).await,
        }
    });
    if code != 0 {
        std::process::exit(code);
    }
}
