//! Top-level orchestrator: parses the source list, loads the zero-point
//! table, opens the store, builds the HTTP client and worker pool, and
//! prints a run summary.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use nwlc_fetch::Fetcher;
use nwlc_retry::RetryController;
use nwlc_store::Store;
use nwlc_worker::{WorkItem, WorkerPoolConfig};
use nwlc_zp_table::ZpTable;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{Retryable, RetryableStrategy, RetryTransientMiddleware};
use serde::Deserialize;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

const DEFAULT_POOL_MAXSIZE: usize = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TRANSPORT_RETRY_ATTEMPTS: u32 = 3;
const TRANSPORT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const TRANSPORT_BACKOFF_FACTOR: Duration = Duration::from_secs(1);

/// Retries only the status codes IRSA is documented to shed load with,
/// instead of `reqwest-retry`'s broader default set.
struct TransportRetryStrategy;

impl RetryableStrategy for TransportRetryStrategy {
    fn handle(
        &self,
        response: &Result<reqwest::Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match response {
            Ok(r) if TRANSPORT_RETRY_STATUSES.contains(&r.status().as_u16()) => {
                Some(Retryable::Transient)
            }
            Ok(_) => None,
            Err(_) => Some(Retryable::Transient),
        }
    }
}

/// Builds the HTTP client every worker shares: a connection pool sized by
/// `pool_maxsize` wrapped in a transport-level retry layer, independent of
/// and beneath the application-level Retry Controller.
fn build_http_client(pool_maxsize: usize) -> ClientWithMiddleware {
    let inner = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_maxsize)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("reqwest client configuration is valid");

    let backoff = ExponentialBackoff::builder()
        .retry_bounds(TRANSPORT_BACKOFF_FACTOR, TRANSPORT_BACKOFF_FACTOR * 8)
        .build_with_max_retries(TRANSPORT_RETRY_ATTEMPTS);

    reqwest_middleware::ClientBuilder::new(inner)
        .with(RetryTransientMiddleware::new_with_policy_and_strategy(backoff, TransportRetryStrategy))
        .build()
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to read config file {}: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    ReadConfig { path: PathBuf, source: std::io::Error, backtrace: Backtrace },

    #[snafu(display("config file {} is not valid TOML: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    ParseConfig { path: PathBuf, source: toml::de::Error, backtrace: Backtrace },

    #[snafu(display("no source list given: pass --sources or set `sources` in --config\nBacktrace:\n{backtrace}"))]
    MissingSources { backtrace: Backtrace },

    #[snafu(display("no database path given: pass --database or set `database` in --config\nBacktrace:\n{backtrace}"))]
    MissingDatabase { backtrace: Backtrace },

    #[snafu(display("no zero-point table path given: pass --zp-table or set `zp_table` in --config\nBacktrace:\n{backtrace}"))]
    MissingZpTable { backtrace: Backtrace },

    #[snafu(display("failed to read source list {}: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    ReadSourceList { path: PathBuf, source: csv::Error, backtrace: Backtrace },

    #[snafu(display("source list {} has an invalid row: {}\nBacktrace:\n{}", path.display(), message, backtrace))]
    InvalidSourceRow { path: PathBuf, message: String, backtrace: Backtrace },

    #[snafu(display("failed to load zero-point table: {}\nBacktrace:\n{}", source, backtrace))]
    ZpTable { source: nwlc_zp_table::Error, backtrace: Backtrace },

    #[snafu(display("failed to open store: {}\nBacktrace:\n{}", source, backtrace))]
    Store { source: nwlc_store::Error, backtrace: Backtrace },
}

/// CLI flags; each is the final, highest-precedence layer over an optional
/// `--config` file and the built-in defaults.
#[derive(Debug, Clone, Parser)]
#[command(name = "nwlc-ingest", about = "Ingests NEOWISE light curves for a list of sources")]
struct Cli {
    /// Path to a TOML config file merged beneath these flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source list CSV: source_id, ra, dec, optional AllWISE_ID.
    #[arg(long)]
    sources: Option<PathBuf>,

    /// SQLite database file, created if it doesn't exist.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Zero-point correction table CSV.
    #[arg(long = "zp-table")]
    zp_table: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_concurrent_queries: Option<usize>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    pool_maxsize: Option<usize>,

    /// Use TAP identifier search when a source has an AllWISE_ID, falling
    /// back to cone search otherwise.
    #[arg(long)]
    use_tap: bool,

    /// Truncate all tables before ingesting.
    #[arg(long)]
    clear: bool,

    /// Delete the database file before ingesting.
    #[arg(long)]
    drop: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    sources: Option<PathBuf>,
    database: Option<PathBuf>,
    zp_table: Option<PathBuf>,
    workers: Option<usize>,
    max_concurrent_queries: Option<usize>,
    max_attempts: Option<u32>,
    pool_maxsize: Option<usize>,
    use_tap: Option<bool>,
    clear: Option<bool>,
    drop: Option<bool>,
}

#[derive(Debug, Clone)]
struct Config {
    sources: PathBuf,
    database: PathBuf,
    zp_table: PathBuf,
    workers: usize,
    max_concurrent_queries: usize,
    max_attempts: u32,
    pool_maxsize: usize,
    use_tap: bool,
    clear: bool,
    drop: bool,
}

fn load_file_config(path: &Path) -> Result<FileConfig, Error> {
    let text = std::fs::read_to_string(path).context(ReadConfigSnafu { path: path.to_path_buf() })?;
    toml::from_str(&text).context(ParseConfigSnafu { path: path.to_path_buf() })
}

/// Layers CLI flags over an optional config file over built-in defaults.
fn build_config(cli: Cli) -> Result<Config, Error> {
    let file = match &cli.config {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };

    Ok(Config {
        sources: cli.sources.or(file.sources).context(MissingSourcesSnafu)?,
        database: cli.database.or(file.database).context(MissingDatabaseSnafu)?,
        zp_table: cli.zp_table.or(file.zp_table).context(MissingZpTableSnafu)?,
        workers: cli.workers.or(file.workers).unwrap_or(WorkerPoolConfig::default().workers),
        max_concurrent_queries: cli
            .max_concurrent_queries
            .or(file.max_concurrent_queries)
            .unwrap_or(nwlc_retry::DEFAULT_MAX_CONCURRENT_QUERIES),
        max_attempts: cli.max_attempts.or(file.max_attempts).unwrap_or(nwlc_retry::DEFAULT_MAX_ATTEMPTS),
        pool_maxsize: cli.pool_maxsize.or(file.pool_maxsize).unwrap_or(DEFAULT_POOL_MAXSIZE),
        use_tap: cli.use_tap || file.use_tap.unwrap_or(false),
        clear: cli.clear || file.clear.unwrap_or(false),
        drop: cli.drop || file.drop.unwrap_or(false),
    })
}

/// Parses the source list CSV into work items. Rows with an empty
/// `source_id` are skipped; `AllWISE_ID` is optional and blank values are
/// treated as absent.
fn load_sources(path: &Path) -> Result<Vec<WorkItem>, Error> {
    let mut reader =
        csv::Reader::from_path(path).context(ReadSourceListSnafu { path: path.to_path_buf() })?;
    let headers = reader.headers().context(ReadSourceListSnafu { path: path.to_path_buf() })?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);

    let source_id_col = column("source_id").ok_or_else(|| {
        InvalidSourceRowSnafu { path: path.to_path_buf(), message: "missing source_id column".to_string() }
            .build()
    })?;
    let ra_col = column("ra").ok_or_else(|| {
        InvalidSourceRowSnafu { path: path.to_path_buf(), message: "missing ra column".to_string() }.build()
    })?;
    let dec_col = column("dec").ok_or_else(|| {
        InvalidSourceRowSnafu { path: path.to_path_buf(), message: "missing dec column".to_string() }.build()
    })?;
    let allwise_col = column("AllWISE_ID");

    let mut items = Vec::new();
    for record in reader.records() {
        let record = record.context(ReadSourceListSnafu { path: path.to_path_buf() })?;
        let source_id = record.get(source_id_col).unwrap_or("").trim().to_string();
        if source_id.is_empty() {
            continue;
        }
        let ra: f64 = record.get(ra_col).unwrap_or("").trim().parse().map_err(|_| {
            InvalidSourceRowSnafu { path: path.to_path_buf(), message: format!("bad ra for {source_id}") }
                .build()
        })?;
        let dec: f64 = record.get(dec_col).unwrap_or("").trim().parse().map_err(|_| {
            InvalidSourceRowSnafu { path: path.to_path_buf(), message: format!("bad dec for {source_id}") }
                .build()
        })?;
        let allwise_id = allwise_col
            .and_then(|col| record.get(col))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        items.push(WorkItem { source_id, ra, dec, allwise_id });
    }
    Ok(items)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    nwlc_logger::init();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<std::process::ExitCode, Error> {
    let config = build_config(cli)?;

    let mut store = Store::open(&config.database).context(StoreSnafu)?;
    if config.drop {
        store.drop_database().context(StoreSnafu)?;
        store = Store::open(&config.database).context(StoreSnafu)?;
    }
    if config.clear {
        store.clear().context(StoreSnafu)?;
    }

    let zp = Arc::new(ZpTable::load(&config.zp_table).context(ZpTableSnafu)?);
    let items = load_sources(&config.sources)?;

    if items.is_empty() {
        log::info!("no sources in {}; nothing to do", config.sources.display());
        return Ok(std::process::ExitCode::SUCCESS);
    }

    let client = build_http_client(config.pool_maxsize);
    let fetcher = Arc::new(Fetcher::new(client));
    let cancel = CancellationToken::new();
    let retry = Arc::new(RetryController::new(config.max_concurrent_queries, config.max_attempts, cancel.clone()));
    let pool_config = WorkerPoolConfig { workers: config.workers, use_tap: config.use_tap };

    let total = items.len();
    let start = Instant::now();
    let outcomes = nwlc_worker::run(items, store, zp, fetcher, retry, pool_config, cancel).await;
    let elapsed = start.elapsed();

    let success = outcomes.iter().filter(|o| o.success).count();
    let failure = outcomes.len() - success;

    let mut seen = HashSet::new();
    let mut messages = Vec::new();
    for outcome in outcomes.iter().filter(|o| !o.success) {
        if seen.insert(outcome.message.clone()) {
            messages.push(outcome.message.clone());
            if messages.len() == 10 {
                break;
            }
        }
    }

    log::info!(
        "ingest complete: {success}/{total} succeeded, {failure} failed, elapsed {:.1}s",
        elapsed.as_secs_f64()
    );
    for message in &messages {
        log::warn!("sample failure: {message}");
    }

    Ok(std::process::ExitCode::SUCCESS)
}
