//! Fans a source list out across a fixed pool of worker tasks: each pulls
//! from a shared queue, fetches, resolves ambiguity, runs the kernel, and
//! writes under the store's shared write lock.

use std::collections::HashMap;
use std::sync::Arc;

use nwlc_fetch::{FetchMode, Fetcher};
use nwlc_retry::{Outcome, RetryController};
use nwlc_store::Store;
use nwlc_types::{Band, RawCatalogRow, Source};
use nwlc_zp_table::ZpTable;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// One target to ingest: a coordinate pair plus optional catalog identifier.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub source_id: String,
    pub ra: f64,
    pub dec: f64,
    pub allwise_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutcome {
    pub source_id: String,
    pub success: bool,
    pub message: String,
}

impl SourceOutcome {
    fn success(source_id: &str) -> SourceOutcome {
        SourceOutcome { source_id: source_id.to_string(), success: true, message: "success".to_string() }
    }

    fn failed(source_id: &str, message: impl Into<String>) -> SourceOutcome {
        SourceOutcome { source_id: source_id.to_string(), success: false, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub use_tap: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> WorkerPoolConfig {
        WorkerPoolConfig { workers: 4, use_tap: false }
    }
}

/// Runs every item in `items` to completion and returns one outcome per
/// item, in completion order (not input order).
pub async fn run(
    items: Vec<WorkItem>,
    store: Store,
    zp: Arc<ZpTable>,
    fetcher: Arc<Fetcher>,
    retry: Arc<RetryController>,
    config: WorkerPoolConfig,
    cancel: CancellationToken,
) -> Vec<SourceOutcome> {
    let queue = Arc::new(AsyncMutex::new(items.into_iter()));
    let results = Arc::new(AsyncMutex::new(Vec::new()));
    let worker_count = config.workers.max(1);

    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let queue = queue.clone();
        let results = results.clone();
        let store = store.clone();
        let zp = zp.clone();
        let fetcher = fetcher.clone();
        let retry = retry.clone();
        let cancel = cancel.clone();
        let use_tap = config.use_tap;

        handles.push(tokio::spawn(async move {
            let mut conn = match store.connect() {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("worker {worker_id} could not open a store connection: {e}");
                    return;
                }
            };

            loop {
                if cancel.is_cancelled() {
                    log::debug!("worker {worker_id} exiting on cancellation");
                    break;
                }
                let item = { queue.lock().await.next() };
                let Some(item) = item else {
                    break;
                };

                let outcome =
                    process_one(&item, &mut conn, zp.clone(), &fetcher, &retry, use_tap).await;
                match outcome.success {
                    true => log::info!("source {} ingested", outcome.source_id),
                    false => log::warn!("source {} failed: {}", outcome.source_id, outcome.message),
                }
                results.lock().await.push(outcome);
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("worker task panicked: {e}");
        }
    }

    Arc::try_unwrap(results).expect("all worker tasks joined").into_inner()
}

async fn process_one(
    item: &WorkItem,
    conn: &mut nwlc_store::StoreConnection,
    zp: Arc<ZpTable>,
    fetcher: &Fetcher,
    retry: &RetryController,
    use_tap: bool,
) -> SourceOutcome {
    let mode = match (use_tap, &item.allwise_id) {
        (true, Some(id)) if !id.is_empty() => FetchMode::Identifier { allwise_id: id.clone() },
        _ => FetchMode::Cone { ra: item.ra, dec: item.dec },
    };

    let fetch_outcome = retry.call(|| async { fetcher.fetch(&mode).await }).await;
    let rows = match fetch_outcome {
        Outcome::Success(rows) => rows,
        Outcome::Failed(err) => return SourceOutcome::failed(&item.source_id, err.to_string()),
        Outcome::Aborted => return SourceOutcome::failed(&item.source_id, "aborted"),
    };

    let rows = resolve_allwise_ambiguity(rows);
    if rows.is_empty() {
        return SourceOutcome::failed(&item.source_id, "No valid data");
    }
    let allwise_cntr = rows[0].allwise_cntr;

    // The kernel is pure CPU work; run it off the reactor thread so a large
    // source's sigma-clip/epoch pass never stalls other workers' polling.
    let source_id = item.source_id.clone();
    let (raw_out, epoch_out, any_band_had_data) = match tokio::task::spawn_blocking(move || {
        let mut raw_out = Vec::new();
        let mut epoch_out = Vec::new();
        let mut any_band_had_data = false;

        for band in Band::ALL {
            let band_rows: Vec<_> = rows.iter().filter_map(|r| r.band_row(band)).collect();
            let band_rows = nwlc_kernel::apply_mjd_cutoff(&band_rows, &zp);
            if band_rows.is_empty() {
                continue;
            }
            any_band_had_data = true;
            raw_out.extend(nwlc_kernel::build_raw_observations(&source_id, &band_rows, band, &zp));
            epoch_out.extend(nwlc_kernel::default_epoch_summaries(&source_id, &band_rows, band, &zp));
        }
        (raw_out, epoch_out, any_band_had_data)
    })
    .await
    {
        Ok(result) => result,
        Err(e) => return SourceOutcome::failed(&item.source_id, format!("kernel task panicked: {e}")),
    };

    if !any_band_had_data {
        return SourceOutcome::failed(&item.source_id, "No data after MJD filtering");
    }

    if let Err(e) = conn.upsert_source(&Source::new(item.source_id.clone(), item.ra, item.dec, allwise_cntr)) {
        return SourceOutcome::failed(&item.source_id, format!("write failed: {e}"));
    }
    if let Err(e) = conn.insert_raw_batch(&raw_out) {
        return SourceOutcome::failed(&item.source_id, format!("write failed: {e}"));
    }
    if let Err(e) = conn.insert_epoch_batch(&epoch_out) {
        return SourceOutcome::failed(&item.source_id, format!("write failed: {e}"));
    }

    SourceOutcome::success(&item.source_id)
}

/// Keeps only the rows belonging to the most frequent `allwise_cntr` value.
/// A `None` identifier counts as its own bucket, matching the reference
/// behaviour of treating a missing counter as a distinct (non-)value. Ties
/// break on the counter value itself so the result doesn't depend on
/// `HashMap` iteration order.
fn resolve_allwise_ambiguity(rows: Vec<RawCatalogRow>) -> Vec<RawCatalogRow> {
    if rows.is_empty() {
        return rows;
    }
    let mut counts: HashMap<Option<i64>, usize> = HashMap::new();
    for row in &rows {
        *counts.entry(row.allwise_cntr).or_insert(0) += 1;
    }
    if counts.len() <= 1 {
        return rows;
    }
    let mut counts: Vec<(Option<i64>, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let most_frequent = counts[0].0;
    rows.into_iter().filter(|r| r.allwise_cntr == most_frequent).collect()
}
