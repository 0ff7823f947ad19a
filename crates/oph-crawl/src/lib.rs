//! Scroll collection, resume reconciliation and the harvest run loop.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oph_browser::{ProductExtractor, SearchPage};
use oph_core::{normalize_product_link, Dataset, LinkSet, ProductRecord, ProgressObserver};
use oph_sheet::DatasetSink;
use oph_storage::{LinkSnapshot, ProcessedLedger};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oph-crawl";

/// Cooperative cancellation checked at loop boundaries; once set, the run
/// stops taking on new work but finishes the current item.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded retry with a fixed delay between attempts. Runs the operation at
/// least once; the last error surfaces after the budget is spent.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    warn!(%err, attempt, "attempt failed, retrying");
                    attempt += 1;
                    sleep(self.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Tuning for the scroll-collection loop.
#[derive(Debug, Clone)]
pub struct ScrollConfig {
    /// CSS selector matching product anchors on the results page.
    pub css_selector: String,
    /// Substring a href must contain to count as a product link.
    pub link_fragment: String,
    /// Site origin prefixed onto relative hrefs.
    pub origin: String,
    pub scroll_step: u64,
    pub scroll_interval: Duration,
    /// Consecutive height-stable steps before the page counts as exhausted.
    pub max_no_growth: u32,
    /// Stop once this many links are collected (0 = unbounded).
    pub target_count: usize,
    /// Page-height reads retry briefly, then abort the run.
    pub height_retry: RetryPolicy,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            css_selector: "a[href*='/product/']".to_string(),
            link_fragment: "/product/".to_string(),
            origin: "https://ozon.ru".to_string(),
            scroll_step: 500,
            scroll_interval: Duration::from_millis(300),
            max_no_growth: 3,
            target_count: 0,
            height_retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(500),
            },
        }
    }
}

/// Scroll the results page until it is exhausted or the target count is
/// reached, persisting the discovered set after every step.
///
/// A pre-existing snapshot is merged in first, so a crashed collection picks
/// up where it stopped. On clean termination the snapshot file is removed;
/// on cancellation it is kept for the next run.
pub async fn collect_links<P: SearchPage + ?Sized>(
    page: &P,
    snapshot: &LinkSnapshot,
    config: &ScrollConfig,
    cancel: &CancelFlag,
) -> Result<LinkSet> {
    let mut links = match snapshot.load().await {
        Ok(existing) => {
            if !existing.is_empty() {
                info!(
                    count = existing.len(),
                    path = %snapshot.path().display(),
                    "resuming link collection from snapshot"
                );
            }
            existing
        }
        Err(err) => {
            warn!(%err, "snapshot unreadable, starting collection fresh");
            LinkSet::new()
        }
    };

    let mut last_height = read_height(page, &config.height_retry).await?;
    let mut position: u64 = 0;
    let mut no_growth: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            info!(collected = links.len(), "collection cancelled, snapshot kept");
            return Ok(links);
        }

        position += config.scroll_step;
        page.scroll_to(position)
            .await
            .context("scrolling results page")?;
        sleep(config.scroll_interval).await;

        match page.product_hrefs(&config.css_selector).await {
            Ok(hrefs) => {
                let new = links.merge(
                    hrefs
                        .iter()
                        .filter(|href| href.contains(&config.link_fragment))
                        .map(|href| normalize_product_link(&config.origin, href)),
                );
                info!(new, total = links.len(), "collected links this step");
            }
            Err(err) => warn!(%err, "anchor query failed, counting zero new links"),
        }

        if let Err(err) = snapshot.save(&links).await {
            warn!(%err, "snapshot save failed, continuing without checkpoint");
        }

        if config.target_count > 0 && links.len() >= config.target_count {
            links.truncate(config.target_count);
            info!(target = config.target_count, "target link count reached");
            break;
        }

        let new_height = read_height(page, &config.height_retry).await?;
        if position >= new_height && new_height == last_height {
            no_growth += 1;
            if no_growth >= config.max_no_growth {
                info!(total = links.len(), "results page exhausted");
                break;
            }
        } else {
            no_growth = 0;
        }
        last_height = new_height;
        position = new_height;
    }

    if let Err(err) = snapshot.clear().await {
        warn!(%err, "snapshot cleanup failed");
    }
    Ok(links)
}

// The height feeds the termination check, so exhausted retries are fatal
// rather than degraded.
async fn read_height<P: SearchPage + ?Sized>(page: &P, retry: &RetryPolicy) -> Result<u64> {
    retry
        .run(|| page.page_height())
        .await
        .context("reading page height")
}

/// Pending work is the discovered set minus the processed ledger, in
/// discovery order.
pub fn pending_links(links: &LinkSet, processed: &HashSet<String>) -> Vec<String> {
    links
        .iter()
        .filter(|link| !processed.contains(*link))
        .map(str::to_string)
        .collect()
}

/// Everything one harvest run needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub query: String,
    pub output_file: PathBuf,
    /// Reuse snapshot/ledger state left behind by an interrupted run.
    pub resume: bool,
    /// Pre-collected links file; bypasses scroll collection entirely.
    pub links_file: Option<PathBuf>,
    /// Directory holding the snapshot and ledger checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Processed-item interval between spreadsheet flushes.
    pub flush_every: usize,
    pub extract_retry: RetryPolicy,
    pub scroll: ScrollConfig,
}

impl RunConfig {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            output_file: PathBuf::from("products.xlsx"),
            resume: false,
            links_file: None,
            checkpoint_dir: PathBuf::from("."),
            flush_every: 2,
            extract_retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_secs(1),
            },
            scroll: ScrollConfig::default(),
        }
    }
}

/// Outcome of one harvest run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub already_processed: usize,
    pub pending: usize,
    pub processed: usize,
    pub retained: usize,
    pub cancelled: bool,
    pub output_file: String,
}

/// Run one full harvest: obtain the link set (links file, snapshot resume or
/// fresh scroll collection), subtract the processed ledger, then extract
/// every pending product and flush the dataset to the sink.
pub async fn run_harvest<S, K>(
    session: &S,
    sink: &mut K,
    progress: &mut dyn ProgressObserver,
    config: &RunConfig,
    cancel: &CancelFlag,
) -> Result<RunSummary>
where
    S: SearchPage + ProductExtractor,
    K: DatasetSink,
{
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let snapshot = LinkSnapshot::for_query(&config.checkpoint_dir, &config.query);
    let ledger = ProcessedLedger::for_query(&config.checkpoint_dir, &config.query);

    let links = obtain_links(session, &snapshot, config, cancel).await?;
    info!(%run_id, discovered = links.len(), "link set ready");

    let processed_before = if config.resume && ledger.exists() {
        match ledger.load().await {
            Ok(set) => set,
            Err(err) => {
                warn!(%err, "ledger unreadable, reprocessing everything");
                HashSet::new()
            }
        }
    } else {
        HashSet::new()
    };

    let pending = pending_links(&links, &processed_before);
    info!(
        pending = pending.len(),
        skipped = links.len() - pending.len(),
        "pending work computed"
    );

    let outcome = extract_all(session, sink, progress, config, &ledger, &pending, cancel).await?;

    Ok(RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        discovered: links.len(),
        already_processed: links.len() - pending.len(),
        pending: pending.len(),
        processed: outcome.processed,
        retained: outcome.retained,
        cancelled: cancel.is_cancelled(),
        output_file: config.output_file.display().to_string(),
    })
}

/// Link-set acquisition, in priority order: explicit links file, snapshot
/// resume, fresh scroll collection.
async fn obtain_links<P: SearchPage + ?Sized>(
    page: &P,
    snapshot: &LinkSnapshot,
    config: &RunConfig,
    cancel: &CancelFlag,
) -> Result<LinkSet> {
    if let Some(path) = &config.links_file {
        if path.exists() {
            info!(path = %path.display(), "loading pre-collected links file");
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading links file {}", path.display()))?;
            let mut links = LinkSet::new();
            links.merge(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|line| normalize_product_link(&config.scroll.origin, line)),
            );
            return Ok(links);
        }
        warn!(path = %path.display(), "links file missing, falling back");
    }

    if config.resume && snapshot.exists() {
        info!(path = %snapshot.path().display(), "resuming from collection snapshot");
        return snapshot.load().await;
    }

    collect_links(page, snapshot, &config.scroll, cancel).await
}

struct ExtractOutcome {
    processed: usize,
    retained: usize,
}

async fn extract_all<S, K>(
    session: &S,
    sink: &mut K,
    progress: &mut dyn ProgressObserver,
    config: &RunConfig,
    ledger: &ProcessedLedger,
    pending: &[String],
    cancel: &CancelFlag,
) -> Result<ExtractOutcome>
where
    S: ProductExtractor + ?Sized,
    K: DatasetSink,
{
    let mut dataset = Dataset::new();
    let mut processed = 0usize;
    let flush_every = config.flush_every.max(1);
    progress.set_total(pending.len());

    for link in pending {
        if cancel.is_cancelled() {
            info!(
                processed,
                remaining = pending.len() - processed,
                "extraction cancelled"
            );
            break;
        }

        processed += 1;
        info!(processed, total = pending.len(), %link, "processing product");

        let record = match config.extract_retry.run(|| session.extract(link)).await {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, %link, "extraction failed after retries, recording absent row");
                ProductRecord::absent(link.clone())
            }
        };

        if record.sku.is_some() {
            dataset.insert(record);
            if let Err(err) = ledger.append(link).await {
                warn!(%err, %link, "ledger append failed");
            }
        }
        progress.advance(1);

        if processed % flush_every == 0 {
            if let Err(err) = sink.flush(&dataset) {
                warn!(%err, "interim flush failed, data stays buffered");
            }
        }
    }

    if !dataset.is_empty() {
        sink.flush(&dataset).context("final dataset flush")?;
    }

    Ok(ExtractOutcome {
        processed,
        retained: dataset.len(),
    })
}
