use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use oph_browser::{BrowserConfig, BrowserSession};
use oph_core::ProgressObserver;
use oph_crawl::{run_harvest, CancelFlag, RunConfig};
use oph_sheet::XlsxSink;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oph-cli")]
#[command(about = "Harvest product data from marketplace search results")]
struct Cli {
    /// Search query to collect products for.
    query: String,

    /// Maximum number of products to collect (0 = unbounded).
    #[arg(long, default_value_t = 0)]
    max_products: usize,

    /// Output spreadsheet path.
    #[arg(long, default_value = "products.xlsx")]
    output: PathBuf,

    /// Resume from the snapshot/ledger checkpoints of an interrupted run.
    #[arg(long)]
    resume: bool,

    /// Pre-collected links file; skips scroll collection entirely.
    #[arg(long)]
    links_file: Option<PathBuf>,

    /// WebDriver endpoint (chromedriver).
    #[arg(long, default_value = "http://localhost:9515")]
    webdriver_url: String,

    /// Run the browser headless.
    #[arg(long)]
    headless: bool,

    /// Directory for the snapshot and ledger checkpoint files.
    #[arg(long, default_value = ".")]
    checkpoint_dir: PathBuf,
}

/// Console progress: one log line per processed product.
#[derive(Debug, Default)]
struct LogProgress {
    total: usize,
    current: usize,
}

impl ProgressObserver for LogProgress {
    fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    fn advance(&mut self, n: usize) {
        self.current += n;
        info!(current = self.current, total = self.total, "progress");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = RunConfig::new(cli.query.as_str());
    config.output_file = cli.output.clone();
    config.resume = cli.resume;
    config.links_file = cli.links_file.clone();
    config.checkpoint_dir = cli.checkpoint_dir.clone();
    config.scroll.target_count = cli.max_products;

    let browser = BrowserConfig {
        webdriver_url: cli.webdriver_url.clone(),
        headless: cli.headless,
        ..BrowserConfig::default()
    };

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing the current item");
                cancel.cancel();
            }
        });
    }

    info!(query = %cli.query, "starting harvest");
    let session = BrowserSession::launch(browser, &cli.query).await?;

    let mut sink = XlsxSink::new(&config.output_file);
    let mut progress = LogProgress::default();
    let result = run_harvest(&session, &mut sink, &mut progress, &config, &cancel).await;

    // The browser closes on every exit path, success or not.
    if let Err(err) = session.close().await {
        error!(%err, "browser session close failed");
    }

    let summary = result?;
    println!(
        "harvest complete: run_id={} discovered={} pending={} processed={} retained={} output={}",
        summary.run_id,
        summary.discovered,
        summary.pending,
        summary.processed,
        summary.retained,
        summary.output_file
    );
    Ok(())
}
