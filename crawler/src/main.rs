use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use sitemirror::{shared_store, Config, Crawler, Database, HttpFetcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

/// Mirror a website into a directory of static files
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Seed URL; overrides `start_page` from the config file
    url: Option<String>,

    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Maximum crawl depth, 0 for unlimited
    #[clap(short, long)]
    max_depth: Option<u32>,

    #[clap(long)]
    page_workers: Option<usize>,

    #[clap(long)]
    asset_workers: Option<usize>,

    /// Output directory for the mirror
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Database file path
    #[clap(short, long)]
    db_path: Option<PathBuf>,

    #[clap(long)]
    user_agent: Option<String>,

    /// Mirror assets hosted on other sites
    #[clap(long)]
    outsite_asset: Option<bool>,

    #[clap(long)]
    no_js: Option<bool>,

    #[clap(long)]
    no_css: Option<bool>,

    #[clap(long)]
    no_images: Option<bool>,

    #[clap(long)]
    no_fonts: Option<bool>,

    /// Regex of URLs never to fetch; repeatable
    #[clap(long = "black-list")]
    black_list: Vec<String>,

    /// Stop once every admitted URL has been processed
    #[clap(long)]
    exit_when_done: bool,

    /// Seconds between progress reports
    #[clap(long, default_value = "10")]
    progress_interval: u64,

    /// Log level
    #[clap(short, long, default_value = "info")]
    log_level: LevelFilter,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(url) = self.url {
            config.start_page = url;
        }
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if let Some(count) = self.page_workers {
            config.page_worker_count = count;
        }
        if let Some(count) = self.asset_workers {
            config.asset_worker_count = count;
        }
        if let Some(output) = self.output {
            config.site_path = output;
        }
        if let Some(db_path) = self.db_path {
            config.site_db_path = db_path;
        }
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }
        if let Some(flag) = self.outsite_asset {
            config.outsite_asset = flag;
        }
        if let Some(flag) = self.no_js {
            config.no_js = flag;
        }
        if let Some(flag) = self.no_css {
            config.no_css = flag;
        }
        if let Some(flag) = self.no_images {
            config.no_images = flag;
        }
        if let Some(flag) = self.no_fonts {
            config.no_fonts = flag;
        }
        config.black_list.extend(self.black_list);

        config.finalize()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .init();

    let exit_when_done = args.exit_when_done;
    let progress_interval = Duration::from_secs(args.progress_interval.max(1));
    let config = args.into_config().context("Invalid configuration")?;
    info!("Mirroring {} into {:?}", config.start_page, config.site_path);

    // Initialize database
    let db = Database::new(&config.site_db_path).context("Failed to initialize database")?;
    let store = shared_store(db);

    let fetcher = HttpFetcher::new(
        &config.user_agent,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let crawler = Arc::new(Crawler::new(config, store, Arc::new(fetcher))?);
    crawler.prepare().context("Failed to prepare the frontier")?;
    let handle = crawler.start();

    // Periodic progress report
    let progress = {
        let frontier = Arc::clone(crawler.frontier());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(progress_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match frontier.counts() {
                    Ok(counts) => info!("Progress: {}", counts),
                    Err(e) => warn!("Failed to read progress: {}", e),
                }
            }
        })
    };

    let drained = async {
        if exit_when_done {
            crawler.wait_until_drained(Duration::from_millis(500)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = drained => {
            info!("Every admitted URL has been processed");
        }
    }

    progress.abort();
    let saved = handle.stop().await?;
    let counts = crawler.frontier().counts()?;
    info!("Stopped with {} queued tasks saved; {}", saved, counts);

    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
