use anyhow::{anyhow, Context, Result};
use log::info;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Mirror configuration, immutable once the crawler starts
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seed URL
    pub start_page: String,

    /// Host (with port, if any) of the seed URL; derived by [`Config::finalize`]
    #[serde(skip)]
    pub main_site: String,

    pub user_agent: String,

    pub page_worker_count: usize,
    pub asset_worker_count: usize,

    /// Expected number of links in a single page, used to size the queues
    pub link_ratio_in_single_page: usize,

    /// Live queue capacities; 0 means workers × link ratio
    pub page_queue_size: usize,
    pub asset_queue_size: usize,

    /// Depth of the crawl counted from 1 (the seed); 0 is unlimited
    pub max_depth: u32,

    /// Transport failures tolerated before a task is marked failed
    pub max_retry_times: u32,

    /// Mirror assets hosted on other sites
    pub outsite_asset: bool,
    pub no_js: bool,
    pub no_css: bool,
    pub no_images: bool,
    pub no_fonts: bool,

    /// Regex patterns; matching URLs are never fetched
    pub black_list: Vec<String>,

    #[serde(skip)]
    pub black_list_patterns: Vec<Regex>,

    /// SQLite file holding the URL registry
    pub site_db_path: PathBuf,

    /// Output directory for the mirror
    pub site_path: PathBuf,

    pub request_timeout_secs: u64,

    /// How often the dispatcher tops up the live queues from the backlog
    pub refill_interval_ms: u64,

    /// How long in-flight workers get to finish after a shutdown signal
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_page: String::new(),
            main_site: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            page_worker_count: 10,
            asset_worker_count: 10,
            link_ratio_in_single_page: 5000,
            page_queue_size: 0,
            asset_queue_size: 0,
            max_depth: 1,
            max_retry_times: 5,
            outsite_asset: true,
            no_js: true,
            no_css: false,
            no_images: false,
            no_fonts: false,
            black_list: Vec::new(),
            black_list_patterns: Vec::new(),
            site_db_path: PathBuf::from("site.db"),
            site_path: PathBuf::from("sites"),
            request_timeout_secs: 30,
            refill_interval_ms: 500,
            shutdown_grace_secs: 5,
        }
    }
}

impl Config {
    /// Default configuration for a seed URL, already finalized
    pub fn for_start_page(start_page: &str) -> Result<Self> {
        let mut config = Config {
            start_page: start_page.to_string(),
            ..Config::default()
        };
        config.finalize()?;
        Ok(config)
    }

    /// Load a TOML file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {:?}", path);

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    /// Validate and derive the computed fields
    pub fn finalize(&mut self) -> Result<()> {
        if self.start_page.is_empty() {
            return Err(anyhow!("No start page given"));
        }

        let mut start = Url::parse(&self.start_page)
            .with_context(|| format!("Invalid start page: {}", self.start_page))?;
        start.set_fragment(None);

        self.main_site = host_with_port(&start)
            .ok_or_else(|| anyhow!("Start page has no host: {}", self.start_page))?;
        self.start_page = start.to_string();

        if self.page_worker_count == 0 || self.asset_worker_count == 0 {
            return Err(anyhow!("Worker counts must be at least 1"));
        }

        if self.page_queue_size == 0 {
            self.page_queue_size = self.page_worker_count * self.link_ratio_in_single_page.max(1);
        }
        if self.asset_queue_size == 0 {
            self.asset_queue_size = self.asset_worker_count * self.link_ratio_in_single_page.max(1);
        }

        self.black_list_patterns = self
            .black_list
            .iter()
            .map(|rule| {
                Regex::new(rule).with_context(|| format!("Invalid black list pattern: {}", rule))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(())
    }
}

/// `host` or `host:port`, the form used to compare URLs against the main site
pub fn host_with_port(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
