use crate::charset::Charset;
use crate::config::Config;
use crate::error::CrawlError;
use crate::extractor::LinkRewriter;
use crate::fetcher::{FetchResponse, Fetcher};
use crate::frontier::{Frontier, SharedStore};
use crate::local_path::LocalPathMapper;
use crate::models::{TaskStatus, UrlTask, UrlType};
use crate::scope::ScopePolicy;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

/// What happened to a task handed to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Written to the mirror and marked `Success`
    Saved,
    /// Transport failure; put back with `failed_times + 1`
    Requeued,
    /// 404, marked `Failed`
    NotFound,
    /// Too many failures, marked `Failed` without a fetch
    RetryCeiling,
    /// Page deeper than `max_depth`, marked `Failed` without a fetch
    DepthCeiling,
}

enum Fetched {
    Body(FetchResponse),
    Done(Outcome),
}

/// Explicit crawl context shared by every worker
pub struct Crawler {
    config: Config,
    frontier: Arc<Frontier>,
    fetcher: Arc<dyn Fetcher>,
    rewriter: LinkRewriter,
    mapper: LocalPathMapper,
}

impl Crawler {
    /// Build a crawler from a finalized configuration
    pub fn new(config: Config, store: SharedStore, fetcher: Arc<dyn Fetcher>) -> Result<Self, CrawlError> {
        let mapper = LocalPathMapper::new(&config.main_site);
        let rewriter = LinkRewriter::new(ScopePolicy::new(&config), mapper.clone())?;
        let frontier = Arc::new(Frontier::new(store, config.page_queue_size, config.asset_queue_size));

        Ok(Self {
            config,
            frontier,
            fetcher,
            rewriter,
            mapper,
        })
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Recover the previous run's backlog and admit the seed URL
    pub fn prepare(&self) -> Result<(), CrawlError> {
        self.frontier.resume()?;

        let start_page = &self.config.start_page;
        if self.frontier.contains(start_page)? {
            info!("Seed {} already known, resuming", start_page);
            return Ok(());
        }

        self.frontier.enqueue(UrlTask::seed(start_page))?;
        info!("Seeded crawl with {}", start_page);
        Ok(())
    }

    /// Spawn the page workers, asset workers and the backlog dispatcher
    pub fn start(self: &Arc<Self>) -> CrawlHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        info!(
            "Starting {} page workers and {} asset workers",
            self.config.page_worker_count, self.config.asset_worker_count
        );

        for (url_type, count) in [
            (UrlType::Page, self.config.page_worker_count),
            (UrlType::Asset, self.config.asset_worker_count),
        ] {
            for worker_id in 0..count {
                let crawler = Arc::clone(self);
                let shutdown = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    crawler.worker(url_type, worker_id, shutdown).await;
                }));
            }
        }

        let interval = Duration::from_millis(self.config.refill_interval_ms.max(1));
        handles.push(tokio::spawn(
            Arc::clone(&self.frontier).run_dispatcher(interval, shutdown_rx),
        ));

        CrawlHandle {
            shutdown: shutdown_tx,
            handles,
            frontier: Arc::clone(&self.frontier),
            grace: Duration::from_secs(self.config.shutdown_grace_secs),
        }
    }

    /// Resolve once no record is waiting or in flight
    pub async fn wait_until_drained(&self, poll: Duration) {
        loop {
            match self.frontier.is_drained() {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!("Failed to read crawl progress: {}", e),
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn worker(self: Arc<Self>, url_type: UrlType, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("{} worker {} started", url_type, worker_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let task = tokio::select! {
                task = self.frontier.next(url_type) => task,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let Some(task) = task else {
                break;
            };

            self.handle(task).await;
        }

        debug!("{} worker {} stopped", url_type, worker_id);
    }

    /// Run one task through its pipeline. Errors are logged and never escape.
    pub async fn handle(&self, task: UrlTask) -> Option<Outcome> {
        let url = task.url.clone();
        let result = match task.url_type {
            UrlType::Page => self.process_page(task).await,
            UrlType::Asset => self.process_asset(task).await,
        };

        match result {
            Ok(outcome) => {
                debug!("{} -> {:?}", url, outcome);
                Some(outcome)
            }
            Err(CrawlError::Store(e)) => {
                warn!("Record store error while processing {}: {}", url, e);
                None
            }
            Err(e) => {
                warn!("Dropping {}: {}", url, e);
                if let Err(e) = self.frontier.mark(&url, TaskStatus::Failed) {
                    warn!("Failed to record failure for {}: {}", url, e);
                }
                None
            }
        }
    }

    /// Fetch, transcode, rewrite and save one page
    pub async fn process_page(&self, task: UrlTask) -> Result<Outcome, CrawlError> {
        if let Some(outcome) = self.check_ceilings(&task)? {
            return Ok(outcome);
        }

        let response = match self.fetch(&task).await? {
            Fetched::Body(response) => response,
            Fetched::Done(outcome) => return Ok(outcome),
        };

        let charset = Charset::detect(&response.body)?;
        let text = charset.decode(&response.body);

        let max_depth = self.config.max_depth;
        let follow_pages = max_depth == 0 || task.depth + 1 <= max_depth;
        let rewritten = self.rewriter.rewrite_html(&text, &task, follow_pages)?;
        self.enqueue_all(rewritten.discovered);

        let bytes = charset.encode(&rewritten.text);
        let path = self.save(&task, &bytes).await?;
        self.frontier.mark(&task.url, TaskStatus::Success)?;

        info!("Saved page {} ({}) to {:?}", task.url, charset.name(), path);
        Ok(Outcome::Saved)
    }

    /// Fetch and save one asset, rewriting stylesheets
    pub async fn process_asset(&self, task: UrlTask) -> Result<Outcome, CrawlError> {
        if let Some(outcome) = self.check_ceilings(&task)? {
            return Ok(outcome);
        }

        let response = match self.fetch(&task).await? {
            Fetched::Body(response) => response,
            Fetched::Done(outcome) => return Ok(outcome),
        };

        let body = if response.is_css() {
            let charset = Charset::detect_css(&response.body);
            let css = charset.decode(&response.body);
            let rewritten = self.rewriter.rewrite_css(&css, &task)?;
            self.enqueue_all(rewritten.discovered);
            charset.encode(&rewritten.text)
        } else {
            response.body
        };

        let path = self.save(&task, &body).await?;
        self.frontier.mark(&task.url, TaskStatus::Success)?;

        debug!("Saved asset {} to {:?}", task.url, path);
        Ok(Outcome::Saved)
    }

    fn check_ceilings(&self, task: &UrlTask) -> Result<Option<Outcome>, CrawlError> {
        let max_depth = self.config.max_depth;
        if task.url_type == UrlType::Page && max_depth != 0 && task.depth > max_depth {
            info!("Dropping {}: depth {} exceeds {}", task.url, task.depth, max_depth);
            self.frontier.mark(&task.url, TaskStatus::Failed)?;
            return Ok(Some(Outcome::DepthCeiling));
        }

        if task.failed_times > self.config.max_retry_times {
            warn!("Giving up on {} after {} failures", task.url, task.failed_times);
            self.frontier.mark(&task.url, TaskStatus::Failed)?;
            return Ok(Some(Outcome::RetryCeiling));
        }

        Ok(None)
    }

    async fn fetch(&self, task: &UrlTask) -> Result<Fetched, CrawlError> {
        let result = match self.fetcher.get(&task.url, &task.refer).await {
            Ok(response) if response.status == 404 => {
                warn!("Not found: {} (linked from {})", task.url, task.refer);
                self.frontier.mark(&task.url, TaskStatus::Failed)?;
                return Ok(Fetched::Done(Outcome::NotFound));
            }
            Ok(response) if response.status >= 400 => {
                Err(CrawlError::Transport(format!("HTTP {}", response.status)))
            }
            other => other,
        };

        match result {
            Ok(response) => Ok(Fetched::Body(response)),
            Err(e) if e.is_retryable() => {
                warn!("Failed to fetch {}: {} (attempt {})", task.url, e, task.failed_times + 1);
                let mut retry = task.clone();
                retry.failed_times += 1;
                self.frontier.requeue(retry)?;
                Ok(Fetched::Done(Outcome::Requeued))
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue_all(&self, tasks: Vec<UrlTask>) {
        for task in tasks {
            let url = task.url.clone();
            if let Err(e) = self.frontier.enqueue(task) {
                warn!("Failed to enqueue {}: {}", url, e);
            }
        }
    }

    async fn save(&self, task: &UrlTask, bytes: &[u8]) -> Result<PathBuf, CrawlError> {
        let url = Url::parse(&task.url).map_err(|_| CrawlError::PathMapping(task.url.clone()))?;
        let (dir, file) = self.mapper.local_path(&url, task.url_type)?;

        let dir = self.config.site_path.join(dir);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// Running workers plus the means to stop them
pub struct CrawlHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    frontier: Arc<Frontier>,
    grace: Duration,
}

impl CrawlHandle {
    /// Signal every worker, give in-flight tasks the grace period, abort the
    /// rest and save the live queues to the store. Returns how many queued
    /// tasks were saved.
    pub async fn stop(self) -> Result<usize, CrawlError> {
        info!("Stopping crawl");
        if self.shutdown.send(true).is_err() {
            debug!("All workers already exited");
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        let mut aborted = 0;
        for mut handle in self.handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!("Aborted {} workers still busy after the grace period", aborted);
        }

        self.frontier.save_remaining().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::fetcher::MockFetcher;
    use crate::frontier::shared_store;
    use tempfile::TempDir;

    fn setup(fetcher: MockFetcher, edit: impl FnOnce(&mut Config)) -> (Crawler, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            start_page: "http://x.test/".into(),
            site_path: dir.path().to_path_buf(),
            page_queue_size: 16,
            asset_queue_size: 16,
            ..Config::default()
        };
        edit(&mut config);
        config.finalize().unwrap();

        let store = shared_store(Database::in_memory().unwrap());
        let crawler = Crawler::new(config, store, Arc::new(fetcher)).unwrap();
        (crawler, dir)
    }

    fn admitted(crawler: &Crawler, task: &UrlTask) -> UrlTask {
        assert!(crawler.frontier().enqueue(task.clone()).unwrap());
        task.clone()
    }

    fn status(crawler: &Crawler, url: &str) -> TaskStatus {
        crawler.frontier().get(url).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn missing_asset_fails_without_retry() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(FetchResponse::not_found()));
        let (crawler, _dir) = setup(fetcher, |c| c.max_retry_times = 10);

        let seed = UrlTask::seed("http://x.test/");
        let asset = admitted(
            &crawler,
            &UrlTask::child_of(&seed, "http://x.test/missing.png".into(), UrlType::Asset),
        );

        assert_eq!(crawler.handle(asset).await, Some(Outcome::NotFound));
        assert_eq!(status(&crawler, "http://x.test/missing.png"), TaskStatus::Failed);
        assert_eq!(
            crawler.frontier().get("http://x.test/missing.png").unwrap().unwrap().failed_times,
            0
        );
    }

    #[tokio::test]
    async fn transport_errors_requeue_until_the_ceiling() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_get()
            .times(2)
            .returning(|_, _| Err(CrawlError::Transport("connection reset".into())));
        let (crawler, _dir) = setup(fetcher, |c| c.max_retry_times = 1);

        admitted(&crawler, &UrlTask::seed("http://x.test/"));
        for expected in [Outcome::Requeued, Outcome::Requeued, Outcome::RetryCeiling] {
            let task = crawler.frontier().next(UrlType::Page).await.unwrap();
            assert_eq!(crawler.handle(task).await, Some(expected));
        }

        let record = crawler.frontier().get("http://x.test/").unwrap().unwrap();
        assert_eq!(record.failed_times, 2);
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_get().times(1).returning(|_, _| {
            Ok(FetchResponse {
                status: 503,
                ..FetchResponse::default()
            })
        });
        let (crawler, _dir) = setup(fetcher, |_| {});

        let seed = admitted(&crawler, &UrlTask::seed("http://x.test/"));
        assert_eq!(crawler.handle(seed).await, Some(Outcome::Requeued));
        assert_eq!(status(&crawler, "http://x.test/"), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn pages_past_the_depth_ceiling_are_not_fetched() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_get().times(0);
        let (crawler, _dir) = setup(fetcher, |c| c.max_depth = 1);

        let seed = UrlTask::seed("http://x.test/");
        let deep = admitted(&crawler, &UrlTask::child_of(&seed, "http://x.test/deep".into(), UrlType::Page));

        assert_eq!(crawler.handle(deep).await, Some(Outcome::DepthCeiling));
        assert_eq!(status(&crawler, "http://x.test/deep"), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn page_is_rewritten_and_saved_in_its_charset() {
        let mut body = br#"<html><head><meta charset="gbk"></head><body><a href="/about">"#.to_vec();
        body.extend_from_slice(&[0xD6, 0xD0, 0xCE, 0xC4]);
        body.extend_from_slice(br#"</a><img src="/logo.png"></body></html>"#);

        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_get()
            .withf(|url, refer| url == "http://x.test/" && refer.is_empty())
            .times(1)
            .returning(move |_, _| Ok(FetchResponse::ok("text/html", body.clone())));
        let (crawler, dir) = setup(fetcher, |c| c.max_depth = 2);

        let seed = admitted(&crawler, &UrlTask::seed("http://x.test/"));
        assert_eq!(crawler.handle(seed).await, Some(Outcome::Saved));

        let saved = std::fs::read(dir.path().join("index.html")).unwrap();
        let text = Charset::from_label("gbk").unwrap().decode(&saved);
        assert!(text.contains(r#"<a href="/about.html">中文</a>"#));
        assert!(text.contains(r#"src="/logo.png""#));

        let about = crawler.frontier().get("http://x.test/about").unwrap().unwrap();
        assert_eq!(about.depth, 2);
        assert_eq!(about.url_type, UrlType::Page);
        assert!(crawler.frontier().get("http://x.test/logo.png").unwrap().is_some());
        assert_eq!(status(&crawler, "http://x.test/"), TaskStatus::Success);
    }

    #[tokio::test]
    async fn stylesheets_are_rewritten_before_saving() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_get()
            .returning(|_, _| Ok(FetchResponse::ok("text/css", "div{background:url('bg.jpg')}")));
        let (crawler, dir) = setup(fetcher, |_| {});

        let seed = UrlTask::seed("http://x.test/");
        let css = admitted(
            &crawler,
            &UrlTask::child_of(&seed, "http://x.test/css/site.css".into(), UrlType::Asset),
        );
        assert_eq!(crawler.handle(css).await, Some(Outcome::Saved));

        let saved = std::fs::read_to_string(dir.path().join("css").join("site.css")).unwrap();
        assert_eq!(saved, "div{background:url('/css/bg.jpg')}");
        assert!(crawler.frontier().get("http://x.test/css/bg.jpg").unwrap().is_some());
    }

    #[tokio::test]
    async fn unsupported_charset_drops_the_page() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_get()
            .returning(|_, _| Ok(FetchResponse::ok("text/html", r#"<meta charset="klingon-8">"#)));
        let (crawler, dir) = setup(fetcher, |_| {});

        let seed = admitted(&crawler, &UrlTask::seed("http://x.test/"));
        assert_eq!(crawler.handle(seed).await, None);
        assert_eq!(status(&crawler, "http://x.test/"), TaskStatus::Failed);
        assert!(!dir.path().join("index.html").exists());
    }
}
