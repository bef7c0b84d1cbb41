use crate::db::RecordStore;
use crate::error::CrawlError;
use crate::models::{StatusCounts, TaskStatus, UrlTask, UrlType};
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

/// Record store shared by every producer and consumer
pub type SharedStore = Arc<Mutex<Box<dyn RecordStore>>>;

pub fn shared_store<S: RecordStore + 'static>(store: S) -> SharedStore {
    let store: Box<dyn RecordStore> = Box::new(store);
    Arc::new(Mutex::new(store))
}

/// One bounded live queue with a receiver shared by the role's workers
struct TaskQueue {
    sender: mpsc::Sender<UrlTask>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<UrlTask>>,
}

impl TaskQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }
}

/// Two bounded task queues (pages, assets) backed by the record store
///
/// Every push happens while the store mutex is held and never blocks: a task
/// that does not fit stays `Init` in the store and is picked up later by the
/// dispatcher. A record is `Pending` exactly while its task sits in a live
/// queue or is being processed.
pub struct Frontier {
    store: SharedStore,
    pages: TaskQueue,
    assets: TaskQueue,
}

impl Frontier {
    pub fn new(store: SharedStore, page_capacity: usize, asset_capacity: usize) -> Self {
        Self {
            store,
            pages: TaskQueue::new(page_capacity),
            assets: TaskQueue::new(asset_capacity),
        }
    }

    fn queue(&self, url_type: UrlType) -> &TaskQueue {
        match url_type {
            UrlType::Page => &self.pages,
            UrlType::Asset => &self.assets,
        }
    }

    fn with_store<T>(
        &self,
        op: impl FnOnce(&mut dyn RecordStore) -> anyhow::Result<T>,
    ) -> Result<T, CrawlError> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| CrawlError::Store("record store mutex poisoned".to_string()))?;
        op(&mut **store).map_err(CrawlError::from)
    }

    /// Admit a newly discovered task. Returns `false` if the URL was already
    /// known.
    pub fn enqueue(&self, task: UrlTask) -> Result<bool, CrawlError> {
        let queue = self.queue(task.url_type);
        self.with_store(|store| {
            if !store.insert_if_absent(&task)? {
                trace!("Already known: {}", task.url);
                return Ok(false);
            }
            push(store, queue, task)?;
            Ok(true)
        })
    }

    /// Put a task back after a transport failure, keeping its failure count
    pub fn requeue(&self, task: UrlTask) -> Result<(), CrawlError> {
        let queue = self.queue(task.url_type);
        self.with_store(|store| {
            store.upsert(&task)?;
            push(store, queue, task)
        })
    }

    pub fn mark(&self, url: &str, status: TaskStatus) -> Result<(), CrawlError> {
        self.with_store(|store| store.update_status(url, status))
    }

    /// Wait for the next task of the given role. Returns `None` once the
    /// queue is closed.
    pub async fn next(&self, url_type: UrlType) -> Option<UrlTask> {
        let mut receiver = self.queue(url_type).receiver.lock().await;
        receiver.recv().await
    }

    /// Move backlog records into the live queue, up to its free capacity.
    /// Returns how many tasks were dispatched.
    pub fn refill(&self, url_type: UrlType) -> Result<usize, CrawlError> {
        let queue = self.queue(url_type);
        let free = queue.sender.capacity();
        if free == 0 {
            return Ok(0);
        }

        self.with_store(|store| {
            let claimed = store.claim_backlog(url_type, free)?;
            let mut dispatched = 0;
            for task in claimed {
                let url = task.url.clone();
                if queue.sender.try_send(task).is_ok() {
                    dispatched += 1;
                } else {
                    store.update_status(&url, TaskStatus::Init)?;
                }
            }
            Ok(dispatched)
        })
    }

    /// Periodically top up both live queues until `shutdown` flips to true
    pub async fn run_dispatcher(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            for url_type in [UrlType::Page, UrlType::Asset] {
                match self.refill(url_type) {
                    Ok(0) => {}
                    Ok(n) => debug!("Dispatched {} {} tasks from the backlog", n, url_type),
                    Err(e) => warn!("Failed to refill {} queue: {}", url_type, e),
                }
            }
        }
        debug!("Dispatcher stopped");
    }

    /// Prepare the store after a restart: interrupted work goes back to the
    /// backlog and the live queues are filled from it
    pub fn resume(&self) -> Result<usize, CrawlError> {
        let reset = self.with_store(|store| store.reset_in_flight())?;
        if reset > 0 {
            info!("Reset {} interrupted tasks", reset);
        }

        let page_backlog = self.backlog(UrlType::Page)?.len();
        let asset_backlog = self.backlog(UrlType::Asset)?.len();
        if page_backlog + asset_backlog > 0 {
            info!("Backlog holds {} pages and {} assets", page_backlog, asset_backlog);
        }

        let pages = self.refill(UrlType::Page)?;
        let assets = self.refill(UrlType::Asset)?;
        if pages + assets > 0 {
            info!("Resumed {} pages and {} assets from the store", pages, assets);
        }
        Ok(pages + assets)
    }

    /// Unfinished records of the given role
    pub fn backlog(&self, url_type: UrlType) -> Result<Vec<UrlTask>, CrawlError> {
        self.with_store(|store| store.list_unfinished(url_type))
    }

    /// Whether a record exists for `url`
    pub fn contains(&self, url: &str) -> Result<bool, CrawlError> {
        self.with_store(|store| store.exists(url))
    }

    /// Drain the live queues back into the backlog. Called after the workers
    /// have stopped.
    pub async fn save_remaining(&self) -> Result<usize, CrawlError> {
        let mut drained = Vec::new();
        for queue in [&self.pages, &self.assets] {
            let mut receiver = queue.receiver.lock().await;
            while let Ok(task) = receiver.try_recv() {
                drained.push(task.url);
            }
        }

        self.with_store(|store| {
            for url in &drained {
                store.update_status(url, TaskStatus::Init)?;
            }
            Ok(())
        })?;

        info!("Saved {} queued tasks to the store", drained.len());
        Ok(drained.len())
    }

    pub fn counts(&self) -> Result<StatusCounts, CrawlError> {
        self.with_store(|store| store.count_by_status())
    }

    /// No record is waiting or in flight
    pub fn is_drained(&self) -> Result<bool, CrawlError> {
        let counts = self.counts()?;
        Ok(counts.init == 0 && counts.pending == 0)
    }

    pub fn get(&self, url: &str) -> Result<Option<UrlTask>, CrawlError> {
        self.with_store(|store| store.get(url))
    }
}

/// Non-blocking push of a task whose record is `Init`; runs under the store
/// mutex so the dispatcher never claims it twice
fn push(store: &mut dyn RecordStore, queue: &TaskQueue, mut task: UrlTask) -> anyhow::Result<()> {
    task.status = TaskStatus::Pending;
    let url = task.url.clone();
    match queue.sender.try_send(task) {
        Ok(()) => store.update_status(&url, TaskStatus::Pending),
        Err(TrySendError::Full(task)) => {
            trace!("Queue full, {} kept in the backlog", task.url);
            Ok(())
        }
        Err(TrySendError::Closed(task)) => {
            debug!("Queue closed, {} kept in the backlog", task.url);
            Ok(())
        }
    }
}
