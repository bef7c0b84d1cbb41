use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a URL is mirrored as a page (recursed into) or as an asset (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UrlType {
    /// HTML document; its links are extracted and followed
    Page,
    /// Static resource (css, js, image, font, ...); never enqueues pages
    Asset,
}

impl UrlType {
    /// Integer code stored in the `url_type` column
    pub fn code(self) -> i64 {
        match self {
            UrlType::Page => 0,
            UrlType::Asset => 1,
        }
    }

    /// Inverse of [`UrlType::code`]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(UrlType::Page),
            1 => Some(UrlType::Asset),
            _ => None,
        }
    }
}

impl fmt::Display for UrlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlType::Page => write!(f, "page"),
            UrlType::Asset => write!(f, "asset"),
        }
    }
}

/// Durable lifecycle state of a URL record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Admitted, waiting for a slot in the live queue
    Init,
    /// Pushed onto the live queue or being processed by a worker
    Pending,
    /// Fetched and written to disk
    Success,
    /// Terminal failure (404, retry ceiling, depth ceiling)
    Failed,
}

impl TaskStatus {
    /// Integer code stored in the `status` column
    pub fn code(self) -> i64 {
        match self {
            TaskStatus::Init => 0,
            TaskStatus::Pending => 1,
            TaskStatus::Success => 2,
            TaskStatus::Failed => 3,
        }
    }

    /// Inverse of [`TaskStatus::code`]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Init),
            1 => Some(TaskStatus::Pending),
            2 => Some(TaskStatus::Success),
            3 => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Init => write!(f, "Init"),
            TaskStatus::Pending => write!(f, "Pending"),
            TaskStatus::Success => write!(f, "Success"),
            TaskStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// A unit of crawl work, and the durable record kept for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTask {
    /// Absolute, fragment-stripped URL; unique across the registry
    pub url: String,

    /// URL of the document that discovered this one (empty for the seed)
    pub refer: String,

    /// Page or asset
    pub url_type: UrlType,

    /// 1 for the seed, parent depth + 1 for everything discovered
    pub depth: u32,

    /// Number of transport failures so far
    pub failed_times: u32,

    /// Lifecycle state
    pub status: TaskStatus,
}

impl UrlTask {
    /// The seed task for a crawl
    pub fn seed(url: &str) -> Self {
        Self {
            url: url.to_string(),
            refer: String::new(),
            url_type: UrlType::Page,
            depth: 1,
            failed_times: 0,
            status: TaskStatus::Init,
        }
    }

    /// A task discovered inside `parent`
    pub fn child_of(parent: &UrlTask, url: String, url_type: UrlType) -> Self {
        Self {
            url,
            refer: parent.url.clone(),
            url_type,
            depth: parent.depth + 1,
            failed_times: 0,
            status: TaskStatus::Init,
        }
    }
}

/// Number of records per status, for progress reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub init: u64,
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.init + self.pending + self.success + self.failed
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total ({} queued, {} in flight, {} done, {} failed)",
            self.total(),
            self.init,
            self.pending,
            self.success,
            self.failed
        )
    }
}
