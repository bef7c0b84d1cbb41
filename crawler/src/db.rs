use crate::models::{StatusCounts, TaskStatus, UrlTask, UrlType};
use anyhow::{anyhow, Context, Result};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};

/// Durable registry of every URL ever admitted to the frontier
///
/// Implementations need not be thread-safe; the frontier serializes every
/// call behind one mutex.
pub trait RecordStore: Send {
    /// Whether a record exists for `url`
    fn exists(&mut self, url: &str) -> Result<bool>;

    /// Insert `task` unless a record for its URL exists. Returns `true` when
    /// the record was created.
    fn insert_if_absent(&mut self, task: &UrlTask) -> Result<bool>;

    /// Insert `task`, or update `failed_times` and reset the status to `Init`
    /// if the URL is already known
    fn upsert(&mut self, task: &UrlTask) -> Result<()>;

    fn update_status(&mut self, url: &str, status: TaskStatus) -> Result<()>;

    /// Records of the given role still `Init` or `Pending`
    fn list_unfinished(&mut self, url_type: UrlType) -> Result<Vec<UrlTask>>;

    /// Take up to `limit` `Init` records of the given role and mark them
    /// `Pending`
    fn claim_backlog(&mut self, url_type: UrlType, limit: usize) -> Result<Vec<UrlTask>>;

    /// Reset every `Pending` record to `Init`. Returns how many were reset.
    fn reset_in_flight(&mut self) -> Result<usize>;

    fn count_by_status(&mut self) -> Result<StatusCounts>;

    fn get(&mut self, url: &str) -> Result<Option<UrlTask>>;
}

/// SQLite-backed [`RecordStore`]
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the registry at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        info!("Opening database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let db = Self { conn, path };
        db.init_tables()?;
        Ok(db)
    }

    /// A throwaway registry, for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init_tables()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_tables(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS url_records (
                    url TEXT PRIMARY KEY,
                    refer TEXT NOT NULL,
                    depth INTEGER NOT NULL,
                    url_type INTEGER NOT NULL,
                    failed_times INTEGER NOT NULL DEFAULT 0,
                    status INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )
            .context("Failed to create url_records table")?;

        self.conn
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_url_records_backlog
                 ON url_records(url_type, status)",
                [],
            )
            .context("Failed to create backlog index")?;

        Ok(())
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<UrlTask> {
    let url_type: i64 = row.get(3)?;
    let status: i64 = row.get(5)?;
    let depth: i64 = row.get(2)?;
    let failed_times: i64 = row.get(4)?;

    Ok(UrlTask {
        url: row.get(0)?,
        refer: row.get(1)?,
        depth: depth.max(1) as u32,
        url_type: UrlType::from_code(url_type).unwrap_or(UrlType::Asset),
        failed_times: failed_times.max(0) as u32,
        status: TaskStatus::from_code(status).unwrap_or(TaskStatus::Init),
    })
}

const SELECT_COLUMNS: &str = "SELECT url, refer, depth, url_type, failed_times, status FROM url_records";

impl RecordStore for Database {
    fn exists(&mut self, url: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM url_records WHERE url = ?", params![url], |_| Ok(()))
            .optional()
            .with_context(|| format!("Failed to look up url record: {}", url))?;
        Ok(found.is_some())
    }

    fn insert_if_absent(&mut self, task: &UrlTask) -> Result<bool> {
        let stamp = now();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO url_records
                    (url, refer, depth, url_type, failed_times, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    task.url,
                    task.refer,
                    task.depth,
                    task.url_type.code(),
                    task.failed_times,
                    task.status.code(),
                    stamp,
                    stamp,
                ],
            )
            .with_context(|| format!("Failed to add url record: {}", task.url))?;
        Ok(inserted > 0)
    }

    fn upsert(&mut self, task: &UrlTask) -> Result<()> {
        let stamp = now();
        self.conn
            .execute(
                "INSERT INTO url_records
                    (url, refer, depth, url_type, failed_times, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(url) DO UPDATE SET
                    failed_times = excluded.failed_times,
                    status = ?,
                    updated_at = excluded.updated_at",
                params![
                    task.url,
                    task.refer,
                    task.depth,
                    task.url_type.code(),
                    task.failed_times,
                    TaskStatus::Init.code(),
                    stamp,
                    stamp,
                    TaskStatus::Init.code(),
                ],
            )
            .with_context(|| format!("Failed to upsert url record: {}", task.url))?;
        Ok(())
    }

    fn update_status(&mut self, url: &str, status: TaskStatus) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE url_records SET status = ?, updated_at = ? WHERE url = ?",
                params![status.code(), now(), url],
            )
            .with_context(|| format!("Failed to update url record status: {}", url))?;

        if rows == 0 {
            return Err(anyhow!("No url record for {}", url));
        }
        Ok(())
    }

    fn list_unfinished(&mut self, url_type: UrlType) -> Result<Vec<UrlTask>> {
        let sql = format!(
            "{} WHERE url_type = ? AND status IN (?, ?) ORDER BY depth, created_at",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                url_type.code(),
                TaskStatus::Init.code(),
                TaskStatus::Pending.code()
            ],
            task_from_row,
        )?;

        let mut tasks = Vec::new();
        for task in rows {
            tasks.push(task?);
        }
        Ok(tasks)
    }

    fn claim_backlog(&mut self, url_type: UrlType, limit: usize) -> Result<Vec<UrlTask>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let tx = self.conn.transaction()?;
        let mut tasks = Vec::new();
        {
            let sql = format!(
                "{} WHERE url_type = ? AND status = ? ORDER BY depth, created_at LIMIT ?",
                SELECT_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                params![url_type.code(), TaskStatus::Init.code(), limit as i64],
                task_from_row,
            )?;
            for task in rows {
                tasks.push(task?);
            }

            let stamp = now();
            let mut update = tx.prepare("UPDATE url_records SET status = ?, updated_at = ? WHERE url = ?")?;
            for task in tasks.iter_mut() {
                update.execute(params![TaskStatus::Pending.code(), stamp, task.url])?;
                task.status = TaskStatus::Pending;
            }
        }
        tx.commit().context("Failed to claim backlog")?;

        Ok(tasks)
    }

    fn reset_in_flight(&mut self) -> Result<usize> {
        let rows = self
            .conn
            .execute(
                "UPDATE url_records SET status = ?, updated_at = ? WHERE status = ?",
                params![TaskStatus::Init.code(), now(), TaskStatus::Pending.code()],
            )
            .context("Failed to reset in-flight records")?;
        Ok(rows)
    }

    fn count_by_status(&mut self) -> Result<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM url_records GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u64;
            match TaskStatus::from_code(status) {
                Some(TaskStatus::Init) => counts.init += count,
                Some(TaskStatus::Pending) => counts.pending += count,
                Some(TaskStatus::Success) => counts.success += count,
                Some(TaskStatus::Failed) | None => counts.failed += count,
            }
        }
        Ok(counts)
    }

    fn get(&mut self, url: &str) -> Result<Option<UrlTask>> {
        let sql = format!("{} WHERE url = ?", SELECT_COLUMNS);
        self.conn
            .query_row(&sql, params![url], task_from_row)
            .optional()
            .with_context(|| format!("Failed to load url record: {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str) -> UrlTask {
        UrlTask::seed(url)
    }

    fn asset(url: &str) -> UrlTask {
        UrlTask {
            url_type: UrlType::Asset,
            ..UrlTask::seed(url)
        }
    }

    #[test]
    fn insert_if_absent_deduplicates() {
        let mut db = Database::in_memory().unwrap();
        assert!(!db.exists("http://x.test/").unwrap());
        assert!(db.insert_if_absent(&page("http://x.test/")).unwrap());
        assert!(!db.insert_if_absent(&page("http://x.test/")).unwrap());
        assert!(db.exists("http://x.test/").unwrap());
        assert_eq!(db.count_by_status().unwrap().total(), 1);
    }

    #[test]
    fn upsert_updates_failures_and_resets_status() {
        let mut db = Database::in_memory().unwrap();
        let mut task = page("http://x.test/a");
        db.insert_if_absent(&task).unwrap();
        db.update_status(&task.url, TaskStatus::Pending).unwrap();

        task.failed_times = 2;
        task.depth = 7;
        db.upsert(&task).unwrap();

        let stored = db.get(&task.url).unwrap().unwrap();
        assert_eq!(stored.failed_times, 2);
        assert_eq!(stored.status, TaskStatus::Init);
        // only the failure count changes on conflict
        assert_eq!(stored.depth, 1);
    }

    #[test]
    fn update_status_requires_a_record() {
        let mut db = Database::in_memory().unwrap();
        assert!(db.update_status("http://x.test/missing", TaskStatus::Success).is_err());
    }

    #[test]
    fn list_unfinished_filters_by_role_and_status() {
        let mut db = Database::in_memory().unwrap();
        for task in [
            page("http://x.test/1"),
            page("http://x.test/2"),
            page("http://x.test/3"),
            asset("http://x.test/a.css"),
        ] {
            db.insert_if_absent(&task).unwrap();
        }
        db.update_status("http://x.test/2", TaskStatus::Pending).unwrap();
        db.update_status("http://x.test/3", TaskStatus::Success).unwrap();

        let pages: Vec<String> = db
            .list_unfinished(UrlType::Page)
            .unwrap()
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(pages.len(), 2);
        assert!(pages.contains(&"http://x.test/1".to_string()));
        assert!(pages.contains(&"http://x.test/2".to_string()));

        let assets = db.list_unfinished(UrlType::Asset).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].url_type, UrlType::Asset);
    }

    #[test]
    fn claim_backlog_takes_only_init_records() {
        let mut db = Database::in_memory().unwrap();
        for i in 0..5 {
            db.insert_if_absent(&page(&format!("http://x.test/{}", i))).unwrap();
        }

        let first = db.claim_backlog(UrlType::Page, 3).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|t| t.status == TaskStatus::Pending));

        let second = db.claim_backlog(UrlType::Page, 10).unwrap();
        assert_eq!(second.len(), 2);
        assert!(db.claim_backlog(UrlType::Page, 10).unwrap().is_empty());
        assert!(db.claim_backlog(UrlType::Asset, 10).unwrap().is_empty());

        let counts = db.count_by_status().unwrap();
        assert_eq!(counts.pending, 5);

        assert_eq!(db.reset_in_flight().unwrap(), 5);
        assert_eq!(db.count_by_status().unwrap().init, 5);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("site.db");
        {
            let mut db = Database::new(&path).unwrap();
            db.insert_if_absent(&asset("http://x.test/logo.png")).unwrap();
            db.update_status("http://x.test/logo.png", TaskStatus::Failed).unwrap();
        }
        let mut db = Database::new(&path).unwrap();
        let stored = db.get("http://x.test/logo.png").unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.url_type, UrlType::Asset);
    }
}
