use crate::models::CatalogEntry;
use crate::schema::cache_catalog;
use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use tracing::debug;

const CREATE_CATALOG: &str = "CREATE TABLE IF NOT EXISTS cache_catalog (
    cache_key TEXT PRIMARY KEY NOT NULL,
    snapshot_path TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
)";

/// SQLite registry of cached snapshots. Writers are serialized through a
/// single connection.
pub struct Catalog {
    conn: Mutex<SqliteConnection>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let url = path.to_string_lossy();
        let conn = SqliteConnection::establish(&url)
            .with_context(|| format!("failed to open catalog {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = SqliteConnection::establish(":memory:")
            .context("failed to open in-memory catalog")?;
        Self::init(conn)
    }

    fn init(mut conn: SqliteConnection) -> Result<Self> {
        diesel::sql_query("PRAGMA busy_timeout = 5000")
            .execute(&mut conn)
            .context("failed to configure catalog")?;
        diesel::sql_query(CREATE_CATALOG)
            .execute(&mut conn)
            .context("failed to create cache_catalog")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts or refreshes `cache_key`. `created_at` survives re-registration.
    pub fn upsert(&self, cache_key: &str, snapshot_path: &Path) -> Result<CatalogEntry> {
        let now = Utc::now().naive_utc();
        let path = snapshot_path.to_string_lossy().into_owned();
        let entry = CatalogEntry {
            cache_key: cache_key.to_string(),
            snapshot_path: path.clone(),
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.conn.lock();
        diesel::insert_into(cache_catalog::table)
            .values(&entry)
            .on_conflict(cache_catalog::cache_key)
            .do_update()
            .set((
                cache_catalog::snapshot_path.eq(&path),
                cache_catalog::updated_at.eq(now),
            ))
            .execute(&mut *conn)
            .with_context(|| format!("failed to register snapshot {cache_key}"))?;

        let stored = cache_catalog::table
            .find(cache_key)
            .select(CatalogEntry::as_select())
            .first(&mut *conn)
            .with_context(|| format!("failed to read back catalog entry {cache_key}"))?;
        debug!(cache_key, "catalog entry upserted");
        Ok(stored)
    }

    pub fn get(&self, cache_key: &str) -> Result<Option<CatalogEntry>> {
        let mut conn = self.conn.lock();
        cache_catalog::table
            .find(cache_key)
            .select(CatalogEntry::as_select())
            .first(&mut *conn)
            .optional()
            .context("failed to query cache_catalog")
    }

    /// Entries, most recently updated first.
    pub fn list(&self) -> Result<Vec<CatalogEntry>> {
        let mut conn = self.conn.lock();
        cache_catalog::table
            .order((cache_catalog::updated_at.desc(), cache_catalog::cache_key.asc()))
            .select(CatalogEntry::as_select())
            .load(&mut *conn)
            .context("failed to list cache_catalog")
    }

    pub fn remove(&self, cache_key: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let deleted = diesel::delete(cache_catalog::table.find(cache_key))
            .execute(&mut *conn)
            .with_context(|| format!("failed to remove catalog entry {cache_key}"))?;
        Ok(deleted > 0)
    }

    pub fn clear(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        diesel::delete(cache_catalog::table)
            .execute(&mut *conn)
            .context("failed to clear cache_catalog")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn upsert_preserves_created_at() {
        let catalog = Catalog::in_memory().unwrap();
        let first = catalog.upsert("abc", Path::new("/tmp/a.parquet")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = catalog.upsert("abc", Path::new("/tmp/b.parquet")).unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.snapshot_path, "/tmp/b.parquet");
        assert_eq!(catalog.list().unwrap().len(), 1);
    }

    #[test]
    fn lists_newest_first_and_clears() {
        let catalog = Catalog::in_memory().unwrap();
        catalog.upsert("old", Path::new("old.parquet")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        catalog.upsert("new", Path::new("new.parquet")).unwrap();

        let keys: Vec<String> = catalog.list().unwrap().into_iter().map(|e| e.cache_key).collect();
        assert_eq!(keys, vec!["new".to_string(), "old".to_string()]);

        assert!(catalog.remove("old").unwrap());
        assert!(!catalog.remove("old").unwrap());
        assert!(catalog.get("old").unwrap().is_none());
        assert_eq!(catalog.clear().unwrap(), 1);
        assert!(catalog.list().unwrap().is_empty());
    }

    #[test]
    fn reopening_a_file_catalog_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/catalog.sqlite");
        Catalog::open(&path).unwrap().upsert("k", Path::new("k.parquet")).unwrap();
        let reopened = Catalog::open(&path).unwrap();
        assert!(reopened.get("k").unwrap().is_some());
    }
}
