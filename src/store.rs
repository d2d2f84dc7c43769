/// Generic key-indexed record store over SQLite
///
/// Every persisted type implements [`Record`] once (table name, DDL, column
/// binding) and gets save/fetch behavior from [`SqliteStore`]. Records carry
/// an integer primary key; id 0 means "not yet assigned" and is filled in
/// from the database on first save.

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, ToSql};
use std::path::Path;

use crate::error::{Error, Result};

/// A record that can be persisted by [`SqliteStore`].
pub trait Record: Sized {
    /// Table this record lives in.
    const TABLE: &'static str;

    /// DDL executed by [`SqliteStore::prepare`]. Must be `IF NOT EXISTS`.
    const CREATE_SQL: &'static str;

    /// Column names, excluding the primary key.
    const COLUMNS: &'static [&'static str];

    /// Primary key column name.
    const PRIMARY_KEY: &'static str = "cache_id";

    /// Current primary key value (0 = unassigned).
    fn id(&self) -> i64;

    /// Called by the store after an insert assigned a key.
    fn set_id(&mut self, id: i64);

    /// Values for `COLUMNS`, in the same order.
    fn values(&self) -> Vec<Value>;

    /// Rebuild from a row selected as `PRIMARY_KEY, COLUMNS...`.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

/// Shared SQLite-backed record store.
///
/// The connection sits behind a mutex so one store instance can serve both
/// the foreground thread and scheduler workers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::io)?;
        }
        let conn = Connection::open(path).map_err(Error::persistence)?;
        tracing::debug!(path = %path.display(), "record store opened");
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::persistence)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Ensure the table for `T` exists.
    pub fn prepare<T: Record>(&self) -> Result<()> {
        self.conn
            .lock()
            .execute(T::CREATE_SQL, [])
            .map_err(Error::persistence)?;
        Ok(())
    }

    /// Save a record. A record with id 0 is inserted and gets its key
    /// assigned; a record with a key is replaced when `upsert` is true and
    /// updated in place otherwise.
    pub fn save<T: Record>(&self, record: &mut T, upsert: bool) -> Result<()> {
        let conn = self.conn.lock();
        let values = record.values();

        if record.id() == 0 {
            let placeholders: Vec<String> =
                (1..=values.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                T::TABLE,
                T::COLUMNS.join(", "),
                placeholders.join(", ")
            );
            conn.execute(&sql, rusqlite::params_from_iter(values))
                .map_err(Error::persistence)?;
            record.set_id(conn.last_insert_rowid());
        } else if upsert {
            let placeholders: Vec<String> =
                (1..=values.len() + 1).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT OR REPLACE INTO {} ({}, {}) VALUES ({})",
                T::TABLE,
                T::PRIMARY_KEY,
                T::COLUMNS.join(", "),
                placeholders.join(", ")
            );
            let mut all = vec![Value::Integer(record.id())];
            all.extend(values);
            conn.execute(&sql, rusqlite::params_from_iter(all))
                .map_err(Error::persistence)?;
        } else {
            let assignments: Vec<String> = T::COLUMNS
                .iter()
                .enumerate()
                .map(|(i, col)| format!("{} = ?{}", col, i + 1))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                T::TABLE,
                assignments.join(", "),
                T::PRIMARY_KEY,
                values.len() + 1
            );
            let mut all = values;
            all.push(Value::Integer(record.id()));
            conn.execute(&sql, rusqlite::params_from_iter(all))
                .map_err(Error::persistence)?;
        }
        Ok(())
    }

    /// Fetch every record of `T`.
    pub fn fetch_all<T: Record>(&self) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {}, {} FROM {}",
            T::PRIMARY_KEY,
            T::COLUMNS.join(", "),
            T::TABLE
        );
        let mut stmt = conn.prepare(&sql).map_err(Error::persistence)?;
        let rows = stmt
            .query_map([], |row| T::from_row(row))
            .map_err(Error::persistence)?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record.map_err(Error::persistence)?);
        }
        Ok(records)
    }

    /// Fetch the first record matching a predicate such as `"uri = ?1"`.
    pub fn fetch_first_matching<T: Record>(
        &self,
        predicate: &str,
        params: &[&dyn ToSql],
    ) -> Result<Option<T>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} LIMIT 1",
            T::PRIMARY_KEY,
            T::COLUMNS.join(", "),
            T::TABLE,
            predicate
        );
        let mut stmt = conn.prepare(&sql).map_err(Error::persistence)?;
        let mut rows = stmt
            .query_map(params, |row| T::from_row(row))
            .map_err(Error::persistence)?;

        match rows.next() {
            Some(record) => Ok(Some(record.map_err(Error::persistence)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}
