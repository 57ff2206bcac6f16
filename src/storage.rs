// ABOUTME: SQLite-backed storage for user and channel rows
// ABOUTME: Rows are JSON documents keyed by (platform, id), filtered by structured queries

use anyhow::{Context, Result};
use async_trait::async_trait;
use parley_core::{project, Query, Row, Storage, Table};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage backed by a single SQLite database
#[derive(Clone)]
pub struct SqliteStorage {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database file and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::new(Arc::new(Mutex::new(conn)))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Arc::new(Mutex::new(Connection::open_in_memory()?)))
    }

    pub fn new(db: Arc<Mutex<Connection>>) -> Result<Self> {
        let store = Self { db };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        for table in [Table::User, Table::Channel] {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        platform TEXT NOT NULL,
                        id TEXT NOT NULL,
                        data TEXT NOT NULL,
                        PRIMARY KEY (platform, id)
                    )",
                    table.as_str()
                ),
                [],
            )?;
        }
        Ok(())
    }

    /// Rows that may match `query`, narrowed by the key columns when the
    /// query pins them
    fn candidates(conn: &Connection, table: Table, query: &Query) -> Result<Vec<Row>> {
        let platform = query.value_of("platform").and_then(Value::as_str);
        let id = query.value_of("id").and_then(Value::as_str);
        let raw: Vec<String> = match (platform, id) {
            (Some(platform), Some(id)) => conn
                .query_row(
                    &format!(
                        "SELECT data FROM {} WHERE platform = ?1 AND id = ?2",
                        table.as_str()
                    ),
                    params![platform, id],
                    |row| row.get(0),
                )
                .optional()?
                .into_iter()
                .collect(),
            (Some(platform), None) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT data FROM {} WHERE platform = ?1",
                    table.as_str()
                ))?;
                let rows = stmt
                    .query_map([platform], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
            _ => {
                let mut stmt = conn.prepare(&format!("SELECT data FROM {}", table.as_str()))?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
        };

        let mut rows = Vec::with_capacity(raw.len());
        for data in raw {
            let row: Row = serde_json::from_str(&data)
                .with_context(|| format!("Corrupt row in table {}", table.as_str()))?;
            if query.matches(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

fn key_of(row: &Row) -> (String, String) {
    let text = |field: &str| {
        row.get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    (text("platform"), text("id"))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, table: Table, query: &Query, fields: &[String]) -> Result<Vec<Row>> {
        let conn = self.conn()?;
        let rows = Self::candidates(&conn, table, query)?;
        Ok(rows.iter().map(|row| project(row, fields)).collect())
    }

    async fn set(&self, table: Table, query: &Query, patch: &Row) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = Self::candidates(&tx, table, query)?;
        for mut row in rows {
            let (platform, id) = key_of(&row);
            for (key, value) in patch {
                row.insert(key.clone(), value.clone());
            }
            tx.execute(
                &format!(
                    "UPDATE {} SET data = ?1 WHERE platform = ?2 AND id = ?3",
                    table.as_str()
                ),
                params![serde_json::to_string(&row)?, platform, id],
            )?;
        }
        tx.commit()?;
        tracing::debug!(table = table.as_str(), fields = patch.len(), "Row patch committed");
        Ok(())
    }

    async fn create(&self, table: Table, row: Row) -> Result<Row> {
        let conn = self.conn()?;
        let (platform, id) = key_of(&row);
        conn.execute(
            &format!(
                "INSERT INTO {} (platform, id, data) VALUES (?1, ?2, ?3)",
                table.as_str()
            ),
            params![platform, id, serde_json::to_string(&row)?],
        )
        .with_context(|| format!("Failed to create {} {}:{}", table.as_str(), platform, id))?;
        Ok(row)
    }
}
