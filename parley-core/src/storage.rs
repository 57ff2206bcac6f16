// ABOUTME: In-memory storage backend for tests and database-less deployments
// ABOUTME: Implements the structured-query Storage trait over per-table row vectors

use crate::traits::{project, Query, Row, Storage, Table};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Rows held in process memory, lost on exit
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<Table, Vec<Row>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows stored in a table
    pub async fn len(&self, table: Table) -> usize {
        self.tables.read().await.get(&table).map_or(0, Vec::len)
    }

    pub async fn is_empty(&self, table: Table) -> bool {
        self.len(table).await == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, table: Table, query: &Query, fields: &[String]) -> Result<Vec<Row>> {
        let tables = self.tables.read().await;
        let rows = tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.matches(row))
                    .map(|row| project(row, fields))
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn set(&self, table: Table, query: &Query, patch: &Row) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(&table) {
            for row in rows.iter_mut().filter(|row| query.matches(row)) {
                for (key, value) in patch {
                    row.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn create(&self, table: Table, row: Row) -> Result<Row> {
        let mut tables = self.tables.write().await;
        tables.entry(table).or_default().push(row.clone());
        Ok(row)
    }
}
