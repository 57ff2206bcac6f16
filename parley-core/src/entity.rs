// ABOUTME: Observed user/channel records with per-field change tracking
// ABOUTME: Shared by reference across sessions; flush persists only dirty fields

use crate::sync::lock;
use crate::traits::{Query, Row, Table};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

/// Flag bits stored in the `flag` field
pub mod flags {
    /// Messages from this user or channel are dropped
    pub const IGNORE: u64 = 1;
    /// The bot does not reply in this channel
    pub const SILENT: u64 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Channel,
}

impl EntityKind {
    pub fn table(self) -> Table {
        match self {
            EntityKind::User => Table::User,
            EntityKind::Channel => Table::Channel,
        }
    }

    /// Fields the dispatcher itself always reads
    pub fn base_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::User => &["flag", "authority"],
            EntityKind::Channel => &["flag", "assignee"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table().as_str())
    }
}

/// Identity of a cached record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub platform: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, platform: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            platform: platform.into(),
            id: id.into(),
        }
    }

    pub fn query(&self) -> Query {
        Query::eq("platform", self.platform.as_str()).and("id", self.id.as_str())
    }

    /// Row written when the record does not exist yet
    pub fn default_row(&self, auto_authorize: u32) -> Row {
        let mut row = Row::new();
        row.insert("platform".into(), json!(self.platform));
        row.insert("id".into(), json!(self.id));
        row.insert("flag".into(), json!(0));
        match self.kind {
            EntityKind::User => {
                row.insert("authority".into(), json!(auto_authorize));
            }
            EntityKind::Channel => {
                row.insert("assignee".into(), Value::Null);
            }
        }
        row
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.platform, self.id)
    }
}

#[derive(Default)]
struct State {
    fields: Row,
    loaded: BTreeSet<String>,
    dirty: BTreeSet<String>,
}

/// A partial record whose writes are tracked
pub struct Observed {
    key: EntityKey,
    state: Mutex<State>,
}

impl fmt::Debug for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Observed")
            .field("key", &self.key)
            .field("fields", &state.fields)
            .field("dirty", &state.dirty)
            .finish()
    }
}

impl Observed {
    /// Wrap a fetched row. `requested` fields count as loaded even when the
    /// row lacks them.
    pub fn new(key: EntityKey, row: Row, requested: &[String]) -> Self {
        let mut loaded: BTreeSet<String> = requested.iter().cloned().collect();
        loaded.extend(row.keys().cloned());
        Self {
            key,
            state: Mutex::new(State {
                fields: row,
                loaded,
                dirty: BTreeSet::new(),
            }),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        lock(&self.state)
            .fields
            .get(field)
            .filter(|v| !v.is_null())
            .cloned()
    }

    pub fn get_u64(&self, field: &str) -> u64 {
        self.get(field).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn get_str(&self, field: &str) -> Option<String> {
        self.get(field).and_then(|v| v.as_str().map(String::from))
    }

    pub fn flag(&self) -> u64 {
        self.get_u64("flag")
    }

    pub fn has_flag(&self, bit: u64) -> bool {
        self.flag() & bit != 0
    }

    pub fn authority(&self) -> u32 {
        u32::try_from(self.get_u64("authority")).unwrap_or(u32::MAX)
    }

    pub fn assignee(&self) -> Option<String> {
        self.get_str("assignee")
    }

    /// Write a field. Writing the value it already has is not a change.
    pub fn set(&self, field: &str, value: impl Into<Value>) {
        let value = value.into();
        let mut state = lock(&self.state);
        if state.fields.get(field) == Some(&value) {
            return;
        }
        state.fields.insert(field.to_string(), value);
        state.loaded.insert(field.to_string());
        state.dirty.insert(field.to_string());
    }

    /// Read-modify-write of a numeric field under one lock
    pub fn increment(&self, field: &str, by: i64) -> i64 {
        let mut state = lock(&self.state);
        let current = state.fields.get(field).and_then(Value::as_i64).unwrap_or(0);
        let updated = current + by;
        state.fields.insert(field.to_string(), json!(updated));
        state.loaded.insert(field.to_string());
        state.dirty.insert(field.to_string());
        updated
    }

    /// Requested fields that were never loaded
    pub fn missing_fields(&self, fields: &[String]) -> Vec<String> {
        let state = lock(&self.state);
        fields
            .iter()
            .filter(|f| !state.loaded.contains(*f))
            .cloned()
            .collect()
    }

    /// Merge freshly fetched fields. Local unflushed writes win.
    pub fn merge(&self, row: Row, requested: &[String]) {
        let mut state = lock(&self.state);
        for (field, value) in row {
            if !state.dirty.contains(&field) {
                state.fields.insert(field.clone(), value);
            }
            state.loaded.insert(field);
        }
        state.loaded.extend(requested.iter().cloned());
    }

    pub fn is_dirty(&self) -> bool {
        !lock(&self.state).dirty.is_empty()
    }

    /// Changed fields since the last call, clearing the change set
    pub fn take_changes(&self) -> Option<Row> {
        let mut state = lock(&self.state);
        if state.dirty.is_empty() {
            return None;
        }
        let dirty = std::mem::take(&mut state.dirty);
        let patch = dirty
            .into_iter()
            .map(|field| {
                let value = state.fields.get(&field).cloned().unwrap_or(Value::Null);
                (field, value)
            })
            .collect();
        Some(patch)
    }

    /// Put a patch that failed to persist back into the change set
    pub fn restore_changes(&self, patch: &Row) {
        let mut state = lock(&self.state);
        state.dirty.extend(patch.keys().cloned());
    }

    pub fn snapshot(&self) -> Row {
        lock(&self.state).fields.clone()
    }
}
