#![allow(dead_code)]

use entity_dal::db::open_db_in_memory;
use entity_dal::{Entity, Glossary, Migration, OpLog, SqliteContext};
use log::{Level, Log, Metadata, Record};
use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use std::sync::{Arc, Mutex};

pub const MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        "CREATE TABLE currencies (
            id INTEGER PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        );",
    ),
    Migration::new(
        2,
        "CREATE TABLE tags (
            id TEXT PRIMARY KEY NOT NULL,
            label TEXT NOT NULL
        );
        CREATE TABLE memberships (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            group_id INTEGER NOT NULL,
            role TEXT NOT NULL
        );",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Currency {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub is_active: bool,
}

impl Currency {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            id: 0,
            code: code.to_string(),
            name: name.to_string(),
            is_active: true,
        }
    }
}

impl Entity for Currency {
    type Key = i64;

    const TABLE: &'static str = "currencies";
    const KEY_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["code", "name", "is_active"];
    const KEY_GENERATED: bool = true;

    fn key(&self) -> i64 {
        self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = key;
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.code.clone()),
            Value::from(self.name.clone()),
            Value::from(self.is_active),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            code: row.get("code")?,
            name: row.get("name")?,
            is_active: row.get("is_active")?,
        })
    }
}

impl Glossary for Currency {
    fn code(&self) -> &str {
        &self.code
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: String,
    pub label: String,
}

impl Tag {
    pub fn new(label: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
        }
    }
}

impl Entity for Tag {
    type Key = String;

    const TABLE: &'static str = "tags";
    const KEY_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["label"];

    fn key(&self) -> String {
        self.id.clone()
    }

    fn set_key(&mut self, key: String) {
        self.id = key;
    }

    fn to_values(&self) -> Vec<Value> {
        vec![Value::from(self.label.clone())]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            label: row.get("label")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub role: String,
}

impl Membership {
    pub fn new(user_id: i64, group_id: i64, role: &str) -> Self {
        Self {
            id: 0,
            user_id,
            group_id,
            role: role.to_string(),
        }
    }
}

impl Entity for Membership {
    type Key = i64;

    const TABLE: &'static str = "memberships";
    const KEY_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["user_id", "group_id", "role"];
    const KEY_GENERATED: bool = true;

    fn key(&self) -> i64 {
        self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = key;
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.user_id),
            Value::from(self.group_id),
            Value::from(self.role.clone()),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            group_id: row.get("group_id")?,
            role: row.get("role")?,
        })
    }
}

pub fn context() -> SqliteContext {
    SqliteContext::new(open_db_in_memory(MIGRATIONS).unwrap())
}

pub fn row_count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

/// Aborts any delete of a tag labelled `locked`.
pub fn lock_tags(conn: &Connection) {
    conn.execute_batch(
        "CREATE TRIGGER tags_locked BEFORE DELETE ON tags
         WHEN OLD.label = 'locked'
         BEGIN
             SELECT RAISE(ABORT, 'tag is locked');
         END;",
    )
    .unwrap();
}

#[derive(Default)]
pub struct CapturedLog {
    lines: Mutex<Vec<(Level, String)>>,
}

impl CapturedLog {
    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn lines_for(&self, op: &str) -> Vec<(Level, String)> {
        let needle = format!("op={op} ");
        self.lines()
            .into_iter()
            .filter(|(_, line)| line.contains(&needle))
            .collect()
    }
}

impl Log for CapturedLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.lines
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

pub fn captured_log() -> (Arc<CapturedLog>, OpLog) {
    let capture = Arc::new(CapturedLog::default());
    let log = OpLog::with_sink(capture.clone());
    (capture, log)
}
