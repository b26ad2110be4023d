use super::{TableResult, TenantDataStore};
use anyhow::Context;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Embedded row store over a tenant's sqlite file.
pub struct SqliteDataStore {
    conn: Arc<Mutex<Connection>>,
    closed: AtomicBool,
}

impl SqliteDataStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open tenant db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory tenant db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            closed: AtomicBool::new(false),
        })
    }

    /// Direct access for seeding test data.
    pub fn raw(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("data store is not connected");
        }
        Ok(())
    }
}

// rusqlite is synchronous, so every statement runs on the blocking pool;
// awaiting the join handle gives callers a real await point, which is what
// lets an execution timeout fire while the statement is still running.
#[async_trait]
impl TenantDataStore for SqliteDataStore {
    async fn execute(&self, sql: &str) -> anyhow::Result<TableResult> {
        self.ensure_connected()?;
        let conn = self.conn.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || run_query(&conn.lock().unwrap(), &sql)).await?
    }

    async fn get_tables(&self) -> anyhow::Result<Vec<String>> {
        self.ensure_connected()?;
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || table_names(&conn.lock().unwrap())).await?
    }

    async fn gather_schema_context(&self) -> anyhow::Result<String> {
        self.ensure_connected()?;
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || schema_context(&conn.lock().unwrap())).await?
    }
}

fn table_names(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn run_query(conn: &Connection, sql: &str) -> anyhow::Result<TableResult> {
    let mut stmt = conn.prepare(sql).context("failed to prepare query")?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let col_count = columns.len();
    let mut rows_out = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(col_count);
        for i in 0..col_count {
            out.push(value_to_json(row.get_ref(i)?));
        }
        rows_out.push(out);
    }

    Ok(TableResult {
        columns,
        rows: rows_out,
    })
}

fn schema_context(conn: &Connection) -> anyhow::Result<String> {
    let tables = table_names(conn)?;

    let mut out = String::new();
    for table in &tables {
        let row_count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |r| {
                r.get(0)
            })?;
        out.push_str(&format!("Table: {} ({} rows)\nColumns:\n", table, row_count));

        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
        let cols = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // One sample row gives the model concrete value shapes.
        let sample: Option<Vec<serde_json::Value>> = {
            let mut s = conn.prepare(&format!("SELECT * FROM \"{}\" LIMIT 1", table))?;
            let n = s.column_count();
            let mut rows = s.query([])?;
            match rows.next()? {
                Some(row) => {
                    let mut vals = Vec::with_capacity(n);
                    for i in 0..n {
                        vals.push(value_to_json(row.get_ref(i)?));
                    }
                    Some(vals)
                }
                None => None,
            }
        };

        for (i, (name, decl_type)) in cols.iter().enumerate() {
            let ty = if decl_type.is_empty() { "ANY" } else { decl_type };
            match sample.as_ref().and_then(|s| s.get(i)) {
                Some(v) if !v.is_null() => {
                    out.push_str(&format!("  - {} ({}), e.g. {}\n", name, ty, v));
                }
                _ => out.push_str(&format!("  - {} ({})\n", name, ty)),
            }
        }
        out.push('\n');
    }
    Ok(out)
}

fn value_to_json(v: ValueRef<'_>) -> serde_json::Value {
    match v {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::from(hex::encode(b)),
    }
}
