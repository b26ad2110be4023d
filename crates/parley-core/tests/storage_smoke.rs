use parley_core::cache::{question_hash, schema_hash, QueryCache};
use parley_core::maintenance;
use parley_core::model::{
    ColumnInfo, ColumnType, QueryRecord, QuerySource, QueryStatus, ResultSummary,
    VisualizationType,
};
use parley_core::ratelimit::RateLimiter;
use parley_core::storage::store::{now_ms, now_rfc3339, Store};
use serde_json::json;

fn store() -> Store {
    let s = Store::memory().unwrap();
    s.init_schema().unwrap();
    s
}

fn record(tenant: &str, question: &str) -> QueryRecord {
    QueryRecord {
        id: 0,
        tenant_id: tenant.to_string(),
        project_id: "p1".to_string(),
        question: question.to_string(),
        generated_sql: "SELECT region, SUM(amount) FROM orders GROUP BY region".to_string(),
        explanation: "Totals per region.".to_string(),
        assumptions: "none".to_string(),
        visualization_type: VisualizationType::BarChart,
        columns: vec![
            ColumnInfo {
                name: "region".to_string(),
                column_type: ColumnType::Text,
            },
            ColumnInfo {
                name: "revenue".to_string(),
                column_type: ColumnType::Real,
            },
        ],
        result_summary: ResultSummary {
            row_count: 2,
            sample_rows: vec![vec![json!("EMEA"), json!(12.5)]],
        },
        insights: Vec::new(),
        execution_time_ms: 12,
        status: QueryStatus::Success,
        source: QuerySource::Interactive,
        created_at: now_rfc3339(),
    }
}

#[test]
fn persists_a_file_backed_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("core.db");

    let id = {
        let store = Store::open(&path)?;
        store.init_schema()?;
        store.insert_query(&record("t1", "revenue by region?"), None)?
    };

    // reopen and read back
    let store = Store::open(&path)?;
    let q = store.get_query("t1", id)?.expect("row survives reopen");
    assert_eq!(q.question, "revenue by region?");
    assert_eq!(q.visualization_type, VisualizationType::BarChart);
    assert_eq!(q.columns.len(), 2);
    assert_eq!(q.result_summary.row_count, 2);
    assert_eq!(q.status, QueryStatus::Success);

    // tenants never see each other's rows
    assert!(store.get_query("t2", id)?.is_none());
    Ok(())
}

#[test]
fn expired_cache_entries_read_as_misses_before_any_sweep() {
    let store = store();
    let cache = QueryCache::new(store.clone(), 3600);
    let qh = question_hash("revenue?");
    let sh = schema_hash("Table: orders (3 rows)");

    cache.set("t1", "p1", "revenue?", &qh, &sh, &json!({"rows": 2}));
    assert!(cache.get("t1", &qh, &sh).is_some());

    // push the entry into the past; expiry must hold without a cleanup pass
    {
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "UPDATE query_cache SET expires_at = ?1",
            [now_ms() - 1000],
        )
        .unwrap();
    }
    assert!(cache.get("t1", &qh, &sh).is_none());
}

#[test]
fn sweep_removes_expired_cache_rows_and_stale_windows() {
    let store = store();
    let cache = QueryCache::new(store.clone(), 3600);
    let limiter = RateLimiter::new(store.clone(), 30, 60_000, 3, 2);

    let qh = question_hash("a");
    let sh = schema_hash("Table: t (1 rows)");
    cache.set("t1", "p1", "a", &qh, &sh, &json!(1));
    cache.set("t1", "p1", "b", &question_hash("b"), &sh, &json!(2));
    {
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "UPDATE query_cache SET expires_at = ?1 WHERE question_hash = ?2",
            rusqlite::params![now_ms() - 1, qh],
        )
        .unwrap();
    }

    // one current window, one far past the cleanup horizon
    let now = now_ms();
    limiter.check_limit_at("t1", "ask", now);
    limiter.check_limit_at("t1", "ask", now - 60_000 * 10);

    let report = maintenance::sweep(&cache, &limiter);
    assert_eq!(report.cache_entries_removed, 1);
    assert_eq!(report.rate_windows_removed, 1);

    // the live entry survives
    assert!(cache.get("t1", &question_hash("b"), &sh).is_some());
}

#[test]
fn queries_are_listed_per_job() -> anyhow::Result<()> {
    let store = store();
    let job_id = store.insert_job("t1", "p1", 1.0)?;
    let other = store.insert_job("t1", "p1", 1.0)?;

    let a = store.insert_query(&record("t1", "q-a"), Some(job_id))?;
    store.insert_query(&record("t1", "q-b"), Some(other))?;
    store.insert_query(&record("t1", "standalone"), None)?;

    let listed = store.queries_for_job("t1", job_id)?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, a);
    assert_eq!(listed[0].question, "q-a");

    // project history sees everything, newest first
    let history = store.queries_for_project("t1", "p1", 10)?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].question, "standalone");
    assert!(store.queries_for_project("t2", "p1", 10)?.is_empty());
    Ok(())
}
