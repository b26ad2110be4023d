use async_trait::async_trait;
use parley_core::ask::AskEngine;
use parley_core::config::CoreConfig;
use parley_core::credits::{cost_usd, CreditLedger, StoreLedger};
use parley_core::datastore::sqlite::SqliteDataStore;
use parley_core::datastore::TenantDataStore;
use parley_core::insights::{InsightBatch, InsightGenerator, LlmInsightGenerator};
use parley_core::jobs::JobRunner;
use parley_core::model::{BackgroundJob, ColumnInfo, FindingStatus, JobStatus, QuerySource};
use parley_core::providers::llm::fake::FakeClient;
use parley_core::storage::store::Store;
use std::sync::Arc;
use std::time::Duration;

const PLAN_TWO: &str = r#"[
  {"question": "What is total revenue per region?", "rationale": "core metric", "complexity": "low"},
  {"question": "Which region has the largest average order?", "rationale": "follow-up", "complexity": "low"}
]"#;

const PLAN_THREE: &str = r#"[
  {"question": "q1"}, {"question": "q2"}, {"question": "q3"}
]"#;

const ASK_REPLY: &str = r#"EXPLANATION:
Sums order amounts per region.

ASSUMPTIONS:
none

```sql
SELECT region, SUM(amount) AS revenue FROM orders GROUP BY region ORDER BY region
```

VISUALIZATION_TYPE:
bar_chart"#;

const EMPTY_REPLY: &str = "```sql\nSELECT region FROM orders WHERE 1 = 0\n```";
const FORBIDDEN_REPLY: &str = "```sql\nDELETE FROM orders\n```";
const INSIGHT_REPLY: &str = r#"[{"type": "comparison", "severity": "notable", "title": "EMEA leads", "description": "EMEA produces most revenue.", "evidence": "12.5 vs 3.0"}]"#;

fn tenant_db() -> Arc<dyn TenantDataStore> {
    let ds = SqliteDataStore::memory().unwrap();
    {
        let conn = ds.raw();
        let conn = conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER, region TEXT, amount REAL);
             INSERT INTO orders VALUES (1, 'APAC', 3.0), (2, 'EMEA', 10.5), (3, 'EMEA', 2.0);",
        )
        .unwrap();
    }
    Arc::new(ds)
}

/// Generator that never produces insights and never spends tokens.
struct NoInsights;

#[async_trait]
impl InsightGenerator for NoInsights {
    async fn generate(
        &self,
        _question: &str,
        _sql: &str,
        _columns: &[ColumnInfo],
        _rows: &[Vec<serde_json::Value>],
        _schema_context: &str,
    ) -> anyhow::Result<InsightBatch> {
        Ok(InsightBatch::default())
    }
}

fn fast_config() -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.jobs.step_delay_ms = 0;
    cfg
}

struct Rig {
    runner: JobRunner,
    ledger: Arc<StoreLedger>,
    store: Store,
}

fn rig_with(
    client: Arc<FakeClient>,
    insights: Arc<dyn InsightGenerator>,
    allocation: f64,
    cfg: &CoreConfig,
) -> Rig {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    let ledger = Arc::new(StoreLedger::new(store.clone(), allocation));
    let engine = AskEngine::new(Some(client), cfg);
    let runner = JobRunner::new(store.clone(), engine, ledger.clone(), insights, cfg);
    Rig {
        runner,
        ledger,
        store,
    }
}

async fn wait_terminal(runner: &JobRunner, tenant: &str, job_id: i64) -> BackgroundJob {
    for _ in 0..500 {
        if let Some(job) = runner.get_job(tenant, job_id).unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn full_run_completes_with_insights_and_summary() {
    // call order: plan, ask q1, insights q1, ask q2, insights q2, summary
    let client = Arc::new(FakeClient::new(vec![
        PLAN_TWO,
        ASK_REPLY,
        INSIGHT_REPLY,
        ASK_REPLY,
        INSIGHT_REPLY,
        "EMEA leads revenue across both questions.",
    ]));
    let cfg = fast_config();
    let insights = Arc::new(LlmInsightGenerator::new(client.clone(), cfg.max_tokens));
    let rig = rig_with(client.clone(), insights, 10.0, &cfg);

    let job_id = rig
        .runner
        .start("t1", "p1", 5.0, tenant_db())
        .await
        .unwrap();
    let job = wait_terminal(&rig.runner, "t1", job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_questions_planned, 2);
    assert_eq!(job.questions_completed, 2);
    assert_eq!(job.findings.len(), 2);
    for f in &job.findings {
        assert_eq!(f.status, FindingStatus::Success);
        assert!(f.query_id.is_some());
        assert_eq!(f.insight_count, 1);
    }
    assert!(job.executive_summary.as_deref().unwrap().contains("EMEA"));
    assert!(job.error_message.is_none());
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());

    // one completion per call at fixed fake usage
    assert_eq!(client.call_count(), 6);
    let expected = 6.0 * cost_usd(100, 50);
    assert!((job.credits_used - expected).abs() < 1e-9);
    let usage = rig.ledger.get_current_usage("t1").await.unwrap();
    assert!((usage.used - expected).abs() < 1e-9);

    // each successful step persisted its query with the insights attached
    let queries = rig.runner.get_job_queries("t1", job_id).unwrap();
    assert_eq!(queries.len(), 2);
    for q in &queries {
        assert_eq!(q.source, QuerySource::Background);
        assert_eq!(q.result_summary.row_count, 2);
        assert_eq!(q.insights.len(), 1);
        assert_eq!(q.insights[0].title, "EMEA leads");
    }

    // listings see the finished job
    assert!(rig.runner.get_active_jobs("t1").unwrap().is_empty());
    assert_eq!(rig.runner.get_recent_completed_jobs("t1", 10).unwrap().len(), 1);
    assert_eq!(rig.runner.get_jobs_for_project("t1", "p1").unwrap().len(), 1);
}

#[tokio::test]
async fn budget_exhaustion_pauses_between_steps() {
    // 20k output tokens per call = $0.30 per call
    let client = Arc::new(FakeClient::new(vec![PLAN_THREE, ASK_REPLY]).with_usage(0, 20_000));
    let cfg = fast_config();
    let rig = rig_with(client, Arc::new(NoInsights), 10.0, &cfg);

    // plan $0.30, step1 $0.60, step2 $0.90 >= budget -> pause before step3
    let job_id = rig
        .runner
        .start("t1", "p1", 0.75, tenant_db())
        .await
        .unwrap();
    let job = wait_terminal(&rig.runner, "t1", job_id).await;

    assert_eq!(job.status, JobStatus::PausedCredits);
    assert_eq!(job.total_questions_planned, 3);
    assert_eq!(job.questions_completed, 2);
    assert_eq!(job.findings.len(), 2);
    assert!(job.executive_summary.is_none());
    assert!(job.error_message.is_none());
    // the step that crossed the line is still accounted
    assert!((job.credits_used - 0.90).abs() < 1e-9);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn start_refuses_below_credit_floor_without_a_row() {
    let client = Arc::new(FakeClient::new(vec![PLAN_TWO]));
    let cfg = fast_config();
    // $0.30 remaining < $0.50 floor
    let rig = rig_with(client, Arc::new(NoInsights), 0.30, &cfg);

    let err = rig
        .runner
        .start("t1", "p1", 1.0, tenant_db())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("insufficient credits"));

    assert!(rig.runner.get_active_jobs("t1").unwrap().is_empty());
    assert!(rig.runner.get_jobs_for_project("t1", "p1").unwrap().is_empty());
}

#[tokio::test]
async fn start_refuses_when_concurrency_cap_is_reached() {
    // one plan + two answers per job that gets to run
    let client = Arc::new(FakeClient::new(vec![
        PLAN_TWO, ASK_REPLY, ASK_REPLY, PLAN_TWO, ASK_REPLY,
    ]));
    let mut cfg = fast_config();
    cfg.jobs.max_concurrent_jobs = 2;
    let rig = rig_with(client, Arc::new(NoInsights), 10.0, &cfg);

    // two live jobs already hold every slot
    rig.store.insert_job("t1", "p1", 1.0).unwrap();
    let second = rig.store.insert_job("t1", "p1", 1.0).unwrap();

    let err = rig
        .runner
        .start("t1", "p1", 1.0, tenant_db())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("too many active analyses"));
    assert_eq!(rig.runner.get_active_jobs("t1").unwrap().len(), 2);

    // the cap is per tenant
    let other = rig.runner.start("t2", "p1", 1.0, tenant_db()).await.unwrap();
    wait_terminal(&rig.runner, "t2", other).await;

    // a slot frees once a job reaches a terminal state
    rig.store
        .finalize_job(second, JobStatus::Failed, 0.0, &[], None, Some("boom"))
        .unwrap();
    let job_id = rig.runner.start("t1", "p1", 1.0, tenant_db()).await.unwrap();
    wait_terminal(&rig.runner, "t1", job_id).await;
}

#[tokio::test]
async fn budget_is_clamped_to_remaining_allowance() {
    let client = Arc::new(FakeClient::new(vec![PLAN_TWO, ASK_REPLY]));
    let cfg = fast_config();
    let rig = rig_with(client, Arc::new(NoInsights), 2.0, &cfg);

    let job_id = rig
        .runner
        .start("t1", "p1", 100.0, tenant_db())
        .await
        .unwrap();
    let job = wait_terminal(&rig.runner, "t1", job_id).await;
    assert!((job.credits_budget - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn cancel_lands_as_failed_with_reason() {
    let client = Arc::new(FakeClient::new(vec![PLAN_THREE, ASK_REPLY]));
    let mut cfg = fast_config();
    cfg.jobs.step_delay_ms = 50;
    let rig = rig_with(client, Arc::new(NoInsights), 10.0, &cfg);

    let job_id = rig
        .runner
        .start("t1", "p1", 5.0, tenant_db())
        .await
        .unwrap();
    assert!(rig.runner.cancel(job_id));

    let job = wait_terminal(&rig.runner, "t1", job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("Cancelled by user"));
    assert!(job.executive_summary.is_none());

    // the flag is gone once the job settles
    for _ in 0..100 {
        if !rig.runner.cancel(job_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cancel flag was never released");
}

#[tokio::test]
async fn cancel_of_unknown_job_is_a_no_op() {
    let client = Arc::new(FakeClient::new(vec![PLAN_TWO]));
    let cfg = fast_config();
    let rig = rig_with(client, Arc::new(NoInsights), 10.0, &cfg);
    assert!(!rig.runner.cancel(12345));
}

#[tokio::test]
async fn step_failures_never_fail_the_job() {
    // q1 returns zero rows, q2 generates a forbidden statement
    let client = Arc::new(FakeClient::new(vec![PLAN_TWO, EMPTY_REPLY, FORBIDDEN_REPLY]));
    let cfg = fast_config();
    let rig = rig_with(client.clone(), Arc::new(NoInsights), 10.0, &cfg);

    let job_id = rig
        .runner
        .start("t1", "p1", 5.0, tenant_db())
        .await
        .unwrap();
    let job = wait_terminal(&rig.runner, "t1", job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.findings[0].status, FindingStatus::NoResults);
    assert_eq!(job.findings[1].status, FindingStatus::Error);
    assert!(job.findings.iter().all(|f| f.query_id.is_none()));
    assert!(rig.runner.get_job_queries("t1", job_id).unwrap().is_empty());

    // zero insights -> canned summary, no extra provider call
    assert_eq!(client.call_count(), 3);
    let summary = job.executive_summary.unwrap();
    assert!(summary.contains("2 question(s)"));
    assert!(summary.contains("0 produced results"));
}

#[tokio::test]
async fn unusable_plan_fails_the_job() {
    let client = Arc::new(FakeClient::new(vec!["I would rather not."]));
    let cfg = fast_config();
    let rig = rig_with(client, Arc::new(NoInsights), 10.0, &cfg);

    let job_id = rig
        .runner
        .start("t1", "p1", 5.0, tenant_db())
        .await
        .unwrap();
    let job = wait_terminal(&rig.runner, "t1", job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("planner returned no questions"));
    assert!(job.findings.is_empty());
}
