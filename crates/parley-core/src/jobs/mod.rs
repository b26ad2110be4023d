use crate::ask::{AskEngine, AskOptions, AskOutcome};
use crate::config::CoreConfig;
use crate::credits::{cost_usd, CreditLedger};
use crate::datastore::TenantDataStore;
use crate::insights::{Insight, InsightGenerator};
use crate::model::{
    BackgroundJob, Finding, FindingStatus, JobStatus, QueryRecord, QuerySource, QueryStatus,
    ResultSummary,
};
use crate::ratelimit::RateLimiter;
use crate::storage::store::{now_rfc3339, Store};
use anyhow::Context;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod plan;

use plan::{
    build_plan_system_prompt, build_plan_user_message, build_summary_user_message,
    fallback_summary, parse_plan, SUMMARY_SYSTEM_PROMPT,
};

/// Process-local cancellation flags keyed by job id.
///
/// Flags are checked only at step boundaries (cooperative cancellation) and
/// do not survive a restart or span multiple instances; a crashed process
/// leaves the job recoverable from its last checkpoint but uncancellable
/// until re-adopted.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    flags: Arc<Mutex<HashMap<i64, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    pub fn register(&self, job_id: i64) {
        self.flags
            .lock()
            .unwrap()
            .insert(job_id, Arc::new(AtomicBool::new(false)));
    }

    /// Returns whether a live job was found.
    pub fn request_cancel(&self, job_id: i64) -> bool {
        match self.flags.lock().unwrap().get(&job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, job_id: i64) -> bool {
        self.flags
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn remove(&self, job_id: i64) {
        self.flags.lock().unwrap().remove(&job_id);
    }
}

#[derive(Clone)]
struct JobSettings {
    plan_size: usize,
    min_credit_floor: f64,
    step_delay: Duration,
    query_timeout: Duration,
    max_tokens: u32,
}

/// Budget-bounded, cancellable, multi-step analysis of a tenant's data:
/// plan a batch of questions, drive the Ask engine through them (cache
/// bypassed), generate insights, and close with an executive summary.
///
/// State machine: queued -> running -> {completed | paused_credits | failed}.
/// Progress is persisted after every step so a crash mid-job leaves
/// recoverable partial state.
#[derive(Clone)]
pub struct JobRunner {
    store: Store,
    engine: AskEngine,
    ledger: Arc<dyn CreditLedger>,
    insights: Arc<dyn InsightGenerator>,
    limiter: RateLimiter,
    cancels: CancelRegistry,
    settings: JobSettings,
}

impl JobRunner {
    pub fn new(
        store: Store,
        engine: AskEngine,
        ledger: Arc<dyn CreditLedger>,
        insights: Arc<dyn InsightGenerator>,
        cfg: &CoreConfig,
    ) -> Self {
        let limiter = RateLimiter::new(
            store.clone(),
            cfg.rate_limit.max_requests,
            cfg.rate_limit.window_ms,
            cfg.jobs.max_concurrent_jobs,
            cfg.rate_limit.cleanup_windows,
        );
        Self {
            store,
            engine,
            ledger,
            insights,
            limiter,
            cancels: CancelRegistry::default(),
            settings: JobSettings {
                plan_size: cfg.jobs.plan_size,
                min_credit_floor: cfg.jobs.min_credit_floor,
                step_delay: Duration::from_millis(cfg.jobs.step_delay_ms),
                query_timeout: Duration::from_millis(cfg.query_timeout_ms),
                max_tokens: cfg.max_tokens,
            },
        }
    }

    /// Creates the job and schedules its run loop on a detached task; the
    /// caller gets the job id immediately and polls the persisted row for
    /// progress. Fails before creating any row when the tenant already holds
    /// the maximum number of live jobs or its remaining allowance is below
    /// the minimum floor; otherwise the effective budget is clamped to what
    /// remains.
    pub async fn start(
        &self,
        tenant_id: &str,
        project_id: &str,
        requested_budget: f64,
        data_store: Arc<dyn TenantDataStore>,
    ) -> anyhow::Result<i64> {
        let slots = self.limiter.check_concurrent_jobs(tenant_id);
        if !slots.allowed {
            anyhow::bail!(
                "too many active analyses: {} of {} already queued or running",
                slots.current,
                slots.max
            );
        }

        let usage = self.ledger.get_current_usage(tenant_id).await?;
        let remaining = usage.remaining();
        if remaining < self.settings.min_credit_floor {
            anyhow::bail!(
                "insufficient credits: ${:.2} remaining, at least ${:.2} required to start analysis",
                remaining,
                self.settings.min_credit_floor
            );
        }
        let budget = requested_budget.min(remaining);

        let job_id = self.store.insert_job(tenant_id, project_id, budget)?;
        self.cancels.register(job_id);
        tracing::info!(job = job_id, tenant = tenant_id, budget, "queued background analysis");

        let runner = self.clone();
        let tenant = tenant_id.to_string();
        tokio::spawn(async move {
            runner.execute(&tenant, job_id, data_store).await;
        });
        Ok(job_id)
    }

    /// Flips the in-process flag; returns whether a live job was found.
    /// Honored at the next step boundary.
    pub fn cancel(&self, job_id: i64) -> bool {
        self.cancels.request_cancel(job_id)
    }

    /// Runs the job to a terminal state. Called on the spawned task by
    /// [`JobRunner::start`]; exposed for embedders that drive jobs on their
    /// own executor.
    pub async fn execute(
        &self,
        tenant_id: &str,
        job_id: i64,
        data_store: Arc<dyn TenantDataStore>,
    ) {
        if let Err(e) = self.run(tenant_id, job_id, data_store.as_ref()).await {
            tracing::error!(job = job_id, error = %e, "background analysis failed");
            // per-step checkpoints already persisted partial progress
            let (credits, findings) = self
                .store
                .get_job(tenant_id, job_id)
                .ok()
                .flatten()
                .map(|j| (j.credits_used, j.findings))
                .unwrap_or((0.0, Vec::new()));
            if let Err(e2) = self.store.finalize_job(
                job_id,
                JobStatus::Failed,
                credits,
                &findings,
                None,
                Some(&e.to_string()),
            ) {
                tracing::error!(job = job_id, error = %e2, "failed to persist job failure");
            }
        }
        self.cancels.remove(job_id);
    }

    async fn run(
        &self,
        tenant_id: &str,
        job_id: i64,
        data_store: &dyn TenantDataStore,
    ) -> anyhow::Result<()> {
        self.store.mark_job_running(job_id)?;

        let job = self
            .store
            .get_job(tenant_id, job_id)?
            .context("job row missing")?;
        let budget = job.credits_budget;

        let mut findings: Vec<Finding> = Vec::new();
        let mut collected: Vec<Insight> = Vec::new();
        let mut credits_used = 0.0_f64;

        if self.cancels.is_cancelled(job_id) {
            return self.finish_cancelled(job_id, credits_used, &findings);
        }

        let client = self
            .engine
            .client()
            .context("no completion provider configured")?;

        let schema_context = data_store.gather_schema_context().await?;

        // Plan generation is the one orchestration-level provider call that
        // can fail the whole job.
        let completion = client
            .complete(
                &build_plan_system_prompt(self.settings.plan_size),
                &build_plan_user_message(&schema_context),
                self.settings.max_tokens,
                0.7,
            )
            .await
            .context("analysis planning failed")?;
        self.ledger
            .track_usage(
                tenant_id,
                completion.input_tokens,
                completion.output_tokens,
                "analysis_plan",
            )
            .await?;
        credits_used += cost_usd(completion.input_tokens, completion.output_tokens);

        let steps = parse_plan(&completion.text, self.settings.plan_size);
        anyhow::ensure!(!steps.is_empty(), "planner returned no questions");
        self.store
            .update_job_plan(job_id, steps.len(), credits_used)?;
        tracing::info!(job = job_id, questions = steps.len(), "analysis plan ready");

        let opts = AskOptions {
            timeout: self.settings.query_timeout,
            conversation_context: None,
        };
        let total = steps.len();

        for (idx, step) in steps.iter().enumerate() {
            if self.cancels.is_cancelled(job_id) {
                return self.finish_cancelled(job_id, credits_used, &findings);
            }
            // Checked before the step only; a single expensive step may
            // overshoot before the pause lands.
            if credits_used >= budget {
                tracing::info!(
                    job = job_id,
                    credits_used,
                    budget,
                    completed = findings.len(),
                    "budget exhausted, pausing"
                );
                self.store.finalize_job(
                    job_id,
                    JobStatus::PausedCredits,
                    credits_used,
                    &findings,
                    None,
                    None,
                )?;
                return Ok(());
            }

            let (outcome, in_tok, out_tok) = self
                .engine
                .ask_with_schema_context(data_store, &step.question, &schema_context, &opts)
                .await;
            if in_tok + out_tok > 0 {
                self.ledger
                    .track_usage(tenant_id, in_tok, out_tok, "background_question")
                    .await?;
                credits_used += cost_usd(in_tok, out_tok);
            }

            let finding = match outcome {
                AskOutcome::Success(success) if success.row_count > 0 => {
                    let (step_insights, insight_count) = match self
                        .insights
                        .generate(
                            &step.question,
                            &success.sql,
                            &success.columns,
                            &success.rows,
                            &schema_context,
                        )
                        .await
                    {
                        Ok(batch) => {
                            if batch.input_tokens + batch.output_tokens > 0 {
                                self.ledger
                                    .track_usage(
                                        tenant_id,
                                        batch.input_tokens,
                                        batch.output_tokens,
                                        "insights",
                                    )
                                    .await?;
                                credits_used +=
                                    cost_usd(batch.input_tokens, batch.output_tokens);
                            }
                            let n = batch.insights.len();
                            (batch.insights, n)
                        }
                        Err(e) => {
                            tracing::warn!(job = job_id, error = %e, "insight generation failed");
                            (Vec::new(), 0)
                        }
                    };

                    let record = QueryRecord {
                        id: 0,
                        tenant_id: tenant_id.to_string(),
                        project_id: job.project_id.clone(),
                        question: step.question.clone(),
                        generated_sql: success.sql.clone(),
                        explanation: success.explanation.clone(),
                        assumptions: success.assumptions.clone(),
                        visualization_type: success.visualization_type,
                        columns: success.columns.clone(),
                        result_summary: ResultSummary {
                            row_count: success.row_count,
                            sample_rows: success.rows.iter().take(10).cloned().collect(),
                        },
                        insights: step_insights.clone(),
                        execution_time_ms: success.query_time_ms,
                        status: QueryStatus::Success,
                        source: QuerySource::Background,
                        created_at: now_rfc3339(),
                    };
                    let query_id = self.store.insert_query(&record, Some(job_id))?;
                    collected.extend(step_insights);

                    Finding {
                        question_index: idx,
                        question: step.question.clone(),
                        rationale: step.rationale.clone(),
                        status: FindingStatus::Success,
                        query_id: Some(query_id),
                        insight_count,
                    }
                }
                AskOutcome::Success(_) => Finding {
                    question_index: idx,
                    question: step.question.clone(),
                    rationale: step.rationale.clone(),
                    status: FindingStatus::NoResults,
                    query_id: None,
                    insight_count: 0,
                },
                // individual step failures never fail the job
                AskOutcome::Failure(f) => {
                    tracing::debug!(job = job_id, step = idx, kind = %f.kind, error = %f.message, "step failed");
                    Finding {
                        question_index: idx,
                        question: step.question.clone(),
                        rationale: step.rationale.clone(),
                        status: FindingStatus::Error,
                        query_id: None,
                        insight_count: 0,
                    }
                }
            };

            findings.push(finding);
            self.store
                .checkpoint_job(job_id, findings.len(), credits_used, &findings)?;

            if idx + 1 < total {
                tokio::time::sleep(self.settings.step_delay).await;
            }
        }

        if self.cancels.is_cancelled(job_id) {
            return self.finish_cancelled(job_id, credits_used, &findings);
        }

        let summary = if collected.is_empty() {
            fallback_summary(&findings)
        } else {
            match client
                .complete(
                    SUMMARY_SYSTEM_PROMPT,
                    &build_summary_user_message(&collected),
                    self.settings.max_tokens,
                    0.5,
                )
                .await
            {
                Ok(c) => {
                    self.ledger
                        .track_usage(
                            tenant_id,
                            c.input_tokens,
                            c.output_tokens,
                            "executive_summary",
                        )
                        .await?;
                    credits_used += cost_usd(c.input_tokens, c.output_tokens);
                    let text = c.text.trim().to_string();
                    if text.is_empty() {
                        fallback_summary(&findings)
                    } else {
                        text
                    }
                }
                Err(e) => {
                    tracing::warn!(job = job_id, error = %e, "summary generation failed, using fallback");
                    fallback_summary(&findings)
                }
            }
        };

        self.store.finalize_job(
            job_id,
            JobStatus::Completed,
            credits_used,
            &findings,
            Some(&summary),
            None,
        )?;
        tracing::info!(job = job_id, credits_used, completed = findings.len(), "analysis completed");
        Ok(())
    }

    fn finish_cancelled(
        &self,
        job_id: i64,
        credits_used: f64,
        findings: &[Finding],
    ) -> anyhow::Result<()> {
        tracing::info!(job = job_id, "analysis cancelled");
        self.store.finalize_job(
            job_id,
            JobStatus::Failed,
            credits_used,
            findings,
            None,
            Some("Cancelled by user"),
        )
    }

    // --- Read-only projections over persisted state ---

    pub fn get_job(&self, tenant_id: &str, job_id: i64) -> anyhow::Result<Option<BackgroundJob>> {
        self.store.get_job(tenant_id, job_id)
    }

    pub fn get_jobs_for_project(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> anyhow::Result<Vec<BackgroundJob>> {
        self.store.jobs_for_project(tenant_id, project_id)
    }

    pub fn get_active_jobs(&self, tenant_id: &str) -> anyhow::Result<Vec<BackgroundJob>> {
        self.store.active_jobs(tenant_id)
    }

    pub fn get_recent_completed_jobs(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<BackgroundJob>> {
        self.store.recent_completed_jobs(tenant_id, limit)
    }

    pub fn get_job_queries(
        &self,
        tenant_id: &str,
        job_id: i64,
    ) -> anyhow::Result<Vec<QueryRecord>> {
        self.store.queries_for_job(tenant_id, job_id)
    }
}
