use crate::cache::{question_hash, schema_hash, QueryCache};
use crate::config::CoreConfig;
use crate::datastore::TenantDataStore;
use crate::errors::AskErrorKind;
use crate::model::{ColumnInfo, ColumnType, QuerySource, VisualizationType};
use crate::prompt;
use crate::providers::llm::CompletionClient;
use crate::ratelimit::{LimitDecision, RateLimiter};
use crate::sqlguard;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct AskOptions {
    pub timeout: Duration,
    pub conversation_context: Option<String>,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            conversation_context: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AskSuccess {
    pub explanation: String,
    pub assumptions: String,
    pub sql: String,
    pub visualization: String,
    pub visualization_type: VisualizationType,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub query_time_ms: u64,
    pub source: QuerySource,
}

#[derive(Debug, Clone)]
pub struct AskFailure {
    pub kind: AskErrorKind,
    pub message: String,
    /// Parsed fields carried for transparency on validation failures.
    pub explanation: String,
    pub assumptions: String,
    pub sql: String,
}

impl AskFailure {
    fn bare(kind: AskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            explanation: String::new(),
            assumptions: String::new(),
            sql: String::new(),
        }
    }
}

/// Every expected failure mode comes back as a tagged value, never an
/// exception, so callers can map tags to transport-specific status codes.
#[derive(Debug, Clone)]
pub enum AskOutcome {
    Success(Box<AskSuccess>),
    Failure(AskFailure),
}

impl AskOutcome {
    pub fn error_kind(&self) -> Option<AskErrorKind> {
        match self {
            AskOutcome::Success(_) => None,
            AskOutcome::Failure(f) => Some(f.kind),
        }
    }
}

/// Answers one question: schema context -> prompt -> completion -> parse ->
/// validate -> bounded execution.
#[derive(Clone)]
pub struct AskEngine {
    client: Option<Arc<dyn CompletionClient>>,
    model_max_tokens: u32,
    temperature: f32,
    max_result_rows: usize,
}

impl AskEngine {
    pub fn new(client: Option<Arc<dyn CompletionClient>>, cfg: &CoreConfig) -> Self {
        Self {
            client,
            model_max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            max_result_rows: cfg.max_result_rows,
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn client(&self) -> Option<Arc<dyn CompletionClient>> {
        self.client.clone()
    }

    /// Token usage of the most recent completion is not surfaced here; use
    /// [`AskEngine::ask_with_usage`] when the caller accounts credits.
    pub async fn ask(
        &self,
        data_store: &dyn TenantDataStore,
        question: &str,
        opts: &AskOptions,
    ) -> AskOutcome {
        self.ask_with_usage(data_store, question, opts).await.0
    }

    /// The execution timeout is best-effort: on expiry the caller gets
    /// `timeout_error`, but the statement may keep running to completion
    /// inside the data store. True statement cancellation would need driver
    /// support the embedded store does not expose.
    pub async fn ask_with_usage(
        &self,
        data_store: &dyn TenantDataStore,
        question: &str,
        opts: &AskOptions,
    ) -> (AskOutcome, u64, u64) {
        self.ask_inner(data_store, question, opts, None).await
    }

    /// Variant for callers that already gathered the schema context (the
    /// interactive path hashes it for the cache key, the job loop reuses the
    /// planning context); skips the engine's own scan of the tenant store.
    pub async fn ask_with_schema_context(
        &self,
        data_store: &dyn TenantDataStore,
        question: &str,
        schema_context: &str,
        opts: &AskOptions,
    ) -> (AskOutcome, u64, u64) {
        self.ask_inner(data_store, question, opts, Some(schema_context))
            .await
    }

    async fn ask_inner(
        &self,
        data_store: &dyn TenantDataStore,
        question: &str,
        opts: &AskOptions,
        prefetched_context: Option<&str>,
    ) -> (AskOutcome, u64, u64) {
        let Some(client) = &self.client else {
            return (
                AskOutcome::Failure(AskFailure::bare(
                    AskErrorKind::ConfigurationError,
                    "no completion provider configured",
                )),
                0,
                0,
            );
        };

        let tables = match data_store.get_tables().await {
            Ok(t) => t,
            Err(e) => {
                return (
                    AskOutcome::Failure(AskFailure::bare(
                        AskErrorKind::SchemaError,
                        format!("failed to inspect schema: {}", e),
                    )),
                    0,
                    0,
                )
            }
        };
        if tables.is_empty() {
            return (
                AskOutcome::Failure(AskFailure::bare(
                    AskErrorKind::NoData,
                    "no tables found; upload data first",
                )),
                0,
                0,
            );
        }

        let schema_context = match prefetched_context {
            Some(c) => c.to_string(),
            None => match data_store.gather_schema_context().await {
                Ok(c) => c,
                Err(e) => {
                    return (
                        AskOutcome::Failure(AskFailure::bare(
                            AskErrorKind::SchemaError,
                            format!("failed to gather schema context: {}", e),
                        )),
                        0,
                        0,
                    )
                }
            },
        };

        let system = prompt::build_system_prompt(&schema_context, self.max_result_rows);
        let user = prompt::build_user_message(question, opts.conversation_context.as_deref());

        let completion = match client
            .complete(&system, &user, self.model_max_tokens, self.temperature)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                return (
                    AskOutcome::Failure(AskFailure::bare(
                        AskErrorKind::ApiError,
                        format!("completion provider failed: {}", e),
                    )),
                    0,
                    0,
                )
            }
        };
        let (in_tok, out_tok) = (completion.input_tokens, completion.output_tokens);

        let parsed = prompt::parse_response(&completion.text);

        let check = sqlguard::validate(&parsed.sql);
        if !check.valid {
            return (
                AskOutcome::Failure(AskFailure {
                    kind: AskErrorKind::SqlValidationError,
                    message: check.reason.unwrap_or_else(|| "invalid query".into()),
                    explanation: parsed.explanation,
                    assumptions: parsed.assumptions,
                    sql: parsed.sql,
                }),
                in_tok,
                out_tok,
            );
        }

        let started = std::time::Instant::now();
        let result = match timeout(opts.timeout, data_store.execute(&parsed.sql)).await {
            Err(_elapsed) => {
                return (
                    AskOutcome::Failure(AskFailure {
                        kind: AskErrorKind::TimeoutError,
                        message: format!(
                            "query exceeded {} ms (execution may still finish in the store)",
                            opts.timeout.as_millis()
                        ),
                        explanation: parsed.explanation,
                        assumptions: parsed.assumptions,
                        sql: parsed.sql,
                    }),
                    in_tok,
                    out_tok,
                )
            }
            Ok(Err(e)) => {
                return (
                    AskOutcome::Failure(AskFailure {
                        kind: AskErrorKind::SqlExecutionError,
                        message: format!("query execution failed: {}", e),
                        explanation: parsed.explanation,
                        assumptions: parsed.assumptions,
                        sql: parsed.sql,
                    }),
                    in_tok,
                    out_tok,
                )
            }
            Ok(Ok(r)) => r,
        };
        let query_time_ms = started.elapsed().as_millis() as u64;

        let mut rows = result.rows;
        let truncated = rows.len() > self.max_result_rows;
        rows.truncate(self.max_result_rows);

        let columns = infer_columns(&result.columns, rows.first());
        let row_count = rows.len();

        (
            AskOutcome::Success(Box::new(AskSuccess {
                explanation: parsed.explanation,
                assumptions: parsed.assumptions,
                sql: parsed.sql,
                visualization: parsed.visualization,
                visualization_type: parsed.visualization_type,
                columns,
                rows,
                row_count,
                truncated,
                query_time_ms,
                source: QuerySource::Interactive,
            })),
            in_tok,
            out_tok,
        )
    }
}

/// Scalar type per column, inferred from the first row's values.
fn infer_columns(names: &[String], first_row: Option<&Vec<serde_json::Value>>) -> Vec<ColumnInfo> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let column_type = match first_row.and_then(|r| r.get(i)) {
                Some(serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => {
                    ColumnType::Integer
                }
                Some(serde_json::Value::Number(_)) => ColumnType::Real,
                _ => ColumnType::Text,
            };
            ColumnInfo {
                name: name.clone(),
                column_type,
            }
        })
        .collect()
}

/// Interactive-path response: rate limiting is reported separately from the
/// orchestration outcome so the transport can attach Retry-After semantics.
#[derive(Debug)]
pub enum InteractiveResponse {
    RateLimited(LimitDecision),
    Answered(AskOutcome),
}

/// Composes the rate limiter and the query cache around the engine for
/// interactive questions. Background-job steps call the engine directly and
/// bypass the cache.
pub struct AskService {
    pub engine: AskEngine,
    pub cache: QueryCache,
    pub limiter: RateLimiter,
}

impl AskService {
    pub fn new(engine: AskEngine, cache: QueryCache, limiter: RateLimiter) -> Self {
        Self {
            engine,
            cache,
            limiter,
        }
    }

    pub async fn ask_interactive(
        &self,
        tenant_id: &str,
        project_id: &str,
        data_store: &dyn TenantDataStore,
        question: &str,
        opts: &AskOptions,
    ) -> InteractiveResponse {
        let decision = self.limiter.check_limit(tenant_id, "ask");
        if !decision.allowed {
            return InteractiveResponse::RateLimited(decision);
        }

        let q_hash = question_hash(question);
        let schema_context = match data_store.gather_schema_context().await {
            Ok(ctx) => ctx,
            // cache is keyed on schema state; without it, skip straight to
            // the engine which will surface the schema error itself
            Err(_) => {
                return InteractiveResponse::Answered(
                    self.engine.ask(data_store, question, opts).await,
                )
            }
        };
        let s_hash = schema_hash(&schema_context);

        if let Some(hit) = self.cache.get(tenant_id, &q_hash, &s_hash) {
            if let Ok(mut success) = serde_json::from_value::<AskSuccess>(hit) {
                success.source = QuerySource::Cache;
                return InteractiveResponse::Answered(AskOutcome::Success(Box::new(success)));
            }
        }

        // the context gathered for the hash doubles as the engine's, so a
        // miss costs one schema scan, not two
        let (outcome, _, _) = self
            .engine
            .ask_with_schema_context(data_store, question, &schema_context, opts)
            .await;
        if let AskOutcome::Success(success) = &outcome {
            if let Ok(value) = serde_json::to_value(success.as_ref()) {
                self.cache
                    .set(tenant_id, project_id, question, &q_hash, &s_hash, &value);
            }
        }
        InteractiveResponse::Answered(outcome)
    }
}
