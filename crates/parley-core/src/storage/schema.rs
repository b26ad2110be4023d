pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS queries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  project_id TEXT NOT NULL,
  job_id INTEGER,
  question TEXT NOT NULL,
  generated_sql TEXT NOT NULL,
  explanation TEXT NOT NULL DEFAULT '',
  assumptions TEXT NOT NULL DEFAULT '',
  visualization_type TEXT NOT NULL DEFAULT 'table',
  columns_json TEXT NOT NULL DEFAULT '[]',
  result_summary_json TEXT NOT NULL DEFAULT '{}',
  insights_json TEXT NOT NULL DEFAULT '[]',
  execution_time_ms INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL,
  source TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queries_tenant_project ON queries(tenant_id, project_id);
CREATE INDEX IF NOT EXISTS idx_queries_job ON queries(job_id);

CREATE TABLE IF NOT EXISTS query_cache (
  tenant_id TEXT NOT NULL,
  project_id TEXT NOT NULL,
  question_hash TEXT NOT NULL,
  schema_hash TEXT NOT NULL,
  question TEXT NOT NULL,
  result_json TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  hit_count INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  PRIMARY KEY (tenant_id, question_hash, schema_hash)
);

CREATE INDEX IF NOT EXISTS idx_query_cache_project ON query_cache(project_id);
CREATE INDEX IF NOT EXISTS idx_query_cache_expiry ON query_cache(expires_at);

CREATE TABLE IF NOT EXISTS rate_windows (
  tenant_id TEXT NOT NULL,
  endpoint TEXT NOT NULL,
  window_start INTEGER NOT NULL,
  count INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (tenant_id, endpoint, window_start)
);

CREATE TABLE IF NOT EXISTS background_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  project_id TEXT NOT NULL,
  status TEXT NOT NULL,
  credits_budget REAL NOT NULL,
  credits_used REAL NOT NULL DEFAULT 0,
  total_questions_planned INTEGER NOT NULL DEFAULT 0,
  questions_completed INTEGER NOT NULL DEFAULT 0,
  findings_json TEXT NOT NULL DEFAULT '[]',
  executive_summary TEXT,
  error_message TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_tenant_status ON background_jobs(tenant_id, status);
CREATE INDEX IF NOT EXISTS idx_jobs_project ON background_jobs(project_id);

CREATE TABLE IF NOT EXISTS credit_usage (
  tenant_id TEXT NOT NULL,
  month TEXT NOT NULL,
  allocated REAL NOT NULL,
  used REAL NOT NULL DEFAULT 0,
  PRIMARY KEY (tenant_id, month)
);
"#;
