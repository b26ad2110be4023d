use serde::{Deserialize, Serialize};

/// Chart hint emitted by the model alongside the generated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationType {
    #[default]
    Table,
    BarChart,
    LineChart,
    PieChart,
    ScatterPlot,
    AreaChart,
    Heatmap,
    SingleNumber,
    GroupedBarChart,
}

impl VisualizationType {
    /// Lenient parse: anything unrecognized falls back to a plain table.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "table" => VisualizationType::Table,
            "bar_chart" => VisualizationType::BarChart,
            "line_chart" => VisualizationType::LineChart,
            "pie_chart" => VisualizationType::PieChart,
            "scatter_plot" => VisualizationType::ScatterPlot,
            "area_chart" => VisualizationType::AreaChart,
            "heatmap" => VisualizationType::Heatmap,
            "single_number" => VisualizationType::SingleNumber,
            "grouped_bar_chart" => VisualizationType::GroupedBarChart,
            _ => VisualizationType::Table,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VisualizationType::Table => "table",
            VisualizationType::BarChart => "bar_chart",
            VisualizationType::LineChart => "line_chart",
            VisualizationType::PieChart => "pie_chart",
            VisualizationType::ScatterPlot => "scatter_plot",
            VisualizationType::AreaChart => "area_chart",
            VisualizationType::Heatmap => "heatmap",
            VisualizationType::SingleNumber => "single_number",
            VisualizationType::GroupedBarChart => "grouped_bar_chart",
        }
    }
}

/// Scalar type inferred for a result column from the first row's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "INTEGER")]
    Integer,
    #[serde(rename = "REAL")]
    Real,
    #[serde(rename = "TEXT")]
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

/// Where an answered question came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    Interactive,
    Cache,
    Background,
}

impl QuerySource {
    pub fn parse(s: &str) -> Self {
        match s {
            "interactive" => QuerySource::Interactive,
            "cache" => QuerySource::Cache,
            "background" => QuerySource::Background,
            _ => QuerySource::Interactive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuerySource::Interactive => "interactive",
            QuerySource::Cache => "cache",
            QuerySource::Background => "background",
        }
    }
}

/// Row count plus a small sample of rows, persisted with each answered question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSummary {
    pub row_count: usize,
    #[serde(default)]
    pub sample_rows: Vec<Vec<serde_json::Value>>,
}

/// One answered question. Immutable after creation; pin metadata is owned by
/// an external collaborator and is not modeled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: i64,
    pub tenant_id: String,
    pub project_id: String,
    pub question: String,
    pub generated_sql: String,
    pub explanation: String,
    pub assumptions: String,
    pub visualization_type: VisualizationType,
    pub columns: Vec<ColumnInfo>,
    pub result_summary: ResultSummary,
    /// Insights generated for this query (background path only).
    #[serde(default)]
    pub insights: Vec<crate::insights::Insight>,
    pub execution_time_ms: u64,
    pub status: QueryStatus,
    pub source: QuerySource,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    PausedCredits,
    Failed,
}

impl JobStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "paused_credits" => JobStatus::PausedCredits,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::PausedCredits => "paused_credits",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PausedCredits | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Success,
    NoResults,
    Error,
}

/// Outcome record of one step of a background analysis job. Appended after
/// the step finishes, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub question_index: usize,
    pub question: String,
    pub rationale: String,
    pub status: FindingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<i64>,
    #[serde(default)]
    pub insight_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: i64,
    pub tenant_id: String,
    pub project_id: String,
    pub status: JobStatus,
    pub credits_budget: f64,
    pub credits_used: f64,
    pub total_questions_planned: usize,
    pub questions_completed: usize,
    pub findings: Vec<Finding>,
    pub executive_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}
