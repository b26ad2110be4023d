use crate::model::ColumnInfo;
use crate::providers::llm::CompletionClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    #[serde(rename = "type", default)]
    pub insight_type: String,
    #[serde(default)]
    pub severity: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub evidence: String,
}

/// Insights plus the token usage of producing them.
#[derive(Debug, Clone, Default)]
pub struct InsightBatch {
    pub insights: Vec<Insight>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        sql: &str,
        columns: &[ColumnInfo],
        rows: &[Vec<serde_json::Value>],
        schema_context: &str,
    ) -> anyhow::Result<InsightBatch>;
}

const INSIGHT_SYSTEM_PROMPT: &str = r#"You are a data analyst reviewing a query result. Produce up to 3 notable insights as a JSON array. Each element: {"type": "trend|anomaly|comparison|summary", "severity": "info|notable|critical", "title": "...", "description": "...", "evidence": "..."}. Respond with the JSON array only."#;

/// Generates insights by prompting the completion provider and parsing the
/// reply leniently: malformed JSON yields zero insights rather than an error,
/// so a bad reply never fails a background-job step.
pub struct LlmInsightGenerator {
    client: Arc<dyn CompletionClient>,
    max_tokens: u32,
}

impl LlmInsightGenerator {
    pub fn new(client: Arc<dyn CompletionClient>, max_tokens: u32) -> Self {
        Self { client, max_tokens }
    }
}

#[async_trait]
impl InsightGenerator for LlmInsightGenerator {
    async fn generate(
        &self,
        question: &str,
        sql: &str,
        columns: &[ColumnInfo],
        rows: &[Vec<serde_json::Value>],
        schema_context: &str,
    ) -> anyhow::Result<InsightBatch> {
        // Cap the rows shown to the model; the full set adds cost, not signal.
        let sample: Vec<_> = rows.iter().take(20).collect();
        let user_message = format!(
            "Question: {}\nSQL: {}\nColumns: {}\nRows ({} of {}):\n{}\n\nSchema:\n{}",
            question,
            sql,
            columns
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            sample.len(),
            rows.len(),
            serde_json::to_string(&sample)?,
            schema_context,
        );

        let completion = self
            .client
            .complete(INSIGHT_SYSTEM_PROMPT, &user_message, self.max_tokens, 0.3)
            .await?;

        Ok(InsightBatch {
            insights: parse_insights(&completion.text),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        })
    }
}

/// Pulls the first JSON array out of the reply; anything unparsable is
/// treated as no insights.
fn parse_insights(text: &str) -> Vec<Insight> {
    let trimmed = text.trim();
    let candidate = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Vec::new(),
    };
    serde_json::from_str(candidate).unwrap_or_default()
}
