use crate::model::VisualizationType;
use regex::Regex;
use std::sync::OnceLock;

const SECTION_LABELS: [&str; 4] = [
    "EXPLANATION:",
    "ASSUMPTIONS:",
    "VISUALIZATION:",
    "VISUALIZATION_TYPE:",
];

/// System instruction fixing the output contract the parser relies on:
/// five labeled sections in order, with the query in a fenced ```sql block.
pub fn build_system_prompt(schema_context: &str, max_rows: usize) -> String {
    format!(
        r#"You are a data analyst. Given the schema below, answer the user's question with a single read-only SQL query.

{schema_context}

Respond in exactly this format:

EXPLANATION:
One or two sentences describing what the query computes.

ASSUMPTIONS:
Any assumptions you made to resolve ambiguity in the question. Write "none" if the question was unambiguous.

```sql
SELECT ...
```

VISUALIZATION:
A short description of how to present the result.

VISUALIZATION_TYPE:
One token from: table, bar_chart, line_chart, pie_chart, scatter_plot, area_chart, heatmap, single_number, grouped_bar_chart

Rules:
- Only SELECT or WITH queries. Never use DELETE, UPDATE, INSERT, DROP, ALTER, CREATE, TRUNCATE, GRANT, REVOKE, EXEC or EXECUTE.
- Quote identifiers that contain spaces or mixed case.
- Limit results to at most {max_rows} rows.
- If the question is ambiguous, pick a reasonable interpretation and state it under ASSUMPTIONS."#
    )
}

pub fn build_user_message(question: &str, conversation_context: Option<&str>) -> String {
    match conversation_context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("Previous conversation:\n{}\n\nQuestion: {}", ctx, question)
        }
        _ => question.to_string(),
    }
}

/// Structured fields extracted from a free-text model reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub explanation: String,
    pub assumptions: String,
    pub sql: String,
    pub visualization: String,
    pub visualization_type: VisualizationType,
}

fn sql_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```sql\s*(.*?)```").unwrap())
}

/// Extracts the labeled sections from a model reply.
///
/// Never fails: missing sections degrade to defaults, and a reply with no
/// recognizable structure yields an empty SQL string, which the safety
/// validator then rejects with "no query generated".
pub fn parse_response(text: &str) -> ParsedResponse {
    let sql = sql_fence()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let visualization_type = section(text, "VISUALIZATION_TYPE:")
        .map(|s| VisualizationType::parse(&s))
        .unwrap_or_default();

    ParsedResponse {
        explanation: section(text, "EXPLANATION:").unwrap_or_default(),
        assumptions: section(text, "ASSUMPTIONS:").unwrap_or_default(),
        sql,
        visualization: section(text, "VISUALIZATION:").unwrap_or_default(),
        visualization_type,
    }
}

/// Text between a label and the next label or code fence.
fn section(text: &str, label: &str) -> Option<String> {
    let start = text.find(label)? + label.len();
    let rest = &text[start..];

    let mut end = rest.len();
    for other in SECTION_LABELS {
        if other == label {
            continue;
        }
        if let Some(pos) = rest.find(other) {
            end = end.min(pos);
        }
    }
    if let Some(pos) = rest.find("```") {
        end = end.min(pos);
    }

    Some(rest[..end].trim().to_string())
}
