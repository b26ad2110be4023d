use crate::insights::Insight;
use crate::model::Finding;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedQuestion {
    pub question: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub complexity: String,
}

pub fn build_plan_system_prompt(n: usize) -> String {
    format!(
        r#"You are planning an autonomous analysis of a tabular dataset. Given the schema below, propose the {n} most valuable analytical questions, ranked by expected insight value.

Respond with a JSON array only. Each element: {{"question": "...", "rationale": "why this matters", "complexity": "low|medium|high"}}."#
    )
}

pub fn build_plan_user_message(schema_context: &str) -> String {
    format!("Schema:\n{}", schema_context)
}

fn numbered_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\d+[.)]\s+(.+)$").unwrap())
}

/// Parses the planner reply: a JSON array of question objects, with a
/// numbered-list fallback for replies that ignore the format. Returns at
/// most `max` questions; an unusable reply returns an empty plan.
pub fn parse_plan(text: &str, max: usize) -> Vec<PlannedQuestion> {
    let trimmed = text.trim();
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if end > start {
            if let Ok(mut plan) =
                serde_json::from_str::<Vec<PlannedQuestion>>(&trimmed[start..=end])
            {
                plan.retain(|p| !p.question.trim().is_empty());
                plan.truncate(max);
                if !plan.is_empty() {
                    return plan;
                }
            }
        }
    }

    numbered_line()
        .captures_iter(trimmed)
        .take(max)
        .map(|c| PlannedQuestion {
            question: c[1].trim().to_string(),
            rationale: String::new(),
            complexity: String::new(),
        })
        .collect()
}

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are writing an executive summary of an automated data analysis. \
Summarize the key insights below in 3-6 sentences for a business audience. \
Lead with the most important finding.";

pub fn build_summary_user_message(insights: &[Insight]) -> String {
    let mut out = String::from("Insights:\n");
    for i in insights {
        out.push_str(&format!(
            "- [{}/{}] {}: {}\n",
            i.insight_type, i.severity, i.title, i.description
        ));
    }
    out
}

/// Summary used when there are no insights or no provider; always non-empty.
pub fn fallback_summary(findings: &[Finding]) -> String {
    let answered = findings
        .iter()
        .filter(|f| f.status == crate::model::FindingStatus::Success)
        .count();
    format!(
        "Analysis ran {} question(s); {} produced results. No automated insights were generated for this run.",
        findings.len(),
        answered
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FindingStatus;

    #[test]
    fn parses_json_plan() {
        let text = r#"[
            {"question": "What drives revenue?", "rationale": "core metric", "complexity": "low"},
            {"question": "Any seasonal pattern?", "rationale": "forecasting", "complexity": "medium"}
        ]"#;
        let plan = parse_plan(text, 10);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].question, "What drives revenue?");
        assert_eq!(plan[1].complexity, "medium");
    }

    #[test]
    fn truncates_to_max() {
        let text = r#"[{"question":"a"},{"question":"b"},{"question":"c"}]"#;
        assert_eq!(parse_plan(text, 2).len(), 2);
    }

    #[test]
    fn numbered_list_fallback() {
        let text = "Here are the questions:\n1. What is total revenue?\n2) Which region grew fastest?\n";
        let plan = parse_plan(text, 10);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].question, "Which region grew fastest?");
        assert_eq!(plan[1].rationale, "");
    }

    #[test]
    fn garbage_reply_gives_empty_plan() {
        assert!(parse_plan("I cannot help with that.", 10).is_empty());
        assert!(parse_plan("[]", 10).is_empty());
    }

    #[test]
    fn fallback_summary_is_never_empty() {
        assert!(!fallback_summary(&[]).is_empty());
        let findings = vec![Finding {
            question_index: 0,
            question: "q".into(),
            rationale: String::new(),
            status: FindingStatus::Success,
            query_id: Some(1),
            insight_count: 0,
        }];
        let s = fallback_summary(&findings);
        assert!(s.contains("1 question"));
    }
}
