use regex::Regex;
use std::sync::OnceLock;

/// Outcome of the read-only safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Validation {
            valid: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Validation {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

const FORBIDDEN_KEYWORDS: [&str; 11] = [
    "DELETE", "UPDATE", "INSERT", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "EXEC", "EXECUTE",
];

fn keyword_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = FORBIDDEN_KEYWORDS.join("|");
        Regex::new(&format!(r"(?i)\b({})\b", alternation)).unwrap()
    })
}

/// Rejects generated text that must never reach the data store.
///
/// Pure and deterministic; must run before any execution path, including
/// background-job steps. Rules are applied in order: empty text, forbidden
/// write keywords (whole-word, case-insensitive), embedded statement
/// separators, and finally the SELECT/WITH prefix requirement.
pub fn validate(sql: &str) -> Validation {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Validation::reject("no query generated");
    }

    if let Some(m) = keyword_pattern().find(trimmed) {
        return Validation::reject(format!(
            "forbidden keyword: {}",
            m.as_str().to_uppercase()
        ));
    }

    // A trailing semicolon is tolerated; anything before the end means
    // multiple statements.
    if let Some(pos) = trimmed.find(';') {
        if pos != trimmed.len() - 1 {
            return Validation::reject("multiple statements not allowed");
        }
    }

    let upper = trimmed.to_uppercase();
    if !upper.starts_with("SELECT") && !upper.starts_with("WITH") {
        return Validation::reject("only read queries allowed");
    }

    Validation::ok()
}
