use crate::storage::store::{now_ms, Store};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Normalizes the question (lowercase, trim, collapse internal whitespace)
/// before hashing, so cosmetic rephrasings share a cache slot.
pub fn question_hash(question: &str) -> String {
    let normalized = question
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    sha256_hex(&normalized)
}

fn table_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Table:\s+(\S+)\s+\((\d+) rows?\)").unwrap())
}

/// Hashes only each table's name and row count, sorted, so the hash moves
/// when tables are added/removed or row counts change but not on unrelated
/// schema-text formatting.
pub fn schema_hash(schema_context: &str) -> String {
    let mut entries: Vec<String> = table_line()
        .captures_iter(schema_context)
        .map(|c| format!("{}:{}", &c[1], &c[2]))
        .collect();
    entries.sort();
    sha256_hex(&entries.join("\n"))
}

/// Hash-keyed, TTL-based store of prior question -> result mappings.
///
/// All storage failures fail open: a broken cache degrades to misses and
/// dropped writes, never to a blocked request.
pub struct QueryCache {
    store: Store,
    ttl_ms: i64,
}

impl QueryCache {
    pub fn new(store: Store, ttl_seconds: u64) -> Self {
        Self {
            store,
            ttl_ms: ttl_seconds as i64 * 1000,
        }
    }

    pub fn get(
        &self,
        tenant_id: &str,
        question_hash: &str,
        schema_hash: &str,
    ) -> Option<serde_json::Value> {
        match self
            .store
            .cache_get(tenant_id, question_hash, schema_hash, now_ms())
        {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(error = %e, "cache entry deserialization failed, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &self,
        tenant_id: &str,
        project_id: &str,
        question: &str,
        question_hash: &str,
        schema_hash: &str,
        result: &serde_json::Value,
    ) {
        let expires_at = now_ms() + self.ttl_ms;
        let result_json = result.to_string();
        if let Err(e) = self.store.cache_put(
            tenant_id,
            project_id,
            question,
            question_hash,
            schema_hash,
            &result_json,
            expires_at,
        ) {
            tracing::warn!(error = %e, "cache write failed, continuing without caching");
        }
    }

    /// Hard delete, used whenever the tenant's underlying data changes
    /// (upload, refresh, delete).
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        match self.store.cache_delete_tenant(tenant_id) {
            Ok(n) => tracing::debug!(tenant = tenant_id, entries = n, "invalidated tenant cache"),
            Err(e) => tracing::warn!(error = %e, "cache invalidation failed"),
        }
    }

    pub fn invalidate_project(&self, project_id: &str) {
        match self.store.cache_delete_project(project_id) {
            Ok(n) => {
                tracing::debug!(project = project_id, entries = n, "invalidated project cache")
            }
            Err(e) => tracing::warn!(error = %e, "cache invalidation failed"),
        }
    }

    /// Deletes expired rows; intended to run on a periodic sweep.
    pub fn cleanup(&self) -> anyhow::Result<usize> {
        self.store.cache_delete_expired(now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_hash_normalizes() {
        assert_eq!(question_hash("What is Revenue?"), question_hash("what is revenue?  "));
        assert_eq!(question_hash("a   b\tc"), question_hash("A B C"));
        assert_ne!(question_hash("revenue"), question_hash("profit"));
    }

    #[test]
    fn schema_hash_keys_on_tables_and_counts() {
        let a = "Table: orders (10 rows)\nColumns:\n  - id (INTEGER)\n";
        let b = "Table: orders (10 rows)\nColumns:\n  - id (INTEGER), e.g. 1\n  - extra (TEXT)\n";
        // formatting/columns changed, tables and counts did not
        assert_eq!(schema_hash(a), schema_hash(b));

        let grew = "Table: orders (11 rows)\n";
        assert_ne!(schema_hash(a), schema_hash(grew));

        let added = "Table: orders (10 rows)\nTable: users (5 rows)\n";
        assert_ne!(schema_hash(a), schema_hash(added));

        // order independence
        let swapped = "Table: users (5 rows)\nTable: orders (10 rows)\n";
        assert_eq!(schema_hash(added), schema_hash(swapped));
    }
}
