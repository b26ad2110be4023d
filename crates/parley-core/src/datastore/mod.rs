use async_trait::async_trait;

pub mod sqlite;

/// Columns plus untyped rows returned by the tenant's row store.
#[derive(Debug, Clone, Default)]
pub struct TableResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// The tenant's uploaded-data store. Generated queries are opaque text passed
/// through to it; implementations must reject any call when not connected.
#[async_trait]
pub trait TenantDataStore: Send + Sync {
    async fn execute(&self, sql: &str) -> anyhow::Result<TableResult>;
    async fn get_tables(&self) -> anyhow::Result<Vec<String>>;
    /// Textual description of tables/columns/row counts/sample values used to
    /// ground generation. Each table contributes a "Table: name (n rows)"
    /// line, which the cache's schema hash keys on.
    async fn gather_schema_context(&self) -> anyhow::Result<String>;
}
