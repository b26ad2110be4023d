use crate::storage::store::{current_month, Store};
use async_trait::async_trait;

/// Dollar cost of a completion call: $3 per million input tokens,
/// $15 per million output tokens.
pub fn cost_usd(input_tokens: u64, output_tokens: u64) -> f64 {
    input_tokens as f64 / 1e6 * 3.0 + output_tokens as f64 / 1e6 * 15.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditUsage {
    pub allocated: f64,
    pub used: f64,
}

impl CreditUsage {
    pub fn remaining(&self) -> f64 {
        (self.allocated - self.used).max(0.0)
    }
}

/// Monthly dollar-denominated allowance, tracked per tenant.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn get_current_usage(&self, tenant_id: &str) -> anyhow::Result<CreditUsage>;
    async fn track_usage(
        &self,
        tenant_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        purpose: &str,
    ) -> anyhow::Result<CreditUsage>;
}

/// Ledger persisted in the core store, partitioned by calendar month.
pub struct StoreLedger {
    store: Store,
    default_allocation: f64,
}

impl StoreLedger {
    pub fn new(store: Store, default_allocation: f64) -> Self {
        Self {
            store,
            default_allocation,
        }
    }
}

#[async_trait]
impl CreditLedger for StoreLedger {
    async fn get_current_usage(&self, tenant_id: &str) -> anyhow::Result<CreditUsage> {
        let month = current_month();
        let (allocated, used) = self
            .store
            .usage_get(tenant_id, &month)?
            .unwrap_or((self.default_allocation, 0.0));
        Ok(CreditUsage { allocated, used })
    }

    async fn track_usage(
        &self,
        tenant_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        purpose: &str,
    ) -> anyhow::Result<CreditUsage> {
        let cost = cost_usd(input_tokens, output_tokens);
        let month = current_month();
        let (allocated, used) =
            self.store
                .usage_add(tenant_id, &month, cost, self.default_allocation)?;
        tracing::debug!(
            tenant = tenant_id,
            purpose,
            cost,
            used,
            "tracked completion usage"
        );
        Ok(CreditUsage { allocated, used })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_matches_published_rates() {
        assert_eq!(cost_usd(1_000_000, 0), 3.0);
        assert_eq!(cost_usd(0, 1_000_000), 15.0);
        let c = cost_usd(100_000, 10_000);
        assert!((c - 0.45).abs() < 1e-9);
    }

    #[test]
    fn remaining_never_negative() {
        let u = CreditUsage {
            allocated: 1.0,
            used: 2.5,
        };
        assert_eq!(u.remaining(), 0.0);
    }

    #[tokio::test]
    async fn store_ledger_accumulates() {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        let ledger = StoreLedger::new(store, 10.0);

        let u0 = ledger.get_current_usage("t1").await.unwrap();
        assert_eq!(u0.allocated, 10.0);
        assert_eq!(u0.used, 0.0);

        ledger.track_usage("t1", 1_000_000, 0, "ask").await.unwrap();
        let u1 = ledger.track_usage("t1", 0, 1_000_000, "plan").await.unwrap();
        assert!((u1.used - 18.0).abs() < 1e-9);

        // other tenants are untouched
        assert_eq!(ledger.get_current_usage("t2").await.unwrap().used, 0.0);
    }
}
