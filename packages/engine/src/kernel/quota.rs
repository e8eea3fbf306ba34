// Default quota implementation.
//
// Real metering (billing ledgers, plan limits) lives behind the
// QuotaGuard port in a separate deployment. The engine ships with a
// permissive implementation that records usage in the logs only.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::traits::QuotaGuard;

/// Always allows analysis; usage is logged at debug for operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmeteredQuota;

#[async_trait]
impl QuotaGuard for UnmeteredQuota {
    async fn can_proceed(&self, _tenant_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn record_usage(&self, tenant_id: &str, tokens: i64) -> Result<()> {
        debug!(tenant_id = %tenant_id, tokens = tokens, "ai usage recorded");
        Ok(())
    }
}
