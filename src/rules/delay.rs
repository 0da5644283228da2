use std::time::Duration;

use super::{RuleHandler, RuleResult};

/// Holds a matched request back for a fixed time, then forwards it
/// unchanged. Non-positive delays do not suspend at all.
pub struct DelayRule {
    delay_ms: i64,
}

impl DelayRule {
    pub fn new(delay_ms: i64) -> Self {
        Self { delay_ms }
    }
}

#[async_trait::async_trait]
impl RuleHandler for DelayRule {
    async fn on_request(
        &self,
        _seq: u64,
        _req: &mut http::request::Parts,
    ) -> anyhow::Result<RuleResult> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms as u64)).await;
        }
        Ok(RuleResult::Passthrough)
    }
}
