use hyper::StatusCode;

use super::{RuleHandler, RuleResult};
use crate::body;

/// Answers a matched request with fixed content. Structured values are
/// JSON-serialized; scalars become their plain text form.
pub struct ContentRule {
    value: serde_json::Value,
}

impl ContentRule {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    fn render(&self) -> String {
        match &self.value {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => self.value.to_string(),
            scalar => scalar.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl RuleHandler for ContentRule {
    async fn on_request(
        &self,
        _seq: u64,
        _req: &mut http::request::Parts,
    ) -> anyhow::Result<RuleResult> {
        let response = hyper::Response::builder()
            .status(StatusCode::OK)
            .body(body::full(self.render()))?;
        Ok(RuleResult::Synth(response))
    }
}
