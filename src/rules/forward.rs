use anyhow::Context as _;
use http::HeaderValue;
use http::header::HOST;

use super::{RuleHandler, RuleResult};

/// Redirects a matched request to a different origin. The target URL
/// replaces the request target wholesale and the `Host` header is rewritten
/// to the target's authority.
pub struct ForwardRule {
    target: http::Uri,
    host: HeaderValue,
}

impl ForwardRule {
    pub fn new(target: http::Uri) -> anyhow::Result<Self> {
        let authority = target
            .authority()
            .with_context(|| format!("forward target must be absolute: {target}"))?;
        let host = HeaderValue::from_str(authority.as_str())
            .with_context(|| format!("forward target has an invalid authority: {target}"))?;
        Ok(Self { target, host })
    }
}

#[async_trait::async_trait]
impl RuleHandler for ForwardRule {
    async fn on_request(
        &self,
        _seq: u64,
        req: &mut http::request::Parts,
    ) -> anyhow::Result<RuleResult> {
        req.headers.insert(HOST, self.host.clone());
        Ok(RuleResult::Redirect(self.target.clone()))
    }
}
