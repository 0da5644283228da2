//! Rules: a compiled matcher plus a handler with request and response hooks.
//! Rules are evaluated in registration order; the first match wins.

mod cache;
mod content;
mod delay;
mod file;
mod forward;
mod matcher;

pub use cache::CacheRule;
pub use content::ContentRule;
pub use delay::DelayRule;
pub use file::FileRule;
pub use forward::ForwardRule;
pub use matcher::Matcher;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;

use crate::body::ProxyResponse;

/// Outcome of a rule's request hook. Exactly one outcome occurs per
/// intercepted request.
pub enum RuleResult {
    /// Forward the original request unchanged.
    Passthrough,
    /// Forward the request to this URL instead.
    Redirect(http::Uri),
    /// The handler owns the response; the engine emits it verbatim.
    Suppress(ProxyResponse),
    /// Return this response without contacting upstream.
    Synth(ProxyResponse),
    /// Synthesize a 500 carrying the error as body.
    Fail(anyhow::Error),
}

impl std::fmt::Debug for RuleResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleResult::Passthrough => f.write_str("Passthrough"),
            RuleResult::Redirect(uri) => write!(f, "Redirect({uri})"),
            RuleResult::Suppress(_) => f.write_str("Suppress"),
            RuleResult::Synth(_) => f.write_str("Synth"),
            RuleResult::Fail(e) => write!(f, "Fail({e})"),
        }
    }
}

/// A rule handler. `on_request` decides the outcome; `on_response` observes
/// (and may re-wrap) the upstream response before it is emitted.
#[async_trait::async_trait]
pub trait RuleHandler: Send + Sync {
    async fn on_request(
        &self,
        seq: u64,
        req: &mut http::request::Parts,
    ) -> anyhow::Result<RuleResult>;

    async fn on_response(&self, _seq: u64, _res: &mut ProxyResponse) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Rule {
    pub name: Option<String>,
    matcher: Matcher,
    pub(crate) handler: Arc<dyn RuleHandler>,
}

impl Rule {
    pub fn new(name: Option<String>, matcher: Matcher, handler: Arc<dyn RuleHandler>) -> Self {
        Self {
            name,
            matcher,
            handler,
        }
    }

    pub(crate) fn matches(&self, target: &str) -> bool {
        self.matcher.matches(target)
    }
}

/// Parses a CLI rule string `name|pattern|args`. `cache_dir` overrides the
/// default store directory for `cache` rules.
pub fn parse_rule(spec: &str, cache_dir: Option<&Path>) -> anyhow::Result<Rule> {
    let mut fields = spec.splitn(3, '|');
    let name = fields
        .next()
        .filter(|name| !name.is_empty())
        .with_context(|| format!("rule is missing a name: {spec:?}"))?;
    let pattern = fields
        .next()
        .with_context(|| format!("rule is missing a pattern: {spec:?}"))?;
    let args = fields.next().unwrap_or_default();

    let matcher = Matcher::compile(pattern)
        .with_context(|| format!("invalid pattern in rule {name:?}: {pattern:?}"))?;
    let handler: Arc<dyn RuleHandler> = match name {
        "delay" => Arc::new(DelayRule::new(
            args.trim()
                .parse()
                .with_context(|| format!("delay rule wants milliseconds, got {args:?}"))?,
        )),
        "content" => {
            // A JSON arg keeps its structure; anything else is the literal text.
            let value = serde_json::from_str(args)
                .unwrap_or_else(|_| serde_json::Value::String(args.to_string()));
            Arc::new(ContentRule::new(value))
        }
        "file" => Arc::new(FileRule::new(args.into())),
        "forward" => Arc::new(ForwardRule::new(
            args.parse()
                .with_context(|| format!("forward rule wants an absolute URL, got {args:?}"))?,
        )?),
        "cache" => Arc::new(CacheRule::from_cli(args, cache_dir)?),
        other => anyhow::bail!("unknown rule name: {other:?}"),
    };

    Ok(Rule::new(Some(name.to_string()), matcher, handler))
}
