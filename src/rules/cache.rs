use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;
use serde::Deserialize;

use super::{RuleHandler, RuleResult};
use crate::body::{self, ProxyResponse};
use crate::cache_store::{CacheHead, CacheKey, CacheStore};
use crate::tee_body::tee_to_file;
use crate::time_util::epoch_millis;

/// Serves matched requests from an on-disk store while entries are fresh,
/// and repopulates the store from upstream responses when they are not.
///
/// The request hook picks the entry key; the response hook finds it again
/// through the `seq → key` map, which is scoped to this rule instance.
pub struct CacheRule {
    store: CacheStore,
    ttl_seconds: Option<u64>,
    cache_by_query: bool,
    pending: Mutex<HashMap<u64, CacheKey>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheArgs {
    ttl: Option<u64>,
    #[serde(default)]
    cache_by_query: bool,
    dir: Option<std::path::PathBuf>,
}

impl CacheRule {
    pub fn new(store: CacheStore, ttl_seconds: Option<u64>, cache_by_query: bool) -> Self {
        Self {
            store,
            ttl_seconds,
            cache_by_query,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// CLI args: empty (no TTL), a TTL in seconds, or a JSON object
    /// `{"ttl": …, "cacheByQuery": …, "dir": …}`.
    pub(crate) fn from_cli(args: &str, cache_dir: Option<&Path>) -> anyhow::Result<Self> {
        let args = args.trim();
        let parsed = if args.is_empty() {
            CacheArgs::default()
        } else if let Ok(ttl) = args.parse::<u64>() {
            CacheArgs {
                ttl: Some(ttl),
                ..CacheArgs::default()
            }
        } else {
            serde_json::from_str(args)
                .with_context(|| format!("cache rule wants a TTL or a JSON object, got {args:?}"))?
        };
        let dir = parsed.dir.or_else(|| cache_dir.map(Path::to_path_buf));
        Ok(Self::new(
            CacheStore::new(dir),
            parsed.ttl,
            parsed.cache_by_query,
        ))
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Destroys every entry by removing the cache directory. Idempotent.
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.store.clear().await
    }

    fn key_for(&self, req: &http::request::Parts) -> Option<CacheKey> {
        let host = req.uri.host()?;
        let query = if self.cache_by_query {
            req.uri.query().filter(|query| !query.is_empty())
        } else {
            None
        };
        Some(CacheKey::new(
            host,
            req.uri.path(),
            req.method.as_str(),
            query,
        ))
    }

    async fn serve_fresh(&self, key: &CacheKey, head: CacheHead) -> anyhow::Result<ProxyResponse> {
        let stream = match body::from_file(&self.store.body_path(key)).await {
            Ok(stream) => stream,
            // An entry may have a head with no body yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => body::empty(),
            Err(e) => return Err(e).context("failed to open cache body"),
        };
        let mut response = hyper::Response::builder()
            .status(head.status_code)
            .body(stream)?;
        *response.headers_mut() = head.headers;
        // The stored body is identity-framed.
        response
            .headers_mut()
            .remove(http::header::TRANSFER_ENCODING);
        Ok(response)
    }
}

#[async_trait::async_trait]
impl RuleHandler for CacheRule {
    async fn on_request(
        &self,
        seq: u64,
        req: &mut http::request::Parts,
    ) -> anyhow::Result<RuleResult> {
        let Some(key) = self.key_for(req) else {
            return Ok(RuleResult::Passthrough);
        };
        if let Some(head) = self.store.load_head(&key).await
            && head.is_fresh(self.ttl_seconds, epoch_millis())
        {
            tracing::debug!(seq, dir = %self.store.head_path(&key).display(), "cache hit");
            return Ok(RuleResult::Synth(self.serve_fresh(&key, head).await?));
        }
        tracing::debug!(seq, "cache miss");
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, key);
        Ok(RuleResult::Passthrough)
    }

    async fn on_response(&self, seq: u64, res: &mut ProxyResponse) -> anyhow::Result<()> {
        let key = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq);
        let Some(key) = key else {
            return Ok(());
        };

        let head = CacheHead {
            status_code: res.status().as_u16(),
            status_message: res.status().canonical_reason().map(String::from),
            headers: res.headers().clone(),
            update_time: epoch_millis(),
        };
        // The head lands on disk before the first body byte flows.
        self.store.write_head(&key, &head).await?;

        let body_path = self.store.body_path(&key);
        let inner = std::mem::replace(res.body_mut(), body::empty());
        *res.body_mut() = tee_to_file(inner, body_path, move || {
            tracing::debug!(seq, "cache body written");
        });
        Ok(())
    }
}
