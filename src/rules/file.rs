use std::path::PathBuf;

use anyhow::Context as _;
use hyper::StatusCode;

use super::{RuleHandler, RuleResult};
use crate::body;

/// Serves a matched request from a file on disk, streaming it lazily.
/// A missing file answers 404.
pub struct FileRule {
    path: PathBuf,
}

impl FileRule {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl RuleHandler for FileRule {
    async fn on_request(
        &self,
        _seq: u64,
        _req: &mut http::request::Parts,
    ) -> anyhow::Result<RuleResult> {
        match body::from_file(&self.path).await {
            Ok(stream) => Ok(RuleResult::Synth(hyper::Response::new(stream))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let response = hyper::Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(body::empty())?;
                Ok(RuleResult::Synth(response))
            }
            Err(e) => Err(e).with_context(|| format!("failed to open {}", self.path.display())),
        }
    }
}
