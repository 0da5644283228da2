//! The inspector observes every intercepted request: metadata goes into a
//! journal at `index.json`, raw bodies are appended to `<seq>.req` and
//! `<seq>.res` files as they flow.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;

use crate::body::{ProxyBody, ProxyResponse};
use crate::tee_body::tee_to_file;

/// Journal writes are deferred this long; a burst of updates produces one
/// flush, not many.
const FLUSH_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Default)]
pub struct InspectorConfig {
    /// Where to write. `None` means a fresh temp directory.
    pub dir: Option<PathBuf>,
    /// Retain the temp directory after exit.
    pub keep: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestMeta {
    url: String,
    method: String,
    version: String,
    #[serde(with = "http_serde_ext::header_map")]
    headers: http::HeaderMap,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseMeta {
    status: u16,
    status_message: Option<String>,
    #[serde(with = "http_serde_ext::header_map")]
    headers: http::HeaderMap,
}

#[derive(Debug, Clone, Serialize)]
struct Entry {
    seq: u64,
    req: RequestMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    res: Option<ResponseMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<String>,
}

pub struct Inspector {
    root: PathBuf,
    entries: Mutex<BTreeMap<u64, Entry>>,
    flush_pending: AtomicBool,
    // Keeps the temp directory alive (and deleted on drop) when no
    // directory was supplied and `keep` is off.
    _scratch: Option<tempfile::TempDir>,
}

impl Inspector {
    pub fn new(config: InspectorConfig) -> anyhow::Result<Self> {
        let (root, scratch) = match config.dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir).with_context(|| {
                    format!("failed to create inspector dir {}", dir.display())
                })?;
                (dir, None)
            }
            None => {
                let tmp = tempfile::TempDir::new().context("failed to create inspector dir")?;
                if config.keep {
                    (tmp.keep(), None)
                } else {
                    (tmp.path().to_path_buf(), Some(tmp))
                }
            }
        };
        tracing::info!(dir = %root.display(), "inspector recording");
        Ok(Self {
            root,
            entries: Mutex::new(BTreeMap::new()),
            flush_pending: AtomicBool::new(false),
            _scratch: scratch,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub(crate) fn on_request(
        self: &Arc<Self>,
        seq: u64,
        req: &http::request::Parts,
        rule: Option<&str>,
    ) {
        let entry = Entry {
            seq,
            req: RequestMeta {
                url: req.uri.to_string(),
                method: req.method.to_string(),
                version: format!("{:?}", req.version),
                headers: req.headers.clone(),
            },
            res: None,
            rule: rule.map(String::from),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, entry);
        self.schedule_flush();
    }

    pub(crate) fn on_respond(self: &Arc<Self>, seq: u64, res: &ProxyResponse) {
        let meta = ResponseMeta {
            status: res.status().as_u16(),
            status_message: res.status().canonical_reason().map(String::from),
            headers: res.headers().clone(),
        };
        if let Some(entry) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&seq)
        {
            entry.res = Some(meta);
        }
        self.schedule_flush();
    }

    pub(crate) fn tee_request_body(self: &Arc<Self>, seq: u64, body: ProxyBody) -> ProxyBody {
        let inspector = self.clone();
        tee_to_file(body, self.root.join(format!("{seq}.req")), move || {
            inspector.on_request_end(seq);
        })
    }

    pub(crate) fn tee_response_body(self: &Arc<Self>, seq: u64, body: ProxyBody) -> ProxyBody {
        let inspector = self.clone();
        tee_to_file(body, self.root.join(format!("{seq}.res")), move || {
            inspector.on_response_end(seq);
        })
    }

    fn on_request_end(&self, seq: u64) {
        tracing::debug!(seq, "request body recorded");
    }

    fn on_response_end(&self, seq: u64) {
        tracing::debug!(seq, "response body recorded");
    }

    /// Arms a single deferred flush; updates landing while one is armed ride
    /// the same write.
    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let inspector = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DELAY).await;
            inspector.flush_pending.store(false, Ordering::Release);
            if let Err(e) = inspector.write_index().await {
                tracing::warn!(
                    e = e.as_ref() as &dyn std::error::Error,
                    "failed to write inspector index"
                );
            }
        });
    }

    /// Serializes the journal as an array indexed by `seq` (index 0 is
    /// always null; `seq` starts at 1).
    pub(crate) async fn write_index(&self) -> anyhow::Result<()> {
        let json = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let len = entries.keys().next_back().map_or(0, |max| max + 1);
            let mut journal: Vec<Option<&Entry>> = vec![None; len as usize];
            for (seq, entry) in &*entries {
                journal[*seq as usize] = Some(entry);
            }
            serde_json::to_vec(&journal).context("failed to serialize inspector journal")?
        };
        let path = self.root.join("index.json");
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
