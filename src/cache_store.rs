//! Content-addressed on-disk store of response head + body pairs.
//!
//! Layout: `<root>/<host><path>/<METHOD>[.<md5(query)>].head` and `…body`.
//! The head file is a JSON object with `statusCode`, `statusMessage`,
//! `headers` and `updateTime` (epoch ms); the body file holds the raw
//! response bytes. Nothing here creates the root directory eagerly; the
//! first write does.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Identifies one entry on disk. The query string participates only when the
/// owning rule asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    entry_dir: String,
    file_base: String,
}

impl CacheKey {
    pub fn new(host: &str, path: &str, method: &str, query: Option<&str>) -> Self {
        let file_base = match query {
            Some(query) => format!("{method}.{}", hex::encode(md5::compute(query).0)),
            None => method.to_string(),
        };
        Self {
            entry_dir: format!("{host}{path}"),
            file_base,
        }
    }
}

/// The JSON head artifact of a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHead {
    pub status_code: u16,
    pub status_message: Option<String>,
    #[serde(with = "http_serde_ext::header_map")]
    pub headers: HeaderMap,
    /// Wall-clock write time, epoch ms.
    pub update_time: u64,
}

impl CacheHead {
    /// Fresh iff `update_time + ttl*1000 >= now`, or no `ttl` at all.
    pub fn is_fresh(&self, ttl_seconds: Option<u64>, now_ms: u64) -> bool {
        match ttl_seconds {
            None => true,
            Some(ttl) => self.update_time + ttl * 1000 >= now_ms,
        }
    }
}

pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// `root` defaults to a `.cache` directory next to the executable. The
    /// directory is not created here.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: root.unwrap_or_else(default_cache_dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.entry_dir)
    }

    pub fn head_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(format!("{}.head", key.file_base))
    }

    pub fn body_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(format!("{}.body", key.file_base))
    }

    /// Loads the head artifact. A missing or unreadable head is a miss, never
    /// an error; a corrupt head is overwritten by the next write.
    pub async fn load_head(&self, key: &CacheKey) -> Option<CacheHead> {
        let path = self.head_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), e = %e, "failed to read cache head");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(head) => Some(head),
            Err(e) => {
                tracing::warn!(path = %path.display(), e = %e, "corrupt cache head");
                None
            }
        }
    }

    /// Writes the head artifact, creating the entry directory if absent.
    pub async fn write_head(&self, key: &CacheKey, head: &CacheHead) -> anyhow::Result<()> {
        let dir = self.entry_dir(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache entry dir {}", dir.display()))?;
        let json = serde_json::to_vec(head).context("failed to serialize cache head")?;
        let path = self.head_path(key);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write cache head {}", path.display()))?;
        Ok(())
    }

    /// Removes the whole cache directory. Idempotent.
    pub async fn clear(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to clear cache {}", self.root.display()))
            }
        }
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
}
