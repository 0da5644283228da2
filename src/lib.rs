//! An intercepting HTTP/HTTPS proxy for local web development. Requests are
//! matched against an ordered rule set; the first match decides whether the
//! request is forwarded, redirected, delayed, answered from static content
//! or a file, or served from an on-disk cache. HTTPS traffic is intercepted
//! by tunneling `CONNECT` streams into an internal TLS listener that mints
//! per-host certificates under a user-supplied root CA.

pub mod body;
mod cache_store;
mod dispatch;
mod error;
mod inspector;
mod mitm_server;
pub mod rules;
mod tee_body;
mod time_util;
mod tls;

pub use cache_store::{CacheHead, CacheKey, CacheStore};
pub use error::{ErrorKind, ErrorSink};
pub use inspector::{Inspector, InspectorConfig};
pub use rules::{Matcher, Rule, RuleHandler, RuleResult};
pub use tls::RootCa;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::level_filters::LevelFilter;

use crate::dispatch::Dispatcher;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Port for the plain listener
    #[arg(long, default_value = "8080")]
    pub port: u16,
    /// A rule in `name|pattern|args` form; repeatable, evaluated in order
    #[arg(long = "rule")]
    pub rules: Vec<String>,
    /// PEM private key of the root CA used for HTTPS interception
    #[arg(long, requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,
    /// PEM certificate of the root CA
    #[arg(long, requires = "ca_key")]
    pub ca_cert: Option<PathBuf>,
    /// Directory for `cache` rules (default: `.cache` next to the binary)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Record a request/response journal and raw bodies
    #[arg(long)]
    pub inspect: bool,
    /// Inspector directory (default: a fresh temp dir; implies --inspect)
    #[arg(long)]
    pub inspect_dir: Option<PathBuf>,
    /// Keep the inspector temp dir after exit
    #[arg(long)]
    pub keep: bool,
}

enum RootCaSource {
    Loaded(RootCa),
    Files { key: PathBuf, cert: PathBuf },
}

/// The embedder-facing proxy builder.
pub struct Proxy {
    port: u16,
    rules: Vec<Rule>,
    root_ca: Option<RootCaSource>,
    inspector: Option<Arc<Inspector>>,
    error_sink: ErrorSink,
    cache_dir: Option<PathBuf>,
}

impl Proxy {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            rules: Vec::new(),
            root_ca: None,
            inspector: None,
            error_sink: error::log_sink(),
            cache_dir: None,
        }
    }

    /// Registers a `name|pattern|args` rule string. Evaluation order is
    /// registration order; set the cache directory before adding `cache`
    /// rules.
    pub fn add_rule(&mut self, spec: &str) -> anyhow::Result<&mut Self> {
        let rule = rules::parse_rule(spec, self.cache_dir.as_deref())?;
        self.rules.push(rule);
        Ok(self)
    }

    /// Registers a rule with a custom handler; same hook shape as the
    /// built-ins.
    pub fn add_custom_rule(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn with_cache_dir(&mut self, dir: PathBuf) -> &mut Self {
        self.cache_dir = Some(dir);
        self
    }

    /// An already-loaded root CA enables HTTPS interception.
    pub fn with_root_ca(&mut self, ca: RootCa) -> &mut Self {
        self.root_ca = Some(RootCaSource::Loaded(ca));
        self
    }

    /// Root CA as PEM file paths, read at serve time. Unreadable or invalid
    /// files fail only the TLS listener bring-up; plain proxying continues.
    pub fn with_root_ca_files(&mut self, key: PathBuf, cert: PathBuf) -> &mut Self {
        self.root_ca = Some(RootCaSource::Files { key, cert });
        self
    }

    /// Supplies an already-constructed inspector.
    pub fn with_inspector(&mut self, inspector: Inspector) -> &mut Self {
        self.inspector = Some(Arc::new(inspector));
        self
    }

    /// Has the proxy construct an inspector from config.
    pub fn with_inspector_config(&mut self, config: InspectorConfig) -> anyhow::Result<&mut Self> {
        self.inspector = Some(Arc::new(Inspector::new(config)?));
        Ok(self)
    }

    pub fn with_error_sink(&mut self, sink: ErrorSink) -> &mut Self {
        self.error_sink = sink;
        self
    }

    /// Binds the listeners and serves until the task is dropped.
    /// `server_started` fires with the plain listener's address.
    pub async fn serve(self, server_started: oneshot::Sender<SocketAddr>) -> anyhow::Result<()> {
        let _ = rustls::crypto::ring::default_provider()
            .install_default()
            .inspect_err(|e| tracing::debug!("rustls ring provider already installed: {e:?}"));

        let dispatcher = Arc::new(Dispatcher::new(
            self.rules,
            self.inspector,
            self.error_sink.clone(),
        ));

        let tls_addr = match self.root_ca {
            Some(source) => {
                match load_root_ca(source) {
                    Ok(ca) => {
                        match mitm_server::spawn_tls_listener(
                            Arc::new(ca),
                            dispatcher.clone(),
                            self.error_sink.clone(),
                        )
                        .await
                        {
                            Ok(addr) => Some(addr),
                            Err(e) => {
                                (self.error_sink)(ErrorKind::Https, e);
                                None
                            }
                        }
                    }
                    // Interception stays off; the plain listener continues.
                    Err(e) => {
                        (self.error_sink)(ErrorKind::Https, e);
                        None
                    }
                }
            }
            None => None,
        };

        mitm_server::run_plain_listener(
            self.port,
            dispatcher,
            tls_addr,
            self.error_sink,
            server_started,
        )
        .await
    }
}

fn load_root_ca(source: RootCaSource) -> anyhow::Result<RootCa> {
    match source {
        RootCaSource::Loaded(ca) => Ok(ca),
        RootCaSource::Files { key, cert } => {
            let key_pem = std::fs::read_to_string(&key)
                .with_context(|| format!("failed to read CA key {}", key.display()))?;
            let cert_pem = std::fs::read_to_string(&cert)
                .with_context(|| format!("failed to read CA cert {}", cert.display()))?;
            RootCa::load(&key_pem, &cert_pem)
        }
    }
}

/// CLI entry point: builds a [`Proxy`] from `args` and serves it.
pub async fn run_server(
    args: Args,
    server_started: oneshot::Sender<SocketAddr>,
) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init();

    let mut proxy = Proxy::new(args.port);
    if let Some(dir) = args.cache_dir {
        proxy.with_cache_dir(dir);
    }
    for spec in &args.rules {
        proxy.add_rule(spec)?;
    }
    if let (Some(key), Some(cert)) = (args.ca_key, args.ca_cert) {
        proxy.with_root_ca_files(key, cert);
    }
    if args.inspect || args.inspect_dir.is_some() {
        proxy.with_inspector_config(InspectorConfig {
            dir: args.inspect_dir,
            keep: args.keep,
        })?;
    }
    proxy.serve(server_started).await
}
