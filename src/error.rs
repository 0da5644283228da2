use std::sync::Arc;

/// Where in the proxy an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The plain listener failed to bind or emitted an error.
    Http,
    /// The internal TLS listener errored.
    Https,
    /// The CONNECT bridge hit a non-benign socket error.
    Connect,
    /// Upstream fetch, response emission, or a rule handler failed.
    Forward,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Http => "http",
            ErrorKind::Https => "https",
            ErrorKind::Connect => "connect",
            ErrorKind::Forward => "forward",
        };
        f.write_str(name)
    }
}

/// Callback receiving every error the proxy surfaces to its embedder.
pub type ErrorSink = Arc<dyn Fn(ErrorKind, anyhow::Error) + Send + Sync>;

pub(crate) fn log_sink() -> ErrorSink {
    Arc::new(|kind, e| {
        tracing::error!(
            kind = %kind,
            e = e.as_ref() as &dyn std::error::Error,
            "proxy error"
        );
    })
}

/// Connection resets and broken pipes during tunnel teardown are expected
/// and never reported.
pub(crate) fn is_benign_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    )
}
