//! The listener pair. A plain listener on the configured port serves proxy
//! requests directly; `CONNECT` traffic is spliced over raw TCP into an
//! internal TLS listener on an ephemeral localhost port, which terminates
//! TLS with minted certificates and feeds the same dispatch engine.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use http::uri::{Authority, PathAndQuery, Scheme};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

use crate::body::{self, ProxyResponse};
use crate::dispatch::Dispatcher;
use crate::error::{ErrorKind, ErrorSink, is_benign_disconnect};
use crate::tls::{self, RootCa};

/// Runs the plain listener until the process exits. `server_started` fires
/// with the bound address once accepting.
pub(crate) async fn run_plain_listener(
    port: u16,
    dispatcher: Arc<Dispatcher>,
    tls_addr: Option<SocketAddr>,
    error_sink: ErrorSink,
    server_started: oneshot::Sender<SocketAddr>,
) -> anyhow::Result<()> {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            (error_sink)(
                ErrorKind::Http,
                anyhow::Error::from(e).context(format!("failed to bind port {port}")),
            );
            anyhow::bail!("failed to bind port {port}");
        }
    };
    let addr = listener.local_addr().context("failed to read local addr")?;
    tracing::info!(%addr, ?tls_addr, "proxy is listening on http://{addr}");
    let _ = server_started.send(addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                (error_sink)(
                    ErrorKind::Http,
                    anyhow::Error::from(e).context("plain listener accept failed"),
                );
                continue;
            }
        };
        let dispatcher = dispatcher.clone();
        let error_sink = error_sink.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                handle_plain(req, dispatcher.clone(), tls_addr, error_sink.clone())
            });
            let connection = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            if let Err(e) = connection.await {
                tracing::debug!(e = %e, "plain connection ended");
            }
        });
    }
}

async fn handle_plain(
    req: hyper::Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    tls_addr: Option<SocketAddr>,
    error_sink: ErrorSink,
) -> anyhow::Result<ProxyResponse> {
    if req.method() == Method::CONNECT {
        return handle_connect(req, tls_addr, error_sink);
    }
    let req = ensure_absolute(req, Scheme::HTTP, None)?;
    dispatcher.handle(req).await
}

/// Answers a `CONNECT` and splices the upgraded stream into the internal
/// TLS listener. Without one, refuses.
fn handle_connect(
    mut req: hyper::Request<Incoming>,
    tls_addr: Option<SocketAddr>,
    error_sink: ErrorSink,
) -> anyhow::Result<ProxyResponse> {
    let Some(tls_addr) = tls_addr else {
        let response = hyper::Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(body::full("https proxy not enabled!"))?;
        return Ok(response);
    };
    let authority = req
        .uri()
        .authority()
        .map(Authority::to_string)
        .unwrap_or_default();

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                // Any handshake bytes the client sent early sit in hyper's
                // rewind buffer and replay through the upgraded stream.
                let mut client = TokioIo::new(upgraded);
                let mut server = match TcpStream::connect(tls_addr).await {
                    Ok(server) => server,
                    Err(e) => {
                        (error_sink)(
                            ErrorKind::Connect,
                            anyhow::Error::from(e)
                                .context("failed to reach the internal TLS listener"),
                        );
                        return;
                    }
                };
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut server).await
                    && !is_benign_disconnect(&e)
                {
                    (error_sink)(
                        ErrorKind::Connect,
                        anyhow::Error::from(e).context(format!("CONNECT bridge to {authority} failed")),
                    );
                }
            }
            Err(e) => {
                (error_sink)(
                    ErrorKind::Connect,
                    anyhow::Error::from(e).context("CONNECT upgrade failed"),
                );
            }
        }
    });

    // hyper writes the 200 status line; the tunnel starts on upgrade.
    Ok(ProxyResponse::new(body::empty()))
}

/// Binds the internal TLS listener and spawns its accept loop, returning the
/// ephemeral address the CONNECT bridge dials.
pub(crate) async fn spawn_tls_listener(
    ca: Arc<RootCa>,
    dispatcher: Arc<Dispatcher>,
    error_sink: ErrorSink,
) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind the internal TLS listener")?;
    let addr = listener
        .local_addr()
        .context("failed to read the internal TLS listener addr")?;
    let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(ca)));
    tracing::debug!(%addr, "internal TLS listener up");

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    (error_sink)(
                        ErrorKind::Https,
                        anyhow::Error::from(e).context("internal TLS accept failed"),
                    );
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let dispatcher = dispatcher.clone();
            let error_sink = error_sink.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        (error_sink)(
                            ErrorKind::Https,
                            anyhow::Error::from(e).context("TLS handshake failed"),
                        );
                        return;
                    }
                };
                let sni = tls_stream
                    .get_ref()
                    .1
                    .server_name()
                    .map(|name| name.to_string());
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    let sni = sni.clone();
                    async move {
                        let req = ensure_absolute(req, Scheme::HTTPS, sni.as_deref())?;
                        dispatcher.handle(req).await
                    }
                });
                let connection = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls_stream), service);
                if let Err(e) = connection.await {
                    tracing::debug!(e = %e, "tls connection ended");
                }
            });
        }
    });

    Ok(addr)
}

/// Rewrites an origin-form request URI to absolute form so the dispatch
/// engine always sees scheme and authority. Proxy clients already send
/// absolute form on the plain listener; tunneled requests get the scheme
/// and the `Host` header (falling back to the handshake SNI name).
fn ensure_absolute(
    req: hyper::Request<Incoming>,
    scheme: Scheme,
    fallback_host: Option<&str>,
) -> anyhow::Result<hyper::Request<Incoming>> {
    if req.uri().authority().is_some() {
        return Ok(req);
    }
    let (mut parts, incoming) = req.into_parts();
    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or(fallback_host)
        .context("request has neither a Host header nor an SNI name")?;
    let authority: Authority = host.parse().context("invalid Host header")?;

    let mut uri = parts.uri.into_parts();
    uri.scheme = Some(scheme);
    uri.authority = Some(authority);
    if uri.path_and_query.is_none() {
        uri.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = http::Uri::from_parts(uri).context("failed to rebuild request URI")?;
    Ok(hyper::Request::from_parts(parts, incoming))
}
