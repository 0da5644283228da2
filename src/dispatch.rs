//! The dispatch engine: every intercepted request, from either listener,
//! lands here. The first matching rule decides the outcome; the engine
//! fetches upstream or synthesizes, then emits with the inspector watching.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use http::HeaderValue;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    UPGRADE,
};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::body::{self, ProxyBody, ProxyResponse};
use crate::error::{ErrorKind, ErrorSink};
use crate::inspector::Inspector;
use crate::rules::{Rule, RuleResult};

type UpstreamClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>;

const ALLOW_ALL: HeaderValue = HeaderValue::from_static("*");

pub(crate) struct Dispatcher {
    rules: Vec<Rule>,
    inspector: Option<Arc<Inspector>>,
    error_sink: ErrorSink,
    client: UpstreamClient,
    seq: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(
        rules: Vec<Rule>,
        inspector: Option<Arc<Inspector>>,
        error_sink: ErrorSink,
    ) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            rules,
            inspector,
            error_sink,
            client: Client::builder(TokioExecutor::new()).build(https),
            seq: AtomicU64::new(0),
        }
    }

    /// Service entry point. A dispatch error tears the client connection
    /// down after one `Forward` notification.
    pub(crate) async fn handle(
        self: Arc<Self>,
        req: hyper::Request<Incoming>,
    ) -> anyhow::Result<ProxyResponse> {
        match self.clone().dispatch(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                (self.error_sink)(ErrorKind::Forward, e);
                Err(anyhow::anyhow!("request dispatch failed"))
            }
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        req: hyper::Request<Incoming>,
    ) -> anyhow::Result<ProxyResponse> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (mut parts, incoming) = req.into_parts();

        if is_websocket_upgrade(&parts.headers) {
            let response = hyper::Response::builder()
                .status(StatusCode::NOT_IMPLEMENTED)
                .body(body::full("websocket upgrades are not supported"))?;
            return Ok(response);
        }

        let match_target = match_target(&parts.uri);
        let rule = self.rules.iter().find(|rule| rule.matches(&match_target));
        tracing::debug!(
            seq,
            match_target,
            rule = rule.and_then(|r| r.name.as_deref()),
            "dispatch"
        );

        // The body is not drained until a destination exists; the inspector
        // tee observes whatever consumer ends up pulling it.
        let mut req_body = body::from_incoming(incoming);
        if let Some(inspector) = &self.inspector {
            inspector.on_request(seq, &parts, rule.and_then(|r| r.name.as_deref()));
            req_body = inspector.tee_request_body(seq, req_body);
        }

        // A matched rule answers preflights as CORS-enabled without invoking
        // its handler.
        if rule.is_some() && parts.method == Method::OPTIONS {
            drain(req_body);
            let response = hyper::Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ALL)
                .header(ACCESS_CONTROL_ALLOW_METHODS, ALLOW_ALL)
                .header(ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_ALL)
                .body(body::empty())?;
            return Ok(self.emit(seq, response));
        }

        // The one coercion point: a failing handler becomes a Fail outcome.
        let result = match rule {
            Some(rule) => match rule.handler.on_request(seq, &mut parts).await {
                Ok(result) => result,
                Err(e) => RuleResult::Fail(e),
            },
            None => RuleResult::Passthrough,
        };

        let response = match result {
            RuleResult::Passthrough => {
                let uri = parts.uri.clone();
                self.fetch(seq, rule, parts, req_body, uri).await?
            }
            RuleResult::Redirect(uri) => self.fetch(seq, rule, parts, req_body, uri).await?,
            RuleResult::Suppress(response) => {
                drain(req_body);
                response
            }
            RuleResult::Synth(mut response) => {
                drain(req_body);
                response
                    .headers_mut()
                    .insert(ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ALL);
                response
            }
            RuleResult::Fail(e) => {
                drain(req_body);
                tracing::warn!(seq, e = e.as_ref() as &dyn std::error::Error, "rule failed");
                hyper::Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .header(ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ALL)
                    .body(body::full(format!("{e:#}")))?
            }
        };

        Ok(self.emit(seq, response))
    }

    /// Fetches `uri` upstream, streaming the request body into it, and runs
    /// the rule's response hook on the result.
    async fn fetch(
        &self,
        seq: u64,
        rule: Option<&Rule>,
        parts: http::request::Parts,
        req_body: ProxyBody,
        uri: http::Uri,
    ) -> anyhow::Result<ProxyResponse> {
        let mut builder = hyper::Request::builder()
            .method(parts.method)
            .uri(uri.clone());
        for (name, value) in &parts.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        let request = builder
            .body(req_body)
            .context("failed to build upstream request")?;

        let upstream = self
            .client
            .request(request)
            .await
            .with_context(|| format!("upstream fetch failed for {uri}"))?;
        let mut response = upstream.map(body::from_incoming);

        if let Some(rule) = rule {
            rule.handler.on_response(seq, &mut response).await?;
        }
        Ok(response)
    }

    /// Final stop before the client: notify the inspector and attach its
    /// response-body tee.
    fn emit(&self, seq: u64, mut response: ProxyResponse) -> ProxyResponse {
        if let Some(inspector) = &self.inspector {
            inspector.on_respond(seq, &response);
            let inner = std::mem::replace(response.body_mut(), body::empty());
            *response.body_mut() = inspector.tee_response_body(seq, inner);
        }
        response
    }
}

/// Rules match against host + path-with-query, scheme excluded.
fn match_target(uri: &http::Uri) -> String {
    let host = uri.host().unwrap_or_default();
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("{host}{path_and_query}")
}

fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
}

/// Synthesized responses never read the request body, but its inspector tee
/// still has to see it through to the end.
fn drain(mut body: ProxyBody) {
    tokio::spawn(async move {
        while let Some(frame) = body.frame().await {
            if frame.is_err() {
                break;
            }
        }
    });
}
