#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, options};
use dev_proxy::{Args, Matcher, Proxy, Rule, RuleHandler, RuleResult, run_server};
use rand::Rng;
use tokio::sync::oneshot;

async fn start_target_server() -> SocketAddr {
    let app = Router::new()
        .route("/hello-upstream", get(|| async { "upstream says hi" }))
        .route(
            "/unique",
            get(|| async { format!("unique {}", rand::rng().random::<u64>()) }),
        )
        .route(
            "/v2/",
            get(|headers: HeaderMap| async move {
                headers
                    .get("host")
                    .and_then(|host| host.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        )
        .route("/preflight", options(|| async { "upstream options" }))
        .route("/slow-ok", get(|| async { "done" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());
    addr
}

fn args(rules: Vec<String>) -> Args {
    Args {
        port: 0,
        rules,
        ca_key: None,
        ca_cert: None,
        cache_dir: None,
        inspect: false,
        inspect_dir: None,
        keep: false,
    }
}

async fn start_proxy(args: Args) -> SocketAddr {
    let (server_started_tx, server_started_rx) = oneshot::channel();
    tokio::spawn(run_server(args, server_started_tx));
    server_started_rx.await.unwrap()
}

fn proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

/// A throwaway root CA as `(key_pem, cert_pem)`.
fn generate_ca_pem() -> (String, String) {
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String("dev-proxy e2e CA".to_string()),
    );
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    (key_pair.serialize_pem(), cert.pem())
}

async fn wait_for_file_content(path: &Path, expected: &[u8]) {
    for _ in 0..100 {
        if tokio::fs::read(path)
            .await
            .is_ok_and(|bytes| bytes == expected)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "file {} never reached the expected content",
        path.display()
    );
}

#[tokio::test]
async fn test_content_rule_synthesizes() {
    let proxy_addr = start_proxy(args(vec!["content|/hello|world".to_string()])).await;
    let client = proxied_client(proxy_addr);

    let response = client
        .get("http://anything.test/hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    assert_eq!(response.text().await.unwrap(), "world");
}

#[tokio::test]
async fn test_unmatched_request_is_forwarded_unchanged() {
    let target_addr = start_target_server().await;
    let proxy_addr = start_proxy(args(vec!["content|/hello|world".to_string()])).await;
    let client = proxied_client(proxy_addr);

    let response = client
        .get(format!("http://{target_addr}/hello-upstream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(
        response
            .headers()
            .get("access-control-allow-origin")
            .is_none(),
        "passthrough responses are not decorated"
    );
    assert_eq!(response.text().await.unwrap(), "upstream says hi");
}

#[tokio::test]
async fn test_delay_rule_holds_the_request() {
    let target_addr = start_target_server().await;
    let proxy_addr = start_proxy(args(vec!["delay|(.*)|500".to_string()])).await;
    let client = proxied_client(proxy_addr);

    let before = Instant::now();
    let response = client
        .get(format!("http://{target_addr}/slow-ok"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "done");
    assert!(
        before.elapsed() >= Duration::from_millis(500),
        "upstream was reached after only {:?}",
        before.elapsed()
    );
}

#[tokio::test]
async fn test_file_rule_serves_and_404s() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("b.js");
    tokio::fs::write(&script, b"console.log(1)").await.unwrap();

    let proxy_addr = start_proxy(args(vec![
        "file|/a.js|/definitely/missing".to_string(),
        format!("file|/b.js|{}", script.display()),
    ]))
    .await;
    let client = proxied_client(proxy_addr);

    let missing = client.get("http://x.test/a.js").send().await.unwrap();
    assert_eq!(missing.status(), 404);

    let served = client.get("http://x.test/b.js").send().await.unwrap();
    assert_eq!(served.status(), 200);
    assert_eq!(served.bytes().await.unwrap().as_ref(), b"console.log(1)");
}

#[tokio::test]
async fn test_forward_rule_rewrites_target_and_host() {
    let target_addr = start_target_server().await;
    let proxy_addr = start_proxy(args(vec![format!(
        "forward|/api/*|http://{target_addr}/v2/"
    )]))
    .await;
    let client = proxied_client(proxy_addr);

    // The upstream /v2/ handler echoes the Host header it saw.
    let response = client.get("http://x.test/api/u").send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), target_addr.to_string());
}

#[tokio::test]
async fn test_cache_rule_round_trip() {
    let target_addr = start_target_server().await;
    let cache_dir = tempfile::tempdir().unwrap();
    let mut proxy_args = args(vec!["cache|/unique|300".to_string()]);
    proxy_args.cache_dir = Some(cache_dir.path().to_path_buf());
    let proxy_addr = start_proxy(proxy_args).await;
    let client = proxied_client(proxy_addr);

    let url = format!("http://{target_addr}/unique");
    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), 200);
    let first_body = first.bytes().await.unwrap();

    // Wait for the cache writer to finish both artifacts.
    let entry_dir = cache_dir.path().join("127.0.0.1/unique");
    wait_for_file_content(&entry_dir.join("GET.body"), &first_body).await;
    assert!(entry_dir.join("GET.head").exists());

    // Served from disk: upstream would have produced a different body.
    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.bytes().await.unwrap(), first_body);
}

#[tokio::test]
async fn test_cache_ttl_expiry_refetches() {
    let target_addr = start_target_server().await;
    let cache_dir = tempfile::tempdir().unwrap();
    let mut proxy_args = args(vec!["cache|/unique|1".to_string()]);
    proxy_args.cache_dir = Some(cache_dir.path().to_path_buf());
    let proxy_addr = start_proxy(proxy_args).await;
    let client = proxied_client(proxy_addr);

    let url = format!("http://{target_addr}/unique");
    let first_body = client
        .get(&url)
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    wait_for_file_content(
        &cache_dir.path().join("127.0.0.1/unique/GET.body"),
        &first_body,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(1300)).await;
    let second_body = client
        .get(&url)
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_ne!(second_body, first_body, "a stale entry must be re-fetched");
}

#[tokio::test]
async fn test_query_string_does_not_split_the_cache_by_default() {
    let target_addr = start_target_server().await;
    let cache_dir = tempfile::tempdir().unwrap();
    let mut proxy_args = args(vec!["cache|/unique|300".to_string()]);
    proxy_args.cache_dir = Some(cache_dir.path().to_path_buf());
    let proxy_addr = start_proxy(proxy_args).await;
    let client = proxied_client(proxy_addr);

    let first_body = client
        .get(format!("http://{target_addr}/unique?v=1"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    wait_for_file_content(
        &cache_dir.path().join("127.0.0.1/unique/GET.body"),
        &first_body,
    )
    .await;

    // A different query hits the same entry.
    let second_body = client
        .get(format!("http://{target_addr}/unique?v=2"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(second_body, first_body);
}

#[tokio::test]
async fn test_options_preflight() {
    let target_addr = start_target_server().await;
    let proxy_addr = start_proxy(args(vec!["content|/hello|world".to_string()])).await;
    let client = proxied_client(proxy_addr);

    // A matched rule answers preflights without invoking its handler.
    let preflight = client
        .request(reqwest::Method::OPTIONS, "http://x.test/hello")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 204);
    assert_eq!(
        preflight
            .headers()
            .get("access-control-allow-methods")
            .unwrap(),
        "*"
    );

    // Unmatched OPTIONS takes the normal forwarding path.
    let forwarded = client
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{target_addr}/preflight"),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(forwarded.status(), 200);
    assert_eq!(forwarded.text().await.unwrap(), "upstream options");
}

#[tokio::test]
async fn test_https_interception_with_minted_certs() {
    let dir = tempfile::tempdir().unwrap();
    let (key_pem, cert_pem) = generate_ca_pem();
    let key_path = dir.path().join("ca.key.pem");
    let cert_path = dir.path().join("ca.cert.pem");
    tokio::fs::write(&key_path, key_pem).await.unwrap();
    tokio::fs::write(&cert_path, cert_pem).await.unwrap();

    let mut proxy_args = args(vec!["content|/hello|world".to_string()]);
    proxy_args.ca_key = Some(key_path);
    proxy_args.ca_cert = Some(cert_path);
    let proxy_addr = start_proxy(proxy_args).await;
    let client = proxied_client(proxy_addr);

    // CONNECT, TLS handshake against a minted leaf, then the same rule
    // engine answers the decrypted request.
    let response = client
        .get("https://intercepted.test/hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "world");
}

#[tokio::test]
async fn test_connect_is_refused_without_a_ca() {
    let proxy_addr = start_proxy(args(vec!["content|/hello|world".to_string()])).await;
    let client = proxied_client(proxy_addr);

    let result = client.get("https://intercepted.test/hello").send().await;
    assert!(result.is_err(), "CONNECT must be refused without a root CA");
}

#[tokio::test]
async fn test_unreachable_upstream_destroys_the_connection() {
    // Grab an address nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let proxy_addr = start_proxy(args(vec![])).await;
    let client = proxied_client(proxy_addr);

    let result = client
        .get(format!("http://{dead_addr}/hello-upstream"))
        .send()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_custom_rule_suppress_is_emitted_verbatim() {
    struct StampRule;

    #[async_trait::async_trait]
    impl RuleHandler for StampRule {
        async fn on_request(
            &self,
            _seq: u64,
            _req: &mut http::request::Parts,
        ) -> anyhow::Result<RuleResult> {
            let response = http::Response::builder()
                .status(418)
                .header("x-stamp", "custom")
                .body(dev_proxy::body::full("stamped"))?;
            Ok(RuleResult::Suppress(response))
        }
    }

    let mut proxy = Proxy::new(0);
    proxy.add_custom_rule(Rule::new(
        Some("stamp".to_string()),
        Matcher::compile("/stamped").unwrap(),
        std::sync::Arc::new(StampRule),
    ));
    let (server_started_tx, server_started_rx) = oneshot::channel();
    tokio::spawn(proxy.serve(server_started_tx));
    let proxy_addr = server_started_rx.await.unwrap();
    let client = proxied_client(proxy_addr);

    let response = client.get("http://x.test/stamped").send().await.unwrap();
    assert_eq!(response.status(), 418);
    assert_eq!(response.headers().get("x-stamp").unwrap(), "custom");
    assert!(
        response
            .headers()
            .get("access-control-allow-origin")
            .is_none(),
        "suppressed responses are not decorated"
    );
    assert_eq!(response.text().await.unwrap(), "stamped");
}

#[tokio::test]
async fn test_inspector_journals_requests_and_bodies() {
    let target_addr = start_target_server().await;
    let inspect_dir = tempfile::tempdir().unwrap();
    let mut proxy_args = args(vec!["content|/hello|world".to_string()]);
    proxy_args.inspect_dir = Some(inspect_dir.path().to_path_buf());
    let proxy_addr = start_proxy(proxy_args).await;
    let client = proxied_client(proxy_addr);

    let synth = client.get("http://x.test/hello").send().await.unwrap();
    assert_eq!(synth.text().await.unwrap(), "world");
    let forwarded = client
        .get(format!("http://{target_addr}/hello-upstream"))
        .send()
        .await
        .unwrap();
    assert_eq!(forwarded.text().await.unwrap(), "upstream says hi");

    // Raw bodies land as the streams finish.
    wait_for_file_content(&inspect_dir.path().join("1.res"), b"world").await;
    wait_for_file_content(&inspect_dir.path().join("2.res"), b"upstream says hi").await;

    // The journal flush is coalesced; give it its 2s window.
    tokio::time::sleep(Duration::from_millis(2600)).await;
    let raw = tokio::fs::read(inspect_dir.path().join("index.json"))
        .await
        .unwrap();
    let journal: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    let journal = journal.as_array().unwrap();
    assert_eq!(journal.len(), 3);
    assert!(journal[0].is_null());
    assert_eq!(journal[1]["rule"], "content");
    assert_eq!(journal[1]["req"]["method"], "GET");
    assert_eq!(journal[1]["res"]["status"], 200);
    assert_eq!(
        journal[2]["req"]["url"],
        format!("http://{target_addr}/hello-upstream")
    );
}

#[tokio::test]
async fn test_rule_order_first_match_wins() {
    let proxy_addr = start_proxy(args(vec![
        "content|/hello|first".to_string(),
        "content|/hello|second".to_string(),
    ]))
    .await;
    let client = proxied_client(proxy_addr);

    let response = client.get("http://x.test/hello").send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "first");
}
