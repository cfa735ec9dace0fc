//! End-to-end gateway tests
//!
//! Each test starts the full gateway on ephemeral ports, spins up real hyper
//! backends and drives both listeners over HTTP with reqwest.

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use smartrent_gateway::client::RegistrationClient;
use smartrent_gateway::registry::{Registration, ServiceInstance};
use smartrent_gateway::routing::{Route, RouteConfig, RouteDefaults};
use smartrent_gateway::{Args, Gateway};

/// How a test backend answers
#[derive(Clone, Copy)]
enum Behavior {
    Echo,
    /// Stall the first request, answer later ones immediately
    SlowFirst(Duration),
    /// Stall every request
    Stall(Duration),
    Status(u16),
}

/// `Content-Length` a backend announces for HEAD requests
const HEAD_CONTENT_LENGTH: &str = "1234";

struct Backend {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

async fn spawn_backend(name: &'static str, behavior: Behavior) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        match behavior {
                            Behavior::SlowFirst(delay) if seen == 0 => tokio::time::sleep(delay).await,
                            Behavior::Stall(delay) => tokio::time::sleep(delay).await,
                            _ => {}
                        }
                        if *req.method() == Method::HEAD {
                            let mut response = Response::new(Full::new(Bytes::new()));
                            response
                                .headers_mut()
                                .insert(CONTENT_LENGTH, HeaderValue::from_static(HEAD_CONTENT_LENGTH));
                            return Ok::<_, hyper::Error>(response);
                        }
                        let status = match behavior {
                            Behavior::Status(code) => StatusCode::from_u16(code).unwrap(),
                            _ => StatusCode::OK,
                        };
                        let header = |n: &str| {
                            req.headers()
                                .get(n)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string()
                        };
                        let body = serde_json::json!({
                            "backend": name,
                            "path": req.uri().path_and_query().map(|p| p.as_str()).unwrap_or(""),
                            "forwardedPrefix": header("x-forwarded-prefix"),
                            "forwardedFor": header("x-forwarded-for"),
                        });
                        let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
                        *response.status_mut() = status;
                        Ok::<_, hyper::Error>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Backend { addr, hits }
}

fn args(extra: &[&str]) -> Args {
    let mut argv = vec!["--route", "/users/**=user"];
    argv.extend_from_slice(extra);
    bare_args(&argv)
}

/// Ephemeral listeners and no routes unless `extra` adds some
fn bare_args(extra: &[&str]) -> Args {
    let mut argv = vec![
        "smartrent-gateway",
        "--listen",
        "127.0.0.1:0",
        "--registry-listen",
        "127.0.0.1:0",
    ];
    argv.extend_from_slice(extra);
    Args::try_parse_from(argv).unwrap()
}

fn registration(backend: &Backend, id: &str) -> Registration {
    Registration::new("user", "127.0.0.1", backend.addr.port()).with_instance_id(id)
}

/// Poll `check` until it holds or `timeout` passes
async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn routed_instances(gateway: &Gateway) -> usize {
    gateway
        .state()
        .table
        .load()
        .resolve("/users")
        .map(|entry| entry.instances.len())
        .unwrap_or(0)
}

async fn register_over_http(gateway: &Gateway, registration: &Registration) {
    let response = reqwest::Client::new()
        .post(format!("http://{}/registry/instances", gateway.registry_addr()))
        .json(registration)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_splits_load_evenly() {
    let a = spawn_backend("a", Behavior::Echo).await;
    let b = spawn_backend("b", Behavior::Echo).await;
    let gateway = Gateway::start(args(&[])).await.unwrap();

    register_over_http(&gateway, &registration(&a, "a")).await;
    register_over_http(&gateway, &registration(&b, "b")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 2).await);

    let client = reqwest::Client::new();
    let url = format!("http://{}/users/7", gateway.proxy_addr());
    let requests = (0..100).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move { client.get(url).send().await.unwrap().status() }
    });
    let statuses = futures::future::join_all(requests).await;
    assert!(statuses.iter().all(|s| *s == StatusCode::OK));

    let (hits_a, hits_b) = (a.hits.load(Ordering::SeqCst), b.hits.load(Ordering::SeqCst));
    assert_eq!(hits_a + hits_b, 100);
    assert!((40..=60).contains(&hits_a), "a={} b={}", hits_a, hits_b);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_route_without_instances_is_unavailable() {
    let gateway = Gateway::start(args(&[])).await.unwrap();
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client
            .get(format!("http://{}/users/1", gateway.proxy_addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "NO_HEALTHY_INSTANCE");
    }

    let ready = client
        .get(format!("http://{}/ready", gateway.registry_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_has_no_route() {
    let gateway = Gateway::start(args(&[])).await.unwrap();

    let response = reqwest::get(format!("http://{}/usersettings", gateway.proxy_addr()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "NO_ROUTE_FOUND");
    assert_eq!(body["path"], "/usersettings");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_attempt_is_retried() {
    let slow = spawn_backend("slow", Behavior::SlowFirst(Duration::from_secs(3))).await;
    let gateway = Gateway::start(args(&["--request-timeout-ms", "300", "--default-retries", "1"]))
        .await
        .unwrap();
    register_over_http(&gateway, &registration(&slow, "slow")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 1).await);

    let response = reqwest::get(format!("http://{}/users/1", gateway.proxy_addr()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(slow.hits.load(Ordering::SeqCst), 2);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_retry_moves_to_another_instance() {
    let stalled = spawn_backend("stalled", Behavior::Stall(Duration::from_secs(30))).await;
    let healthy = spawn_backend("healthy", Behavior::Echo).await;
    let gateway = Gateway::start(args(&["--request-timeout-ms", "300", "--default-retries", "1"]))
        .await
        .unwrap();
    // Snapshots are ordered by instance id, so round-robin tries "a-stalled" first
    register_over_http(&gateway, &registration(&stalled, "a-stalled")).await;
    register_over_http(&gateway, &registration(&healthy, "b-healthy")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 2).await);

    let response = reqwest::get(format!("http://{}/users/1", gateway.proxy_addr()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["backend"], "healthy");
    assert_eq!(stalled.hits.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.hits.load(Ordering::SeqCst), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_all_instances_failing_uses_whole_retry_budget() {
    let first = spawn_backend("first", Behavior::Stall(Duration::from_secs(30))).await;
    let second = spawn_backend("second", Behavior::Stall(Duration::from_secs(30))).await;
    let gateway = Gateway::start(args(&["--request-timeout-ms", "200", "--default-retries", "3"]))
        .await
        .unwrap();
    register_over_http(&gateway, &registration(&first, "first")).await;
    register_over_http(&gateway, &registration(&second, "second")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 2).await);

    let response = reqwest::get(format!("http://{}/users/1", gateway.proxy_addr()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "UPSTREAM_UNAVAILABLE");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("after 4 attempt(s)"), "{}", message);

    // Both instances tried before either is reused
    let (hits_first, hits_second) = (first.hits.load(Ordering::SeqCst), second.hits.load(Ordering::SeqCst));
    assert_eq!(hits_first + hits_second, 4);
    assert!(hits_first >= 1 && hits_second >= 1, "first={} second={}", hits_first, hits_second);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_head_response_keeps_content_length() {
    let backend = spawn_backend("echo", Behavior::Echo).await;
    let gateway = Gateway::start(args(&[])).await.unwrap();
    register_over_http(&gateway, &registration(&backend, "echo")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 1).await);

    let response = reqwest::Client::new()
        .head(format!("http://{}/users/1", gateway.proxy_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(CONTENT_LENGTH).unwrap(),
        HEAD_CONTENT_LENGTH
    );

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_start_with_resolved_routes() {
    let backend = spawn_backend("reviews", Behavior::Echo).await;
    let route = Route::from_config(
        &RouteConfig::new("/reviews/**", "review"),
        RouteDefaults::default(),
    )
    .unwrap();
    let gateway = Gateway::start_with_routes(bare_args(&[]), vec![route])
        .await
        .unwrap();

    gateway
        .state()
        .registry
        .register(Registration::new("review", "127.0.0.1", backend.addr.port()))
        .unwrap();
    assert!(
        eventually(Duration::from_secs(2), || {
            gateway
                .state()
                .table
                .load()
                .resolve("/reviews/9")
                .map(|entry| entry.instances.len() == 1)
                .unwrap_or(false)
        })
        .await
    );

    let body: serde_json::Value = reqwest::get(format!("http://{}/reviews/9", gateway.proxy_addr()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["backend"], "reviews");
    assert_eq!(body["path"], "/9");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_prefix_stripped_and_forwarding_headers_set() {
    let backend = spawn_backend("echo", Behavior::Echo).await;
    let gateway = Gateway::start(args(&[])).await.unwrap();
    register_over_http(&gateway, &registration(&backend, "echo")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 1).await);

    let body: serde_json::Value = reqwest::get(format!(
        "http://{}/users/7/reviews?page=2",
        gateway.proxy_addr()
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(body["path"], "/7/reviews?page=2");
    assert_eq!(body["forwardedPrefix"], "/users");
    assert_eq!(body["forwardedFor"], "127.0.0.1");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_upstream_error_status_relayed_without_retry() {
    let failing = spawn_backend("failing", Behavior::Status(500)).await;
    let gateway = Gateway::start(args(&["--default-retries", "3"])).await.unwrap();
    register_over_http(&gateway, &registration(&failing, "failing")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 1).await);

    let response = reqwest::get(format!("http://{}/users/1", gateway.proxy_addr()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["backend"], "failing");
    assert_eq!(failing.hits.load(Ordering::SeqCst), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_silent_instance_evicted_within_staleness_bound() {
    let backend = spawn_backend("quiet", Behavior::Echo).await;
    let gateway = Gateway::start(args(&[
        "--lease-duration-secs",
        "1",
        "--sweep-interval-ms",
        "200",
        "--rebuild-interval-ms",
        "200",
    ]))
    .await
    .unwrap();

    register_over_http(&gateway, &registration(&backend, "quiet")).await;
    assert!(eventually(Duration::from_secs(1), || routed_instances(&gateway) == 1).await);

    // Staleness bound is 1.2s; allow scheduling slack
    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert_eq!(routed_instances(&gateway), 0);
    assert_eq!(gateway.state().registry.instance_count(), 0);

    let response = reqwest::get(format!("http://{}/users/1", gateway.proxy_addr()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_registration_client_lifecycle() {
    let backend = spawn_backend("user-1", Behavior::Echo).await;
    let gateway = Gateway::start(args(&["--lease-duration-secs", "1"])).await.unwrap();

    let client = RegistrationClient::new(
        format!("http://{}", gateway.registry_addr()),
        Registration::new("USER", "127.0.0.1", backend.addr.port()),
    )
    .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat = client.spawn_heartbeat(Duration::from_millis(250), shutdown_rx);

    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 1).await);

    // Renewals keep the instance past several lease periods
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let listed: Vec<ServiceInstance> = reqwest::get(format!(
        "http://{}/registry/services/user",
        gateway.registry_addr()
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].instance_id, client.instance_id());

    shutdown_tx.send(true).unwrap();
    heartbeat.await.unwrap();
    assert!(gateway.state().registry.snapshot("user").is_empty());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_management_endpoints() {
    let backend = spawn_backend("echo", Behavior::Echo).await;
    let gateway = Gateway::start(args(&[])).await.unwrap();
    let base = format!("http://{}", gateway.registry_addr());
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/healthz", base)).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let health: serde_json::Value = health.json().await.unwrap();
    assert_eq!(health["healthy"], true);

    let version: serde_json::Value = client
        .get(format!("{}/version", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["service"], "smartrent-gateway");

    register_over_http(&gateway, &registration(&backend, "echo-1")).await;
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 1).await);

    let ready = client.get(format!("{}/readyz", base)).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let routes: serde_json::Value = client
        .get(format!("{}/routes", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(routes["routes"][0]["prefix"], "/users");
    assert_eq!(routes["routes"][0]["service"], "user");

    let status = client
        .put(format!("{}/registry/instances/user/echo-1/status?value=OUT_OF_SERVICE", base))
        .send()
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);
    assert!(eventually(Duration::from_secs(2), || routed_instances(&gateway) == 0).await);

    let services: serde_json::Value = client
        .get(format!("{}/registry/services", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(services[0]["name"], "user");
    assert_eq!(services[0]["up"], 0);
    assert_eq!(services[0]["total"], 1);

    let removed = client
        .delete(format!("{}/registry/instances/user/echo-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), StatusCode::OK);

    let again = client
        .put(format!("{}/registry/instances/user/echo-1/heartbeat", base))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = again.json().await.unwrap();
    assert_eq!(body["error"], "NOT_FOUND");

    gateway.shutdown().await;
}
