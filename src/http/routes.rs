// src/http/routes.rs
//! Request routing and handlers

use crate::benchmark::BenchmarkRequest;
use crate::http::AppState;
use crate::ingress::{LoginRequest, RegisterRequest};
use crate::observability::PROMETHEUS_CONTENT_TYPE;
use crate::producer::{targets_from_hint, ROUTING_HINT_HEADER};
use crate::event::RoutingTarget;
use crate::utils::errors::{PipelineError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt::Display;
use tracing::{debug, error};

const JSON_CONTENT_TYPE: &str = "application/json";

const DEFAULT_PAGE_SIZE: usize = 50;

/// Dispatch one request
pub async fn route<B>(state: &AppState, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let targets = targets_from_hint(
        req.headers()
            .get(ROUTING_HINT_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    debug!("{} {}", method, path);

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let result = match (&method, segments.as_slice()) {
        (&Method::GET, []) => Ok(index(state)),
        (&Method::GET, ["health"]) => Ok(health(state).await),
        (&Method::GET, ["metrics"]) => metrics(state),
        (&Method::GET, ["metrics", "prometheus"]) => prometheus(state),
        (&Method::GET, ["metrics", sink]) => sink_metrics(state, sink),
        (&Method::POST, ["benchmark-results", "run"]) => run_benchmark(state, req).await,
        (&Method::GET, ["benchmark-results"]) => list_benchmarks(state, &query).await,
        (&Method::GET, ["benchmark-results", id]) => get_benchmark(state, id).await,
        (&Method::POST, ["auth", "register-user"]) => register(state, req, &targets).await,
        (&Method::POST, ["auth", "login"]) => login(state, req, &targets).await,
        _ => Err(PipelineError::NotFound(format!("{} {}", method, path))),
    };

    result.unwrap_or_else(|e| error_response(&e))
}

fn index(state: &AppState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "service": state.service,
            "version": crate::VERSION,
            "sinks": state.metrics.keys().collect::<Vec<_>>(),
            "ingress": state.auth.is_some(),
            "benchmark": state.benchmark.is_some(),
        }),
    )
}

async fn health(state: &AppState) -> Response<Full<Bytes>> {
    let mut failure = None;
    for sink in &state.sinks {
        if let Err(e) = sink.ping().await {
            failure = Some(format!("{}: {}", sink.target(), e));
            break;
        }
    }
    if failure.is_none() {
        if let Some(benchmark) = &state.benchmark {
            if let Err(e) = benchmark.store().ping().await {
                failure = Some(format!("benchmark store: {}", e));
            }
        }
    }

    match failure {
        None => json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "service": state.service,
                "store": if state.sinks.is_empty() { "none" } else { "connected" },
                "timestamp": chrono::Utc::now(),
            }),
        ),
        Some(e) => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({
                "status": "error",
                "service": state.service,
                "store": "disconnected",
                "error": e,
            }),
        ),
    }
}

/// The hosted consumer's snapshot, or all of them keyed by sink when the
/// process hosts both
fn metrics(state: &AppState) -> Result<Response<Full<Bytes>>> {
    let mut snapshots = state.metrics.iter();
    match (snapshots.next(), snapshots.next()) {
        (None, _) => Err(PipelineError::NotFound("no consumer in this process".into())),
        (Some((_, only)), None) => Ok(json_response(StatusCode::OK, &only.snapshot())),
        _ => {
            let all: Map<String, Value> = state
                .metrics
                .iter()
                .map(|(target, m)| {
                    (
                        target.to_string(),
                        serde_json::to_value(m.snapshot()).unwrap_or(Value::Null),
                    )
                })
                .collect();
            Ok(json_response(StatusCode::OK, &all))
        }
    }
}

fn sink_metrics(state: &AppState, sink: &str) -> Result<Response<Full<Bytes>>> {
    let not_hosted = || PipelineError::NotFound(format!("consumer {}", sink));
    let target: RoutingTarget = sink.parse().map_err(|_| not_hosted())?;
    let metrics = state.metrics.get(&target).ok_or_else(not_hosted)?;
    Ok(json_response(StatusCode::OK, &metrics.snapshot()))
}

fn prometheus(state: &AppState) -> Result<Response<Full<Bytes>>> {
    let handle = state
        .prometheus
        .as_ref()
        .ok_or_else(|| PipelineError::NotFound("metrics exporter not installed".into()))?;
    Ok(response(
        StatusCode::OK,
        PROMETHEUS_CONTENT_TYPE,
        Bytes::from(handle.render()),
    ))
}

async fn run_benchmark<B>(state: &AppState, req: Request<B>) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Display,
{
    let orchestrator = state
        .benchmark
        .as_ref()
        .ok_or_else(|| PipelineError::NotFound("benchmark not hosted here".into()))?;

    let request: BenchmarkRequest = read_json(req).await?;
    let result = orchestrator.trigger(request).await?;
    Ok(json_response(StatusCode::CREATED, &result))
}

async fn list_benchmarks(state: &AppState, query: &str) -> Result<Response<Full<Bytes>>> {
    let orchestrator = state
        .benchmark
        .as_ref()
        .ok_or_else(|| PipelineError::NotFound("benchmark not hosted here".into()))?;

    let limit = query_param(query, "limit")
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = query_param(query, "offset").unwrap_or(0);

    let (results, total) = orchestrator.store().list(limit, offset).await?;
    Ok(json_response(
        StatusCode::OK,
        &json!({ "results": results, "total": total }),
    ))
}

async fn get_benchmark(state: &AppState, id: &str) -> Result<Response<Full<Bytes>>> {
    let orchestrator = state
        .benchmark
        .as_ref()
        .ok_or_else(|| PipelineError::NotFound("benchmark not hosted here".into()))?;

    let id: i64 = id
        .parse()
        .map_err(|_| PipelineError::validation("Invalid id", Some(id.to_string())))?;
    let result = orchestrator
        .store()
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("benchmark result {}", id)))?;
    Ok(json_response(StatusCode::OK, &result))
}

async fn register<B>(
    state: &AppState,
    req: Request<B>,
    targets: &[RoutingTarget],
) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Display,
{
    let auth = state
        .auth
        .as_ref()
        .ok_or_else(|| PipelineError::NotFound("auth not hosted here".into()))?;

    let request: RegisterRequest = read_json(req).await?;
    let user = auth.register(request, targets).await?;
    Ok(json_response(StatusCode::CREATED, &json!({ "user": user })))
}

async fn login<B>(
    state: &AppState,
    req: Request<B>,
    targets: &[RoutingTarget],
) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Display,
{
    let auth = state
        .auth
        .as_ref()
        .ok_or_else(|| PipelineError::NotFound("auth not hosted here".into()))?;

    let request: LoginRequest = read_json(req).await?;
    let user = auth.login(request, targets).await?;
    Ok(json_response(StatusCode::OK, &json!({ "user": user })))
}

/// Parse a JSON body; an empty body parses as `{}`
async fn read_json<B, T>(req: Request<B>) -> Result<T>
where
    B: Body,
    B::Error: Display,
    T: DeserializeOwned,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| PipelineError::Http(format!("Body read error: {}", e)))?
        .to_bytes();

    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &body
    };
    serde_json::from_slice(body).map_err(|e| {
        PipelineError::validation(
            format!("Invalid JSON body: {}", e),
            Some(String::from_utf8_lossy(body).into_owned()),
        )
    })
}

fn query_param(query: &str, name: &str) -> Option<usize> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| value.parse().ok())
}

fn error_response(e: &PipelineError) -> Response<Full<Bytes>> {
    match e {
        PipelineError::Validation { message, received } => json_response(
            StatusCode::BAD_REQUEST,
            &json!({ "error": message, "received": received }),
        ),
        PipelineError::NotFound(_) => {
            json_response(StatusCode::NOT_FOUND, &json!({ "error": e.to_string() }))
        }
        PipelineError::Conflict(msg) => {
            json_response(StatusCode::CONFLICT, &json!({ "error": msg }))
        }
        PipelineError::Unauthorized(msg) => {
            json_response(StatusCode::UNAUTHORIZED, &json!({ "error": msg }))
        }
        _ => {
            error!("Request failed: {}", e);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "error": e.to_string() }),
            )
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => response(status, JSON_CONTENT_TYPE, Bytes::from(bytes)),
        Err(e) => response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            Bytes::from(format!("Serialization error: {}", e)),
        ),
    }
}

fn response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{BenchmarkOrchestrator, BenchmarkStore};
    use crate::broker::{MemoryBroker, Topology};
    use crate::consumer::ConsumerMetrics;
    use crate::ingress::AuthTrigger;
    use crate::producer::{BrokerHandle, EventProducer};
    use crate::sink::RelationalSink;
    use crate::utils::config::BenchmarkConfig;
    use std::sync::Arc;

    async fn state() -> (Arc<MemoryBroker>, AppState) {
        let broker = Arc::new(MemoryBroker::new());
        let handle = BrokerHandle::with_broker(broker.clone(), Topology::default()).await;
        let sink = Arc::new(RelationalSink::in_memory().await.unwrap());
        let store = Arc::new(BenchmarkStore::with_connection(sink.connection()).await.unwrap());
        let orchestrator = BenchmarkOrchestrator::new(store, &BenchmarkConfig::default());

        let state = AppState::new("audit-fanout-test")
            .with_consumer(sink, Arc::new(ConsumerMetrics::new()))
            .with_auth(Arc::new(AuthTrigger::new(EventProducer::new(handle))))
            .with_benchmark(Arc::new(orchestrator));
        (broker, state)
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let (_broker, state) = state().await;
        let response = route(&state, request(Method::GET, "/metrics", "")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["processed"], 0);
        assert_eq!(body["errorRate"], 0.0);

        let response = route(&state, request(Method::GET, "/metrics/postgres", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = route(&state, request(Method::GET, "/metrics/document", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let (_broker, state) = state().await;
        let response = route(&state, request(Method::GET, "/health", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["store"], "connected");
    }

    #[tokio::test]
    async fn test_benchmark_validation() {
        let (_broker, state) = state().await;
        let response = route(
            &state,
            request(
                Method::POST,
                "/benchmark-results/run",
                r#"{"base_url":"http://string","duration_sec":5,"vus":1}"#,
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["received"], "http://string");
    }

    #[tokio::test]
    async fn test_benchmark_listing_and_detail() {
        let (_broker, state) = state().await;

        let response = route(&state, request(Method::GET, "/benchmark-results?limit=500", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 0);
        assert!(body["results"].as_array().unwrap().is_empty());

        let response = route(&state, request(Method::GET, "/benchmark-results/abc", "")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = route(&state, request(Method::GET, "/benchmark-results/42", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_auth_routes_publish_with_hint() {
        let (broker, state) = state().await;
        let register = Request::builder()
            .method(Method::POST)
            .uri("/auth/register-user")
            .header("X-Audit-Target", "mongodb")
            .body(Full::new(Bytes::from(
                r#"{"email":"e@bench.local","password":"BenchPass123!"}"#,
            )))
            .unwrap();

        let response = route(&state, register).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["user"]["email"], "e@bench.local");
        assert_eq!(broker.queue_depth("audit.document"), Some(1));
        assert_eq!(broker.queue_depth("audit.relational"), Some(0));

        let again = request(
            Method::POST,
            "/auth/register-user",
            r#"{"email":"e@bench.local","password":"x"}"#,
        );
        assert_eq!(route(&state, again).await.status(), StatusCode::CONFLICT);

        let login = request(Method::POST, "/auth/login", r#"{"email":"e@bench.local","password":"x"}"#);
        assert_eq!(route(&state, login).await.status(), StatusCode::OK);
        let bad = request(Method::POST, "/auth/login", r#"{"email":"z@bench.local","password":"x"}"#);
        assert_eq!(route(&state, bad).await.status(), StatusCode::UNAUTHORIZED);
        let garbage = request(Method::POST, "/auth/login", "{");
        assert_eq!(route(&state, garbage).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (_broker, state) = state().await;
        let response = route(&state, request(Method::DELETE, "/health", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("limit=10&offset=20", "offset"), Some(20));
        assert_eq!(query_param("limit=x", "limit"), None);
        assert_eq!(query_param("", "limit"), None);
    }
}
