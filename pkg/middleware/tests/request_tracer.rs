use std::convert::Infallible;
use std::net::SocketAddr;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::routing::{get, post};
use http::{Method, Request, Response, StatusCode, header::USER_AGENT};
use middleware::{
    FORCE_TRACING_HEADER, FORCE_TRACING_TAG, ForwardedSourceIps, MatchedPathRoutes,
    RequestTracer, RouteTable, SOURCE_IPS_TAG, USER_AGENT_TAG,
};
use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, Status, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{
    InMemorySpanExporter, SdkTracerProvider, ShouldSample, SpanData, TracerProviderBuilder,
};
use rstest::rstest;
use tower::{ServiceExt as _, service_fn};
use tracing::Dispatch;
use tracing_subscriber::layer::SubscriberExt as _;

/// Spans recorded by an in-memory OpenTelemetry pipeline.
struct TestPipeline {
    exporter: InMemorySpanExporter,
    _provider: SdkTracerProvider,
    dispatch: Dispatch,
}

impl TestPipeline {
    fn new() -> Self {
        Self::from_builder(SdkTracerProvider::builder())
    }

    fn with_sampler(sampler: impl ShouldSample + 'static) -> Self {
        Self::from_builder(SdkTracerProvider::builder().with_sampler(sampler))
    }

    fn from_builder(builder: TracerProviderBuilder) -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = builder.with_simple_exporter(exporter.clone()).build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        Self {
            exporter,
            _provider: provider,
            dispatch: Dispatch::new(subscriber),
        }
    }

    fn tracer(&self) -> RequestTracer {
        RequestTracer::new(self.dispatch.clone())
    }

    fn single_span(&self) -> SpanData {
        let mut spans = self.exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1, "expected exactly one span, got {spans:?}");
        spans.remove(0)
    }
}

/// Samples only spans that carry the force-tracing tag when they are created.
#[derive(Debug, Clone)]
struct ForceTracingSampler;

impl ShouldSample for ForceTracingSampler {
    fn should_sample(
        &self,
        _parent_context: Option<&Context>,
        _trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let forced = attributes
            .iter()
            .any(|kv| kv.key.as_str() == FORCE_TRACING_TAG);
        SamplingResult {
            decision: if forced {
                SamplingDecision::RecordAndSample
            } else {
                SamplingDecision::Drop
            },
            attributes: Vec::new(),
            trace_state: TraceState::default(),
        }
    }
}

fn attribute(span: &SpanData, key: &str) -> Option<String> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().into_owned())
}

fn orders_table() -> RouteTable {
    RouteTable::new()
        .route(Method::GET, "/orders/{id}", "GetOrder")
        .route(Method::POST, "/orders", "CreateOrder")
}

async fn ok(_: Request<Body>) -> Result<Response<Body>, Infallible> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("X-Handled", "yes")
        .body(Body::from("ok"))
        .unwrap())
}

async fn call(tracer: &RequestTracer, request: Request<Body>) -> Response<Body> {
    let response = tracer.wrap(service_fn(ok)).oneshot(request).await.unwrap();
    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}

#[tokio::test]
async fn test_named_route_with_user_agent() {
    // given
    let pipeline = TestPipeline::new();
    let tracer = pipeline.tracer().with_route_matcher(orders_table());
    let request = Request::builder()
        .method(Method::GET)
        .uri("/orders/42")
        .header(USER_AGENT, "curl/7.1")
        .body(Body::empty())
        .unwrap();

    // when
    let response = call(&tracer, request).await;

    // then
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["X-Handled"], "yes");

    let span = pipeline.single_span();
    assert_eq!(span.name, "HTTP GET - GetOrder");
    assert_eq!(span.span_kind, SpanKind::Server);
    assert_eq!(attribute(&span, USER_AGENT_TAG).as_deref(), Some("curl/7.1"));
    assert_eq!(attribute(&span, SOURCE_IPS_TAG), None);
    assert_eq!(attribute(&span, FORCE_TRACING_TAG), None);
    assert_eq!(attribute(&span, "http.status_code").as_deref(), Some("200"));
}

#[tokio::test]
async fn test_unmatched_route_with_force_tracing() {
    // given
    let pipeline = TestPipeline::new();
    let tracer = pipeline.tracer().with_route_matcher(orders_table());
    let request = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .header(FORCE_TRACING_HEADER, "1")
        .body(Body::empty())
        .unwrap();

    // when
    call(&tracer, request).await;

    // then
    let span = pipeline.single_span();
    assert_eq!(span.name, "HTTP POST");
    assert_eq!(attribute(&span, FORCE_TRACING_TAG).as_deref(), Some("true"));
    assert_eq!(attribute(&span, USER_AGENT_TAG), None);
}

#[rstest]
#[case::present(Some("yes"), Some("true"))]
#[case::empty(Some(""), None)]
#[case::missing(None, None)]
#[tokio::test]
async fn test_force_tracing_tag(#[case] header: Option<&str>, #[case] want: Option<&str>) {
    // given
    let pipeline = TestPipeline::new();
    let mut builder = Request::builder().uri("/");
    if let Some(header) = header {
        builder = builder.header(FORCE_TRACING_HEADER, header);
    }

    // when
    call(&pipeline.tracer(), builder.body(Body::empty()).unwrap()).await;

    // then
    let span = pipeline.single_span();
    assert_eq!(attribute(&span, FORCE_TRACING_TAG).as_deref(), want);
}

#[tokio::test]
async fn test_source_ips_tag() {
    // given
    let pipeline = TestPipeline::new();
    let tracer = pipeline.tracer().with_source_ips(ForwardedSourceIps::new());
    let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let mut request = Request::builder()
        .uri("/")
        .header("X-Forwarded-For", "1.2.3.4, 10.0.0.1")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));

    // when
    call(&tracer, request).await;

    // then
    let span = pipeline.single_span();
    assert_eq!(
        attribute(&span, SOURCE_IPS_TAG).as_deref(),
        Some("10.0.0.1, 1.2.3.4")
    );
}

#[tokio::test]
async fn test_continues_upstream_trace() {
    // given
    let pipeline = TestPipeline::new();
    let request = Request::builder()
        .uri("/")
        .header(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .body(Body::empty())
        .unwrap();

    // when
    call(&pipeline.tracer(), request).await;

    // then
    let span = pipeline.single_span();
    assert_eq!(
        span.span_context.trace_id().to_string(),
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
    assert_eq!(span.parent_span_id.to_string(), "00f067aa0ba902b7");
    assert_eq!(
        attribute(&span, "trace_id").as_deref(),
        Some("4bf92f3577b34da6a3ce929d0e0e4736")
    );
}

#[tokio::test]
async fn test_server_error_marks_span() {
    // given
    let pipeline = TestPipeline::new();
    let inner = service_fn(|_: Request<Body>| async {
        Ok::<_, Infallible>(
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap(),
        )
    });

    // when
    let response = pipeline
        .tracer()
        .wrap(inner)
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    drop(response);

    // then
    let span = pipeline.single_span();
    assert_eq!(attribute(&span, "http.status_code").as_deref(), Some("500"));
    assert!(matches!(span.status, Status::Error { .. }));
}

#[tokio::test]
async fn test_axum_matched_path() {
    // given
    let pipeline = TestPipeline::new();
    let router = Router::new()
        .route("/orders/{id}", get(|| async { "order" }))
        .route("/login", post(|| async { "login" }))
        .layer(pipeline.tracer().with_route_matcher(MatchedPathRoutes));

    // when
    let response = router
        .oneshot(
            Request::builder()
                .uri("/orders/42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);

    // then
    let span = pipeline.single_span();
    assert_eq!(span.name, "HTTP GET - orders_id");
}

#[tokio::test]
async fn test_sampler_sees_force_tracing_tag() {
    // given
    let pipeline = TestPipeline::with_sampler(ForceTracingSampler);
    let tracer = pipeline.tracer().with_route_matcher(orders_table());
    let forced = Request::builder()
        .uri("/orders/1")
        .header(FORCE_TRACING_HEADER, "1")
        .body(Body::empty())
        .unwrap();
    let unforced = Request::builder()
        .uri("/orders/2")
        .body(Body::empty())
        .unwrap();

    // when
    call(&tracer, forced).await;
    call(&tracer, unforced).await;

    // then
    let span = pipeline.single_span();
    assert_eq!(span.name, "HTTP GET - GetOrder");
    assert_eq!(attribute(&span, FORCE_TRACING_TAG).as_deref(), Some("true"));
}
