use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response, header::USER_AGENT};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt as _;
use opentelemetry_http::HeaderExtractor;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tower::Layer;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, DefaultOnRequest, MakeSpan, OnFailure, OnResponse, Trace,
    TraceLayer,
};
use tracing::{Dispatch, Span, field, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt as _;

use crate::request::RequestHead;
use crate::route::RouteMatcher;
use crate::source_ips::SourceIpExtractor;

/// Request header that forces the request to be traced.
///
/// Clients and proxies rely on this exact name.
pub const FORCE_TRACING_HEADER: &str = "X-AMP-Force-Tracing";

/// Span tag carrying the client's user agent.
pub const USER_AGENT_TAG: &str = "http.user_agent";

/// Span tag carrying the client's source IPs.
pub const SOURCE_IPS_TAG: &str = "sourceIPs";

/// Start tag that tells the sampler the request must be traced.
pub const FORCE_TRACING_TAG: &str = "thanos.force_tracing";

/// A tower-http [`Trace`] service whose spans are created by [`RequestTracer`].
pub type TracedService<S> = Trace<
    S,
    SharedClassifier<ServerErrorsAsFailures>,
    RequestTracer,
    DefaultOnRequest,
    RecordStatus,
    DefaultOnBodyChunk,
    DefaultOnEos,
    RecordFailure,
>;

/// A key/value annotation on a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanTag {
    pub key: &'static str,
    pub value: String,
}

impl SpanTag {
    fn new<V: Into<String>>(key: &'static str, value: V) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// Options that must be known when a span is created so the sampler can see them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartSpanOptions {
    /// Whether the client asked for the request to be traced unconditionally.
    pub force_tracing: bool,
}

/// Middleware that traces incoming requests.
///
/// Every request gets a span named after its route, tagged with client
/// metadata and, when [`FORCE_TRACING_HEADER`] is set, with a force-tracing
/// start tag. The span lifecycle itself (parenting, status codes, finishing)
/// is handled by tower-http's [`Trace`] service.
///
/// Spans are created on the injected [`Dispatch`] and continue upstream traces
/// found by the injected propagator.
#[derive(Clone)]
pub struct RequestTracer {
    route_matcher: Option<Arc<dyn RouteMatcher>>,
    source_ips: Option<Arc<dyn SourceIpExtractor>>,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    dispatch: Dispatch,
}

impl fmt::Debug for RequestTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracer")
            .field("route_matcher", &self.route_matcher.is_some())
            .field("source_ips", &self.source_ips.is_some())
            .field("propagator", &self.propagator)
            .finish_non_exhaustive()
    }
}

impl RequestTracer {
    /// Creates a new [`RequestTracer`] whose spans are recorded by `dispatch`.
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            route_matcher: None,
            source_ips: None,
            propagator: Arc::new(TraceContextPropagator::new()),
            dispatch,
        }
    }

    /// Sets the route matcher used to name operations.
    pub fn with_route_matcher<M: RouteMatcher + 'static>(mut self, route_matcher: M) -> Self {
        self.route_matcher = Some(Arc::new(route_matcher));
        self
    }

    /// Sets the extractor whose result is tagged as [`SOURCE_IPS_TAG`].
    pub fn with_source_ips<E: SourceIpExtractor + 'static>(mut self, source_ips: E) -> Self {
        self.source_ips = Some(Arc::new(source_ips));
        self
    }

    /// Sets the propagator used to continue upstream traces.
    pub fn with_propagator<P>(mut self, propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        self.propagator = Arc::new(propagator);
        self
    }

    /// Wraps `next` so that every request it serves is traced.
    pub fn wrap<S>(&self, next: S) -> TracedService<S> {
        TraceLayer::new_for_http()
            .make_span_with(self.clone())
            .on_response(RecordStatus)
            .on_failure(RecordFailure)
            .layer(next)
    }

    /// Returns the operation name of the request's span.
    ///
    /// A missing matcher and an unmatched route both yield `HTTP <method>`.
    pub fn operation_name(&self, request: &RequestHead<'_>) -> String {
        let route = self
            .route_matcher
            .as_ref()
            .and_then(|m| m.route_name(request))
            .filter(|name| !name.is_empty());

        match route {
            Some(route) => format!("HTTP {} - {}", request.method, route),
            None => format!("HTTP {}", request.method),
        }
    }

    /// Returns the descriptive tags recorded once the span exists.
    pub fn span_tags(&self, request: &RequestHead<'_>) -> Vec<SpanTag> {
        let mut tags = Vec::new();

        if let Some(user_agent) = request.header(USER_AGENT.as_str()) {
            tags.push(SpanTag::new(
                USER_AGENT_TAG,
                String::from_utf8_lossy(user_agent),
            ));
        }

        if let Some(extractor) = &self.source_ips {
            let source_ips = extractor.source_ips(request);
            if !source_ips.is_empty() {
                tags.push(SpanTag::new(SOURCE_IPS_TAG, source_ips));
            }
        }

        tags
    }

    /// Records the descriptive tags of `request` on `span`.
    pub fn observe_span(&self, span: &Span, request: &RequestHead<'_>) {
        for tag in self.span_tags(request) {
            span.record(tag.key, tag.value.as_str());
        }
    }

    /// Returns the options the span must be started with.
    pub fn start_span_options(&self, request: &RequestHead<'_>) -> StartSpanOptions {
        StartSpanOptions {
            force_tracing: request.header(FORCE_TRACING_HEADER).is_some(),
        }
    }

    /// Starts the span of `request`.
    ///
    /// The operation name and start tags are fixed at creation. The parent
    /// context and descriptive tags are applied afterwards.
    pub fn start_span(&self, request: &RequestHead<'_>) -> Span {
        let operation_name = self.operation_name(request);
        let options = self.start_span_options(request);

        let span = tracing::dispatcher::with_default(&self.dispatch, || {
            macro_rules! request_span {
                ($($start_tags:tt)*) => {
                    info_span!(
                        "request",
                        $($start_tags)*
                        otel.name = %operation_name,
                        otel.kind = "server",
                        otel.status_code = field::Empty,
                        http.method = %request.method,
                        http.url = %request.uri,
                        http.status_code = field::Empty,
                        { USER_AGENT_TAG } = field::Empty,
                        { SOURCE_IPS_TAG } = field::Empty,
                        trace_id = field::Empty
                    )
                };
            }

            if options.force_tracing {
                request_span!({ FORCE_TRACING_TAG } = "true",)
            } else {
                request_span!()
            }
        });

        let parent_context = self
            .propagator
            .extract(&HeaderExtractor(request.headers));
        span.set_parent(parent_context);

        let trace_id = span.context().span().span_context().trace_id();
        span.record("trace_id", trace_id.to_string());

        self.observe_span(&span, request);

        span
    }
}

impl<S> Layer<S> for RequestTracer {
    type Service = TracedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        self.wrap(inner)
    }
}

impl<B> MakeSpan<B> for RequestTracer {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        self.start_span(&RequestHead::from(request))
    }
}

/// Records the response status code on the request span.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordStatus;

impl<B> OnResponse<B> for RecordStatus {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let status = response.status();
        span.record("http.status_code", status.as_u16());
        tracing::debug!(status = status.as_u16(), ?latency, "finished processing request");
    }
}

/// Marks the request span as failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFailure;

impl<F: fmt::Display> OnFailure<F> for RecordFailure {
    fn on_failure(&mut self, failure: F, latency: Duration, span: &Span) {
        span.record("otel.status_code", "ERROR");
        tracing::error!(%failure, ?latency, "request failed");
    }
}
