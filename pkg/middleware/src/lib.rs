//! Tracing middleware for inbound HTTP requests.
//!
//! [`RequestTracer`] starts a span per request, names it after the matched
//! route and tags it with client metadata before the request reaches the
//! wrapped service.
//!
//! ```ignore
//! let tracer = RequestTracer::new(telemetry.dispatch())
//!     .with_route_matcher(MatchedPathRoutes)
//!     .with_source_ips(ForwardedSourceIps::new());
//! let router = Router::new().route("/orders/{id}", get(get_order)).layer(tracer);
//! ```
pub mod request;
pub mod route;
pub mod source_ips;
pub mod telemetry;
pub mod tracer;

pub use request::RequestHead;
pub use route::{MatchedPathRoutes, RouteMatcher, RouteTable, make_label_value};
pub use source_ips::{ForwardedSourceIps, SourceIpExtractor};
pub use telemetry::{Telemetry, TelemetryConfig, TelemetryError, init_tracer};
pub use tracer::{
    FORCE_TRACING_HEADER, FORCE_TRACING_TAG, RecordFailure, RecordStatus, RequestTracer,
    SOURCE_IPS_TAG, SpanTag, StartSpanOptions, TracedService, USER_AGENT_TAG,
};
