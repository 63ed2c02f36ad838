use axum::{
    Router,
    extract::Path,
    http::Method,
    routing::{get, post},
};
use dotenv::dotenv;
use middleware::{ForwardedSourceIps, RequestTracer, RouteTable, TelemetryConfig, init_tracer};
use std::{error::Error, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{info, instrument};

const SERVICE_NAME: &str = "gateway";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let telemetry = init_tracer(&TelemetryConfig::from_env(SERVICE_NAME))?;
    let tracer = RequestTracer::new(telemetry.dispatch())
        .with_route_matcher(routes())
        .with_source_ips(ForwardedSourceIps::new());

    let router = router(tracer);

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    telemetry.shutdown()?;

    Ok(())
}

/// Route names used as span operation names.
fn routes() -> RouteTable {
    RouteTable::new()
        .route(Method::GET, "/orders/{id}", "GetOrder")
        .route(Method::POST, "/login", "Login")
}

fn router(tracer: RequestTracer) -> Router {
    Router::new()
        .route("/orders/{id}", get(get_order))
        .route("/login", post(login))
        .layer(tracer)
}

/// Returns a single order.
#[instrument]
async fn get_order(Path(id): Path<String>) -> String {
    format!("order {id}")
}

/// Logs the user in.
#[instrument]
async fn login() -> &'static str {
    "ok"
}
