use crate::app::AppEnv;
use crate::services::i_delay_store::DelayStore;
use crate::services::telemetry::TelemetrySink;
use std::sync::Arc;

use axum::{Router, routing::get};
use tower::ServiceBuilder;
use tower_http::{normalize_path::NormalizePathLayer, trace::TraceLayer};

mod delay;

pub use delay::CMSD_DYNAMIC;

pub async fn new<Store: DelayStore, Sink: TelemetrySink>(app: AppEnv<Store, Sink>) -> Router {
    with_shared(Arc::new(app))
}

pub fn with_shared<Store: DelayStore, Sink: TelemetrySink>(
    app_state: Arc<AppEnv<Store, Sink>>,
) -> Router {
    Router::new()
        .route("/", get(|| async { "Hello!" }))
        .route("/cmsd/state", get(delay::state_handler::<Store, Sink>))
        .route(
            "/cmsd-njs/bufferBasedResponseDelay/*path",
            get(delay::bbrd_handler::<Store, Sink>),
        )
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(NormalizePathLayer::trim_trailing_slash()),
        )
}
