use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, RawQuery, State};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use http::header::{self, HeaderName, HeaderValue};
use serde::Serialize;

use crate::app::AppEnv;
use crate::model::error::AppError;
use crate::services::i_delay_store::DelayStore;
use crate::services::telemetry::TelemetrySink;

pub const CMSD_DYNAMIC: HeaderName = HeaderName::from_static("cmsd-dynamic");

/// Forwards the request to the origin, holds the finished response back for
/// the decided delay and reports that delay in `CMSD-Dynamic`.
#[tracing::instrument(level = "debug", skip(app))]
pub async fn bbrd_handler<Store: DelayStore, Sink: TelemetrySink>(
    State(app): State<Arc<AppEnv<Store, Sink>>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, AppError> {
    let query = query.unwrap_or_default();
    let record = app.engine.decide_query(&query, Utc::now()).await;
    app.sink.record(&record);
    let hold = hold_duration(record.delay());

    let upstream = app.origin.fetch(&path, &query).await?;
    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let body = upstream.bytes().await?;

    if !hold.is_zero() {
        tracing::debug!("holding response for {hold:?}");
        tokio::time::sleep(hold).await;
    }

    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    if let Some(content_type) = content_type {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    headers.insert(CMSD_DYNAMIC, cmsd_dynamic(hold)?);
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("CMSD-Dynamic"),
    );
    Ok(response)
}

/// The sleep applied for a decided delay. The engine only hands out sleepable
/// values; anything else is logged and served without a hold.
fn hold_duration(delay: f64) -> Duration {
    Duration::try_from_secs_f64(delay).unwrap_or_else(|e| {
        tracing::error!("decided delay {delay} cannot be slept ({e}), serving without delay");
        Duration::ZERO
    })
}

fn cmsd_dynamic(hold: Duration) -> Result<HeaderValue, AppError> {
    let value = format!("com.example-dl={}", hold.as_secs_f64());
    HeaderValue::from_str(&value).map_err(|e| AppError::from(anyhow::anyhow!(e)))
}

#[derive(Debug, Serialize)]
pub struct StateView {
    pub latest_delay: f64,
    pub latest_delay_timestamp: DateTime<Utc>,
    pub current_delay: f64,
}

#[tracing::instrument(level = "debug", skip(app))]
pub async fn state_handler<Store: DelayStore, Sink: TelemetrySink>(
    State(app): State<Arc<AppEnv<Store, Sink>>>,
) -> Result<Json<StateView>, AppError> {
    let state = app.engine.store().read().await?;
    Ok(Json(StateView {
        latest_delay: state.latest_delay,
        latest_delay_timestamp: state.latest_delay_timestamp,
        current_delay: state.current_delay(Utc::now()),
    }))
}
