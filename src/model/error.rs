use axum::response::{IntoResponse, Response};
use reqwest::StatusCode;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum AppError {
    #[error("origin request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("invalid origin url: {0}")]
    OriginUrl(#[from] url::ParseError),
    #[error("delay state unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("error: {0}")]
    WrappedError(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::OriginUrl(_) | AppError::WrappedError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, format!("{}", self)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::WrappedError(err)
    }
}

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed delay state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("delay state owner is gone")]
    Closed,
}

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("DELAY_STORE=redis requires REDIS_URL")]
    MissingRedisUrl,
    #[error("BL_MS_DEVICES contains an empty pattern")]
    EmptyDevicePattern,
    #[error("ORIGIN_URL {0:?} is not a valid url: {1}")]
    InvalidOriginUrl(String, url::ParseError),
}
