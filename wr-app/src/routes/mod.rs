pub mod health;
pub mod wechat;

use axum::Router;
use axum::http::StatusCode;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

/// The webhook stays outside the timeout layer: a final-retry waiter must be able
/// to outlast `http_timeout`.
pub fn router(http_timeout: Duration) -> Router {
    Router::new()
        .merge(health::router().layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            http_timeout,
        )))
        .merge(wechat::router())
}
