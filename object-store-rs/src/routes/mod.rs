pub mod about;
pub mod files;
pub mod upload;

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    // session URLs are capabilities and carry no bearer token
    let authed = Router::new()
        .merge(files::router())
        .merge(about::router())
        .merge(upload::session_router())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .merge(authed)
        .merge(upload::transfer_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty());

    match (token, &state.config.access_token) {
        (None, _) => Err(AppError::Unauthorized("Login Required.".into())),
        (Some(t), Some(expected)) if t != expected => {
            Err(AppError::Unauthorized("Invalid Credentials".into()))
        }
        _ => Ok(next.run(request).await),
    }
}
