mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::api::NO_MATCH_MESSAGE;
pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::ping_handler,
        api::add_movie_handler,
        api::search_by_image_handler,
        api::search_by_text_handler,
    ),
    components(schemas(
        types::AddMovieForm,
        types::SearchImageForm,
        types::SearchTextRequest,
        types::PingResponse,
        types::AddMovieResponse,
        types::MovieScore,
        types::SearchResponse,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
///
/// `body_limit` 为单个请求体的最大字节数
pub fn create_app(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/api/ping", get(api::ping_handler))
        .route("/api/add_movie", post(api::add_movie_handler))
        .route("/api/search_by_image", post(api::search_by_image_handler))
        .route("/api/search_by_text", post(api::search_by_text_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}
