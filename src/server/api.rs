use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum_typed_multipart::{TypedMultipart, TypedMultipartError};
use log::{debug, info};
use tokio::task::block_in_place;

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::embed::item_embedding;
use crate::metrics::{self, SearchKind};

/// 以图搜索没有结果时的说明
pub const NO_MATCH_MESSAGE: &str = "No sufficiently similar movies found";

/// 健康检查
#[utoipa::path(
    get,
    path = "/api/ping",
    responses(
        (status = 200, body = PingResponse),
    )
)]
pub async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok".to_string(),
        message: "AI service (CLIP) is running".to_string(),
    })
}

/// 添加一部电影到索引
#[utoipa::path(
    post,
    path = "/api/add_movie",
    request_body(content = AddMovieForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = AddMovieResponse),
        (
            status = 400,
            description = "缺少海报，movie_id 缺失或不是整数，或请求体不是合法的 multipart 表单；此时不会写入索引"
        ),
        (status = 500, description = "模型推理或写入索引失败"),
    )
)]
pub async fn add_movie_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<TypedMultipart<AddMovieRequest>, TypedMultipartError>,
) -> Result<Json<AddMovieResponse>> {
    let TypedMultipart(data) = payload.map_err(AppError::bad_request)?;
    let Some(poster) = data.poster else {
        return Err(AppError::bad_request("No poster file provided"));
    };
    let movie_id = match data.movie_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => {
            id.parse::<i64>().map_err(|_| AppError::bad_request(format!("Invalid movie_id: {id}")))?
        }
        _ => return Err(AppError::bad_request("No movie_id provided")),
    };

    let vector = block_in_place(|| -> anyhow::Result<_> {
        let image = image::load_from_memory(&poster)?;
        item_embedding(state.embedder.as_ref(), &image, data.overview.as_deref())
    })?;

    let mut index = state.index.write().await;
    index.add(&vector, movie_id)?;
    block_in_place(|| index.save(&state.paths))?;
    metrics::inc_add_count(index.len());

    info!("添加电影 {movie_id}，当前共 {} 个向量", index.len());
    Ok(Json(AddMovieResponse { status: "success".to_string(), movie_id }))
}

/// 以图搜索
#[utoipa::path(
    post,
    path = "/api/search_by_image",
    request_body(content = SearchImageForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "缺少图片，或表单字段不合法（如 top_k 不是整数）"),
    )
)]
pub async fn search_by_image_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<TypedMultipart<SearchImageRequest>, TypedMultipartError>,
) -> Result<Json<SearchResponse>> {
    let TypedMultipart(data) = payload.map_err(AppError::bad_request)?;
    let Some(file) = data.image else {
        return Err(AppError::bad_request("No image provided"));
    };
    let top_k = data.top_k.unwrap_or(state.search.image_top_k);

    let start = Instant::now();
    let query = block_in_place(|| -> anyhow::Result<_> {
        let image = image::load_from_memory(&file)?;
        state.embedder.embed_image(&image)
    })?;

    let results = search(&state, SearchKind::Image, &query, top_k, start).await?;
    let message = results.is_empty().then(|| NO_MATCH_MESSAGE.to_string());

    Ok(Json(SearchResponse { status: "success".to_string(), results, message }))
}

/// 以文本搜索
#[utoipa::path(
    post,
    path = "/api/search_by_text",
    request_body = SearchTextRequest,
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "缺少查询文本"),
    )
)]
pub async fn search_by_text_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<SearchTextRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>> {
    let Json(data) = payload.map_err(|e| AppError::bad_request(e.body_text()))?;
    let query = match data.query.as_deref().map(str::trim) {
        Some(query) if !query.is_empty() => query.to_string(),
        _ => return Err(AppError::bad_request("No query provided")),
    };
    let top_k = data.top_k.unwrap_or(state.search.text_top_k);

    let start = Instant::now();
    let vector = block_in_place(|| state.embedder.embed_text(&query))?;

    let results = search(&state, SearchKind::Text, &vector, top_k, start).await?;

    Ok(Json(SearchResponse { status: "success".to_string(), results, message: None }))
}

async fn search(
    state: &AppState,
    kind: SearchKind,
    query: &[f32],
    top_k: usize,
    start: Instant,
) -> anyhow::Result<Vec<MovieScore>> {
    let hits = {
        let index = state.index.read().await;
        index.search_movies(query, top_k, state.search.threshold)?
    };

    let elapsed = start.elapsed().as_secs_f32();
    metrics::observe_search(kind, elapsed, hits.first().map(|hit| hit.score));
    debug!("{kind:?} 搜索完成，耗时 {elapsed:.3}s，{} 个结果", hits.len());

    Ok(hits.into_iter().map(MovieScore::from).collect())
}
