use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::index::SearchHit;

/// 添加电影请求参数
#[derive(TryFromMultipart)]
pub struct AddMovieRequest {
    pub movie_id: Option<String>,
    pub overview: Option<String>,
    pub poster: Option<Bytes>,
}

/// 添加电影表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct AddMovieForm {
    /// 电影 ID
    pub movie_id: i64,
    /// 电影简介，非空时与海报共同决定电影向量
    pub overview: Option<String>,
    /// 海报图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub poster: String,
}

/// 以图搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchImageRequest {
    pub image: Option<Bytes>,
    pub top_k: Option<usize>,
}

/// 以图搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchImageForm {
    /// 被搜索的图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub image: String,
    /// 最多返回的结果数量，默认为 10
    pub top_k: Option<usize>,
}

/// 以文本搜索请求参数
#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchTextRequest {
    /// 查询文本
    #[serde(default)]
    pub query: Option<String>,
    /// 最多返回的结果数量，默认为 5
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PingResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AddMovieResponse {
    pub status: String,
    pub movie_id: i64,
}

/// 单条搜索结果
#[derive(Debug, Serialize, ToSchema)]
pub struct MovieScore {
    pub movie_id: i64,
    /// 余弦相似度
    pub score: f32,
}

impl From<SearchHit> for MovieScore {
    fn from(hit: SearchHit) -> Self {
        Self { movie_id: hit.movie_id, score: hit.score }
    }
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    pub status: String,
    /// 按相似度降序排列的结果
    pub results: Vec<MovieScore>,
    /// 没有结果时的说明
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
