use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::SearchOptions;
use crate::embed::Embedder;
use crate::index::{IndexPaths, MovieIndex};

/// 应用状态
pub struct AppState {
    /// 编码模型，启动后只读
    pub embedder: Box<dyn Embedder>,
    /// 向量索引，添加时持有写锁直到保存完成
    pub index: RwLock<MovieIndex>,
    /// 索引保存路径
    pub paths: IndexPaths,
    /// 搜索配置选项
    pub search: SearchOptions,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        embedder: impl Embedder + 'static,
        index: MovieIndex,
        paths: IndexPaths,
        search: SearchOptions,
    ) -> Arc<Self> {
        Arc::new(AppState { embedder: Box::new(embedder), index: RwLock::new(index), paths, search })
    }
}
