use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use log::{debug, info};
use ndarray::Array1;
use ndarray_npy::{read_npy, write_npy};
use serde::Serialize;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::config::ConfDir;

/// 单条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub movie_id: i64,
    pub score: f32,
}

/// 索引与 ID 映射的存储位置
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub index: PathBuf,
    pub mapping: PathBuf,
}

impl From<&ConfDir> for IndexPaths {
    fn from(conf_dir: &ConfDir) -> Self {
        Self { index: conf_dir.index(), mapping: conf_dir.mapping() }
    }
}

/// 只追加的电影向量索引
///
/// 第 i 行向量对应 `ids[i]`，usearch 中的 key 即行号
pub struct MovieIndex {
    index: Index,
    ids: Vec<i64>,
    dim: usize,
}

fn index_options(dim: usize) -> IndexOptions {
    IndexOptions {
        dimensions: dim,
        // 向量均已归一化，内积即余弦相似度
        metric: MetricKind::IP,
        quantization: ScalarKind::F32,
        ..Default::default()
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().with_context(|| format!("路径不是合法的 UTF-8: {}", path.display()))
}

impl MovieIndex {
    /// 创建一个空索引
    pub fn create(dim: usize) -> Result<Self> {
        let index = Index::new(&index_options(dim))?;
        Ok(Self { index, ids: vec![], dim })
    }

    /// 从磁盘加载索引，索引文件不存在时创建空索引
    pub fn open(paths: &IndexPaths, dim: usize) -> Result<Self> {
        if !paths.index.exists() {
            info!("创建新索引 (dim={dim})");
            return Self::create(dim);
        }

        info!("从 {} 加载索引 (dim={dim})", paths.index.display());
        let index = Index::new(&index_options(dim))?;
        index.load(path_str(&paths.index)?)?;
        ensure!(
            index.dimensions() == dim,
            "索引维度 {} 与模型维度 {dim} 不一致",
            index.dimensions()
        );

        let ids = if paths.mapping.exists() {
            let ids: Array1<i64> = read_npy(&paths.mapping)
                .with_context(|| format!("读取 {} 失败", paths.mapping.display()))?;
            ids.to_vec()
        } else {
            vec![]
        };
        if ids.len() != index.size() {
            bail!("ID 映射数量 {} 与索引向量数量 {} 不一致", ids.len(), index.size());
        }

        info!("已加载 {} 个向量", ids.len());
        Ok(Self { index, ids, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 追加一个归一化后的向量
    pub fn add(&mut self, vector: &[f32], movie_id: i64) -> Result<()> {
        ensure!(vector.len() == self.dim, "向量维度 {} 与索引维度 {} 不一致", vector.len(), self.dim);

        let row = self.ids.len();
        if row + 1 > self.index.capacity() {
            self.index.reserve((row + 1).max(self.index.capacity() * 2).max(64))?;
        }
        self.index.add(row as u64, vector)?;
        self.ids.push(movie_id);
        debug!("添加向量 #{row} -> {movie_id}");
        Ok(())
    }

    /// 搜索内积最大的 k 个向量，返回按分数降序排列的 `(分数, 行号)`
    /// 返回结果大小固定为 k，不足的位置行号填充 -1
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(f32, i64)>> {
        ensure!(query.len() == self.dim, "向量维度 {} 与索引维度 {} 不一致", query.len(), self.dim);
        if k == 0 {
            return Ok(vec![]);
        }

        let mut result = if self.is_empty() {
            vec![]
        } else {
            // 精确搜索，候选数量不超过已有向量数
            let matches = self.index.exact_search(query, k.min(self.len()))?;
            matches
                .keys
                .iter()
                .zip(&matches.distances)
                // usearch 的 ip 距离为 1 - 内积
                .map(|(&key, &distance)| (1.0 - distance, key as i64))
                .collect::<Vec<_>>()
        };
        result.sort_by(|a, b| b.0.total_cmp(&a.0));
        result.resize(k, (f32::NEG_INFINITY, -1));
        Ok(result)
    }

    /// 搜索并过滤掉低于阈值的结果，将行号映射为电影 ID
    ///
    /// k 会被截断到向量数量，填充的 -1 行本就会被丢弃
    pub fn search_movies(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<SearchHit>> {
        let hits = self
            .search(query, k.min(self.len()))?
            .into_iter()
            .filter(|&(score, _)| score >= threshold)
            .filter_map(|(score, row)| {
                let movie_id = *self.ids.get(usize::try_from(row).ok()?)?;
                Some(SearchHit { movie_id, score })
            })
            .collect();
        Ok(hits)
    }

    /// 保存索引与 ID 映射，先写入临时文件再重命名
    pub fn save(&self, paths: &IndexPaths) -> Result<()> {
        if let Some(parent) = paths.index.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = paths.mapping.parent() {
            fs::create_dir_all(parent)?;
        }

        let index_tmp = paths.index.with_extension("bin.tmp");
        let mapping_tmp = paths.mapping.with_extension("npy.tmp");

        self.index.save(path_str(&index_tmp)?)?;
        write_npy(&mapping_tmp, &Array1::from(self.ids.clone()))
            .with_context(|| format!("写入 {} 失败", mapping_tmp.display()))?;

        fs::rename(&index_tmp, &paths.index)?;
        fs::rename(&mapping_tmp, &paths.mapping)?;
        debug!("索引已保存，共 {} 个向量", self.len());
        Ok(())
    }
}
