use anyhow::{Result, bail, ensure};
use image::DynamicImage;

/// 将图片与文本编码到同一向量空间的模型
pub trait Embedder: Send + Sync {
    /// 向量维度
    fn dim(&self) -> usize;

    /// 计算图片的归一化向量
    fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>>;

    /// 计算文本的归一化向量
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// 原地进行 L2 归一化
pub fn l2_normalize(v: &mut [f32]) -> Result<()> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        bail!("无法归一化模长为 {norm} 的向量");
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(())
}

/// 计算一部电影的向量
///
/// 简介非空时取图片向量与文本向量的均值再归一化，否则直接使用图片向量
pub fn item_embedding(
    embedder: &dyn Embedder,
    poster: &DynamicImage,
    overview: Option<&str>,
) -> Result<Vec<f32>> {
    let mut vector = embedder.embed_image(poster)?;

    if let Some(overview) = overview.map(str::trim).filter(|s| !s.is_empty()) {
        let text = embedder.embed_text(overview)?;
        ensure!(text.len() == vector.len(), "图片向量与文本向量维度不一致");
        vector.iter_mut().zip(&text).for_each(|(a, b)| *a = (*a + b) / 2.0);
    }

    l2_normalize(&mut vector)?;
    Ok(vector)
}
