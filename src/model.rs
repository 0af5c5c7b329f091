use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use image::DynamicImage;
use image::imageops::FilterType;
use log::{debug, info};
use serde::Deserialize;
use tokenizers::{Tokenizer, TruncationParams};

use crate::config::ModelOptions;
use crate::embed::{Embedder, l2_normalize};

/// 没有 config.json 时使用的基础模型
pub const DEFAULT_MODEL: &str = "openai/clip-vit-base-patch32";
/// 该 revision 提供了 safetensors 格式的权重
const DEFAULT_REVISION: &str = "refs/pr/15";

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];

/// checkpoint 目录下的 config.json
#[derive(Debug, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub revision: Option<String>,
}

fn default_model_name() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { model_name: default_model_name(), revision: None }
    }
}

impl CheckpointConfig {
    /// 读取 checkpoint 配置，文件不存在时使用默认配置
    pub fn read(checkpoint_dir: &Path) -> Result<Self> {
        let path = checkpoint_dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(&path).with_context(|| format!("读取 {} 失败", path.display()))?;
        let config = serde_json::from_slice(&data)
            .with_context(|| format!("解析 {} 失败", path.display()))?;
        Ok(config)
    }

    pub fn revision(&self) -> &str {
        match &self.revision {
            Some(revision) => revision,
            None if self.model_name == DEFAULT_MODEL => DEFAULT_REVISION,
            None => "main",
        }
    }
}

/// 根据模型名称获取网络结构
fn clip_config(model_name: &str) -> Result<ClipConfig> {
    match model_name {
        "openai/clip-vit-base-patch32" => Ok(ClipConfig::vit_base_patch32()),
        _ => bail!("不支持的基础模型: {model_name}"),
    }
}

/// 将微调的投影层权重覆盖到基础权重上
///
/// 权重文件中的名称可以是 `weight`，也可以是完整的 `{prefix}.weight`
fn overlay_projection(
    weights: &mut HashMap<String, Tensor>,
    path: &Path,
    prefix: &str,
    device: &Device,
) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("读取 {} 失败", path.display()))?;
    ensure!(!tensors.is_empty(), "{} 中没有任何权重", path.display());

    for (name, tensor) in tensors {
        let name =
            if name.starts_with(&format!("{prefix}.")) { name } else { format!("{prefix}.{name}") };
        let (shape, dtype) = match weights.get(&name) {
            Some(base) => (base.shape().clone(), base.dtype()),
            None => bail!("基础模型中不存在权重 {name}"),
        };
        ensure!(
            &shape == tensor.shape(),
            "权重 {name} 形状不匹配: 期望 {shape:?}，实际 {:?}",
            tensor.shape()
        );
        debug!("覆盖权重 {name}");
        weights.insert(name, tensor.to_dtype(dtype)?);
    }
    Ok(())
}

/// 图片预处理：等比缩放并中心裁剪到 `size`，按 CLIP 均值方差归一化，输出 `(1, 3, size, size)`
pub fn preprocess_image(image: &DynamicImage, size: usize, device: &Device) -> Result<Tensor> {
    let img = image.resize_to_fill(size as u32, size as u32, FilterType::CatmullRom).to_rgb8();
    let mean = Tensor::new(&CLIP_MEAN[..], device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD[..], device)?.reshape((3, 1, 1))?;
    let pixels = Tensor::from_vec(img.into_raw(), (size, size, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?
        .unsqueeze(0)?;
    Ok(pixels)
}

/// CLIP 双塔编码器
pub struct ClipEncoder {
    model: ClipModel,
    tokenizer: Tokenizer,
    device: Device,
    image_size: usize,
    dim: usize,
}

impl ClipEncoder {
    /// 加载基础模型，并覆盖 checkpoint 目录中的投影层权重
    pub fn load(opts: &ModelOptions) -> Result<Self> {
        let device = if opts.cuda { Device::cuda_if_available(0)? } else { Device::Cpu };
        let checkpoint = CheckpointConfig::read(&opts.checkpoint_dir)?;
        let config = clip_config(&checkpoint.model_name)?;

        info!("基础模型: {} ({})", checkpoint.model_name, checkpoint.revision());
        let (weights_path, tokenizer_path) = fetch_model(&checkpoint)?;

        let mut weights = candle_core::safetensors::load(&weights_path, &device)
            .with_context(|| format!("读取 {} 失败", weights_path.display()))?;
        for (file, prefix) in
            [("text_proj.safetensors", "text_projection"), ("image_proj.safetensors", "visual_projection")]
        {
            let path = opts.checkpoint_dir.join(file);
            if path.exists() {
                info!("加载投影层权重: {}", path.display());
                overlay_projection(&mut weights, &path, prefix, &device)?;
            }
        }

        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = ClipModel::new(vb, &config)?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(anyhow::Error::msg)?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.text_config.max_position_embeddings,
                ..Default::default()
            }))
            .map_err(anyhow::Error::msg)?;

        let dim = config.text_config.projection_dim;
        info!("模型加载完成，向量维度 {dim}");

        Ok(Self { model, tokenizer, device, image_size: config.image_size, dim })
    }

    fn features_to_vec(&self, features: Tensor) -> Result<Vec<f32>> {
        let mut v = features.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        l2_normalize(&mut v)?;
        Ok(v)
    }
}

/// 从 Hugging Face 下载（或从本地缓存读取）权重与分词器
fn fetch_model(checkpoint: &CheckpointConfig) -> Result<(PathBuf, PathBuf)> {
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        checkpoint.model_name.clone(),
        RepoType::Model,
        checkpoint.revision().to_string(),
    ));
    let weights = repo.get("model.safetensors")?;
    let tokenizer = repo.get("tokenizer.json")?;
    Ok((weights, tokenizer))
}

impl Embedder for ClipEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let pixels = preprocess_image(image, self.image_size, &self.device)?;
        let features = self.model.get_image_features(&pixels)?;
        self.features_to_vec(features)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self.tokenizer.encode(text, true).map_err(anyhow::Error::msg)?;
        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let features = self.model.get_text_features(&input_ids)?;
        self.features_to_vec(features)
    }
}
