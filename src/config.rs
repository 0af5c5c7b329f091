use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs =
        ProjectDirs::from("", "movie-search", "movie-search").expect("failed to get project dir");
    ConfDir { path: proj_dirs.config_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap()
}

#[derive(Parser, Debug, Clone)]
pub struct ModelOptions {
    /// 微调权重目录，可包含 config.json、text_proj.safetensors、image_proj.safetensors
    #[arg(long, value_name = "DIR", default_value = "./checkpoints")]
    pub checkpoint_dir: PathBuf,
    /// 如果可用，使用 CUDA 设备进行推理
    #[arg(long)]
    pub cuda: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 相似度阈值，低于该值的结果会被丢弃
    #[arg(long, value_name = "SCORE", default_value_t = 0.6)]
    pub threshold: f32,
    /// 以图搜索时默认返回的结果数量
    #[arg(long, value_name = "K", default_value_t = 10)]
    pub image_top_k: usize,
    /// 以文本搜索时默认返回的结果数量
    #[arg(long, value_name = "K", default_value_t = 5)]
    pub text_top_k: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { threshold: 0.6, image_top_k: 10, text_top_k: 5 }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "movie-search", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 索引文件所在目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 添加一部电影到索引
    Add(AddCommand),
    /// 以图片或文本搜索电影
    Search(SearchCommand),
    /// 启动 HTTP 服务
    Server(ServerCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回索引文件的路径
    pub fn index(&self) -> PathBuf {
        self.path.join("movie_index.bin")
    }

    /// 返回 ID 映射文件的路径
    pub fn mapping(&self) -> PathBuf {
        self.path.join("movie_mapping.npy")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}
