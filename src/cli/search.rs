use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser, ValueEnum};
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ModelOptions, Opts, SearchOptions};
use crate::embed::Embedder;
use crate::index::{IndexPaths, MovieIndex, SearchHit};
use crate::model::ClipEncoder;

#[derive(Parser, Debug, Clone)]
#[command(group(ArgGroup::new("query").required(true).args(["image", "text"])))]
pub struct SearchCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径
    #[arg(long, value_name = "PATH")]
    pub image: Option<PathBuf>,
    /// 查询文本
    #[arg(long, value_name = "QUERY")]
    pub text: Option<String>,
    /// 返回的结果数量，默认使用 --image-top-k 或 --text-top-k
    #[arg(short, value_name = "K")]
    pub k: Option<usize>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let result = block_in_place(|| -> Result<_> {
            let encoder = ClipEncoder::load(&self.model)?;
            let index = MovieIndex::open(&IndexPaths::from(&opts.conf_dir), encoder.dim())?;

            let (query, k) = if let Some(path) = &self.image {
                let image = image::open(path)
                    .with_context(|| format!("无法读取图片 {}", path.display()))?;
                (encoder.embed_image(&image)?, self.k.unwrap_or(self.search.image_top_k))
            } else if let Some(text) = &self.text {
                (encoder.embed_text(text)?, self.k.unwrap_or(self.search.text_top_k))
            } else {
                bail!("需要指定 --image 或 --text");
            };

            index.search_movies(&query, k, self.search.threshold)
        })?;

        print_result(&result, self)
    }
}

fn print_result(result: &[SearchHit], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for hit in result {
                println!("{:.2}\t{}", hit.score, hit.movie_id);
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
