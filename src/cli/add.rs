use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{ModelOptions, Opts};
use crate::embed::{Embedder, item_embedding};
use crate::index::{IndexPaths, MovieIndex};
use crate::model::ClipEncoder;

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    /// 电影 ID
    pub movie_id: i64,
    /// 海报图片路径
    pub poster: PathBuf,
    /// 电影简介
    #[arg(long)]
    pub overview: Option<String>,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        block_in_place(|| {
            let encoder = ClipEncoder::load(&self.model)?;
            let poster = image::open(&self.poster)
                .with_context(|| format!("无法读取图片 {}", self.poster.display()))?;
            let vector = item_embedding(&encoder, &poster, self.overview.as_deref())?;

            fs::create_dir_all(opts.conf_dir.path())?;
            let paths = IndexPaths::from(&opts.conf_dir);
            let mut index = MovieIndex::open(&paths, encoder.dim())?;
            index.add(&vector, self.movie_id)?;
            index.save(&paths)?;

            info!("添加电影 {}，当前共 {} 个向量", self.movie_id, index.len());
            Ok(())
        })
    }
}
