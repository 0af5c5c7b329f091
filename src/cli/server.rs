use std::fs;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use tokio::net::TcpListener;
use tokio::task::{block_in_place, spawn_blocking};
use tokio::time::{Duration, sleep};

use crate::cli::SubCommandExtend;
use crate::config::{ModelOptions, SearchOptions};
use crate::embed::Embedder;
use crate::index::{IndexPaths, MovieIndex};
use crate::model::ClipEncoder;
use crate::{Opts, metrics, server};

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 监听地址
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub addr: String,
    /// 请求体大小上限，单位为字节
    #[arg(long, value_name = "BYTES", default_value_t = 1024 * 1024 * 10)]
    pub body_limit: usize,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let encoder = block_in_place(|| ClipEncoder::load(&self.model))?;

        fs::create_dir_all(opts.conf_dir.path())?;
        let paths = IndexPaths::from(&opts.conf_dir);
        let index = block_in_place(|| MovieIndex::open(&paths, encoder.dim()))?;
        metrics::set_index_size(index.len());

        // 创建应用状态
        let state = server::AppState::new(encoder, index, paths, self.search.clone());

        // 创建应用
        let app = server::create_app(state, self.body_limit);

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone().unwrap_or_else(|| self.addr.clone());
            let auth = match &self.prometheus_auth {
                Some(s) => {
                    let (username, password) =
                        s.split_once(':').context("prometheus 认证信息格式应为 username:password")?;
                    Some((username.to_string(), password.to_string()))
                }
                None => None,
            };
            tokio::spawn(push_metrics_loop(url, instance, auth));
        }

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn push_metrics_loop(url: String, instance: String, auth: Option<(String, String)>) {
    loop {
        let metric_families = prometheus::gather();
        let url = url.clone();
        let instance = instance.clone();
        let auth = auth.clone();
        let r = spawn_blocking(move || {
            prometheus::push_metrics(
                "movie_search",
                labels! {
                    "instance".to_string() => instance,
                },
                &url,
                metric_families,
                auth.map(|(username, password)| BasicAuthentication { username, password }),
            )
        })
        .await;
        match r {
            Ok(Err(e)) => error!("推送指标失败: {e}"),
            Err(e) => error!("推送指标任务异常退出: {e}"),
            Ok(Ok(())) => {}
        }
        sleep(Duration::from_secs(30)).await;
    }
}
