use std::sync::LazyLock;

use prometheus::*;

static METRIC_ADD_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("movie_search_add_count", "count of the movies added to the index")
        .unwrap()
});

static METRIC_INDEX_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("movie_search_index_size", "number of vectors in the index").unwrap()
});

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("movie_search_search_count", "count of the searches", &["kind"])
        .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "movie_search_search_duration",
        "duration of the per-query search in seconds, including embedding",
        &["kind"]
    )
    .unwrap()
});

static METRIC_SEARCH_MAX_SCORE: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "movie_search_search_max_score",
        "max score of the per-query search",
        &["kind"],
        (0..=20).map(|x| x as f64 * 0.05).collect()
    )
    .unwrap()
});

/// 搜索方式
#[derive(Debug, Clone, Copy)]
pub enum SearchKind {
    Image,
    Text,
}

impl SearchKind {
    fn label(self) -> &'static str {
        match self {
            SearchKind::Image => "image",
            SearchKind::Text => "text",
        }
    }
}

/// 记录一次添加，并更新索引大小
pub fn inc_add_count(index_size: usize) {
    METRIC_ADD_COUNT.inc();
    set_index_size(index_size);
}

pub fn set_index_size(index_size: usize) {
    METRIC_INDEX_SIZE.set(index_size as i64);
}

/// 记录一次搜索的耗时与最高分，没有结果时不记录分数
pub fn observe_search(kind: SearchKind, duration: f32, max_score: Option<f32>) {
    let label = kind.label();
    METRIC_SEARCH_COUNT.with_label_values(&[label]).inc();
    METRIC_SEARCH_DURATION.with_label_values(&[label]).observe(duration as f64);
    if let Some(score) = max_score {
        METRIC_SEARCH_MAX_SCORE.with_label_values(&[label]).observe(score as f64);
    }
}
