use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use movie_search::config::SearchOptions;
use movie_search::server::{AppState, NO_MATCH_MESSAGE, create_app};
use movie_search::{Embedder, IndexPaths, MovieIndex};
use rstest::*;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "movie-search-test-boundary";

/// 图片向量为平均颜色，文本向量按颜色关键词生成
struct ColorEmbedder;

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

impl Embedder for ColorEmbedder {
    fn dim(&self) -> usize {
        4
    }

    fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let rgb = image.to_rgb8();
        let n = (rgb.width() * rgb.height()) as f32;
        let mut sum = [0f32; 3];
        for pixel in rgb.pixels() {
            for c in 0..3 {
                sum[c] += pixel[c] as f32 / 255.0;
            }
        }
        Ok(normalize(vec![sum[0] / n, sum[1] / n, sum[2] / n, 0.05]))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let v = if text.contains("red") {
            vec![1.0, 0.0, 0.0, 0.05]
        } else if text.contains("green") {
            vec![0.0, 1.0, 0.0, 0.05]
        } else if text.contains("blue") {
            vec![0.0, 0.0, 1.0, 0.05]
        } else {
            vec![0.0, 0.0, 0.0, 1.0]
        };
        Ok(normalize(v))
    }
}

struct TestApp {
    router: Router,
    paths: IndexPaths,
    _dir: TempDir,
}

#[fixture]
fn app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let paths = IndexPaths {
        index: dir.path().join("movie_index.bin"),
        mapping: dir.path().join("movie_mapping.npy"),
    };
    let index = MovieIndex::open(&paths, ColorEmbedder.dim()).unwrap();
    let state = AppState::new(ColorEmbedder, index, paths.clone(), SearchOptions::default());
    TestApp { router: create_app(state, 1024 * 1024), paths, _dir: dir }
}

fn poster(color: [u8; 3]) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 48, Rgb(color)));
    let mut buf = vec![];
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, Vec<u8>),
}

fn multipart(uri: &str, parts: Vec<Part<'_>>) -> Request<Body> {
    let mut body = vec![];
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                        .as_bytes(),
                );
            }
            Part::File(name, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}.png\"\r\n\
                         Content-Type: image/png\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

fn json_request(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn add_movie(router: &Router, id: &str, color: [u8; 3], overview: Option<&str>) -> Value {
    let mut parts = vec![Part::Text("movie_id", id), Part::File("poster", poster(color))];
    if let Some(overview) = overview {
        parts.push(Part::Text("overview", overview));
    }
    let (status, body) = send(router, multipart("/api/add_movie", parts)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn ping(app: TestApp) {
    let request = Request::builder().uri("/api/ping").body(Body::empty()).unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["message"].is_string());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn add_without_poster(app: TestApp) {
    let request = multipart("/api/add_movie", vec![Part::Text("movie_id", "1")]);
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(!app.paths.index.exists());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn add_with_non_multipart_body(app: TestApp) {
    let request = json_request("/api/add_movie", r#"{"movie_id": 1}"#);
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(!app.paths.index.exists());
}

#[rstest]
#[case::missing(None)]
#[case::blank(Some(" "))]
#[case::not_a_number(Some("abc"))]
#[tokio::test(flavor = "multi_thread")]
async fn add_with_bad_movie_id(app: TestApp, #[case] id: Option<&str>) {
    let mut parts = vec![Part::File("poster", poster([255, 0, 0]))];
    if let Some(id) = id {
        parts.push(Part::Text("movie_id", id));
    }
    let (status, body) = send(&app.router, multipart("/api/add_movie", parts)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn add_with_broken_image(app: TestApp) {
    let parts = vec![Part::Text("movie_id", "1"), Part::File("poster", b"not an image".to_vec())];
    let (status, body) = send(&app.router, multipart("/api/add_movie", parts)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn add_persists_index(app: TestApp) -> Result<()> {
    let body = add_movie(&app.router, "42", [255, 0, 0], None).await;
    assert_eq!(body, json!({ "status": "success", "movie_id": 42 }));
    add_movie(&app.router, "43", [0, 0, 255], Some("a blue sea")).await;

    let index = MovieIndex::open(&app.paths, ColorEmbedder.dim())?;
    assert_eq!(index.len(), 2);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_empty_index(app: TestApp) {
    let parts = vec![Part::File("image", poster([255, 0, 0]))];
    let (status, body) = send(&app.router, multipart("/api/search_by_image", parts)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"], json!([]));
    assert_eq!(body["message"], NO_MATCH_MESSAGE);

    let request = json_request("/api/search_by_text", r#"{"query": "red"}"#);
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"], json!([]));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_by_image_finds_itself(app: TestApp) {
    add_movie(&app.router, "1", [255, 0, 0], None).await;
    add_movie(&app.router, "2", [0, 255, 0], None).await;
    add_movie(&app.router, "3", [0, 0, 255], None).await;

    let parts = vec![Part::File("image", poster([0, 255, 0]))];
    let (status, body) = send(&app.router, multipart("/api/search_by_image", parts)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["movie_id"], 2);
    assert!((results[0]["score"].as_f64().unwrap() - 1.0).abs() < 1e-3);
    assert!(body.get("message").is_none());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn overview_changes_item_embedding(app: TestApp) {
    add_movie(&app.router, "1", [255, 0, 0], None).await;
    add_movie(&app.router, "2", [255, 0, 0], Some("deep blue")).await;

    let parts = vec![Part::File("image", poster([255, 0, 0]))];
    let (_, body) = send(&app.router, multipart("/api/search_by_image", parts)).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);

    // 无简介时为纯图片向量
    assert_eq!(results[0]["movie_id"], 1);
    assert!((results[0]["score"].as_f64().unwrap() - 1.0).abs() < 1e-3);
    // 有简介时为图片与文本向量的均值
    assert_eq!(results[1]["movie_id"], 2);
    let score = results[1]["score"].as_f64().unwrap();
    assert!(score > 0.6 && score < 0.8, "{score}");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_respects_top_k(app: TestApp) {
    for id in ["1", "2", "3", "4"] {
        add_movie(&app.router, id, [255, 0, 0], None).await;
    }

    let parts = vec![Part::File("image", poster([255, 0, 0])), Part::Text("top_k", "2")];
    let (_, body) = send(&app.router, multipart("/api/search_by_image", parts)).await;
    assert_eq!(body["results"].as_array().unwrap().len(), 2);

    let request = json_request("/api/search_by_text", r#"{"query": "red", "top_k": 3}"#);
    let (_, body) = send(&app.router, request).await;
    assert_eq!(body["results"].as_array().unwrap().len(), 3);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_with_huge_top_k(app: TestApp) {
    add_movie(&app.router, "1", [255, 0, 0], None).await;
    add_movie(&app.router, "2", [0, 0, 255], None).await;

    let request = json_request("/api/search_by_text", r#"{"query": "red", "top_k": 1099511627776}"#);
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["movie_id"], 1);

    let top_k = u64::MAX.to_string();
    let parts = vec![Part::File("image", poster([0, 0, 255])), Part::Text("top_k", &top_k)];
    let (status, body) = send(&app.router, multipart("/api/search_by_image", parts)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["movie_id"], 2);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_by_text_threshold(app: TestApp) {
    add_movie(&app.router, "7", [255, 0, 0], Some("a red planet")).await;

    let request = json_request("/api/search_by_text", r#"{"query": "red"}"#);
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["movie_id"], 7);

    let request = json_request("/api/search_by_text", r#"{"query": "blue"}"#);
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"], json!([]));
    assert!(body.get("message").is_none());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn search_without_input(app: TestApp) {
    let parts = vec![Part::Text("top_k", "3")];
    let (status, body) = send(&app.router, multipart("/api/search_by_image", parts)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let parts = vec![Part::File("image", poster([255, 0, 0])), Part::Text("top_k", "abc")];
    let (status, body) = send(&app.router, multipart("/api/search_by_image", parts)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    for payload in [r#"{}"#, r#"{"query": ""}"#, r#"{"query": "#] {
        let (status, body) = send(&app.router, json_request("/api/search_by_text", payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{payload}");
        assert!(body["error"].is_string());
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_adds_keep_mapping_aligned(app: TestApp) -> Result<()> {
    let router = Arc::new(app.router.clone());
    let tasks = (0..8)
        .map(|i| {
            let router = router.clone();
            tokio::spawn(async move {
                let color = if i % 2 == 0 { [255, 0, 0] } else { [0, 0, 255] };
                add_movie(&router, &i.to_string(), color, None).await;
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await?;
    }

    let index = MovieIndex::open(&app.paths, ColorEmbedder.dim())?;
    assert_eq!(index.len(), 8);
    Ok(())
}
