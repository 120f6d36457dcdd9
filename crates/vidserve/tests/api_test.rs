//! HTTP API tests against a real listener
//!
//! The backend is a scripted stand-in for yt-dlp, so no network access or
//! yt-dlp install is needed.
//!
//! Run with: cargo test -p vidserve --test api_test

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::oneshot;
use url::Url;
use vidcore::core::validation::HostResolver;
use vidcore::download::formats::BEST_AVAILABLE_SELECTOR;
use vidcore::download::source::{DownloadRequest, ExtractionBackend, OutputTarget, RawFormat, RawVideoInfo};
use vidcore::{AppError, DownloadService, EngineConfig};
use vidserve::web_server;

const VIDEO_URL: &str = "https://video.example.com/watch?v=abc123";

const MERGE_SCRIPT: &str = r#"
sleep 0.5
echo "[download] Destination: $1/$2.f137.mp4"
echo "[download] 100% of 1.00MiB in 00:00:01 at 1.00MiB/s"
echo "[download] Destination: $1/$2.f140.m4a"
echo "[download] 100% of 1.00KiB in 00:00:01 at 1.00KiB/s"
echo "[Merger] Merging formats into \"$1/$2.mp4\""
printf 'merged-bytes' > "$1/$2.mp4"
"#;

struct PublicResolver;

#[async_trait]
impl HostResolver for PublicResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec!["93.184.216.34".parse().unwrap()])
    }
}

struct ScriptBackend {
    tracked_script: &'static str,
}

fn raw(id: &str, ext: &str, height: Option<u32>, vcodec: &str, acodec: &str) -> RawFormat {
    RawFormat {
        format_id: Some(id.to_string()),
        ext: Some(ext.to_string()),
        height,
        vcodec: Some(vcodec.to_string()),
        acodec: Some(acodec.to_string()),
        ..RawFormat::default()
    }
}

#[async_trait]
impl ExtractionBackend for ScriptBackend {
    fn name(&self) -> &str {
        "script"
    }

    async fn extract_metadata(&self, _url: &Url) -> Result<RawVideoInfo, AppError> {
        Ok(RawVideoInfo {
            title: Some("Clip".to_string()),
            duration: Some(42.0),
            formats: vec![
                raw("18", "mp4", Some(360), "avc1.42001E", "mp4a.40.2"),
                raw("137", "mp4", Some(1080), "avc1.640028", "none"),
                raw("140", "m4a", None, "none", "mp4a.40.2"),
            ],
            ..RawVideoInfo::default()
        })
    }

    fn download_command(&self, request: &DownloadRequest) -> Command {
        let mut cmd = Command::new("sh");
        match &request.target {
            OutputTarget::Directory { dir, stem } => {
                cmd.arg("-c").arg(self.tracked_script).arg("sh").arg(dir).arg(stem);
            }
            OutputTarget::Stdout => {
                cmd.arg("-c").arg("printf 'hello '; printf 'world'");
            }
        }
        cmd
    }
}

/// A running server; dropping it stops the listener.
struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    _shutdown: oneshot::Sender<()>,
    _work_dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(tracked_script: &'static str) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.tasks.work_dir = work_dir.path().to_path_buf();
        config.tasks.kill_grace = Duration::from_millis(500);

        let service = Arc::new(DownloadService::with_parts(
            config,
            Arc::new(ScriptBackend { tracked_script }),
            Arc::new(PublicResolver),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(web_server::serve(listener, service, async {
            let _ = rx.await;
        }));

        Self {
            addr,
            client: reqwest::Client::new(),
            _shutdown: tx,
            _work_dir: work_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn start_download(&self, format_id: &str) -> String {
        let resp = self
            .client
            .post(self.url("/api/v1/downloads"))
            .json(&serde_json::json!({ "url": VIDEO_URL, "format_id": format_id }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let body: Value = resp.json().await.unwrap();
        body["task_id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(MERGE_SCRIPT).await;
    let body: Value = server.client.get(server.url("/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_formats() {
    let server = TestServer::start(MERGE_SCRIPT).await;
    let resp = server
        .client
        .post(server.url("/api/v1/formats"))
        .json(&serde_json::json!({ "url": VIDEO_URL }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["title"], "Clip");
    assert_eq!(body["duration_seconds"], 42);
    assert_eq!(body["formats"][0]["id"], BEST_AVAILABLE_SELECTOR);
    assert_eq!(body["formats"][0]["mime_type"], "video/mp4");
}

#[tokio::test]
async fn test_error_bodies() {
    let server = TestServer::start(MERGE_SCRIPT).await;

    let resp = server
        .client
        .post(server.url("/api/v1/formats"))
        .json(&serde_json::json!({ "url": "ftp://video.example.com/x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_URL");

    let resp = server
        .client
        .post(server.url("/api/v1/formats"))
        .json(&serde_json::json!({ "url": "http://192.168.1.10/video" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .post(server.url("/api/v1/downloads"))
        .json(&serde_json::json!({ "url": VIDEO_URL, "format_id": "999" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "FORMAT_NOT_AVAILABLE");

    let resp = server.client.get(server.url("/api/v1/downloads/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_tracked_download_with_progress_events() {
    let server = TestServer::start(MERGE_SCRIPT).await;
    let id = server.start_download(BEST_AVAILABLE_SELECTOR).await;

    let resp = server
        .client
        .get(server.url(&format!("/api/v1/downloads/{}/events", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"].to_str().unwrap().starts_with("text/event-stream"));

    // The stream closes by itself after the terminal event
    let text = tokio::time::timeout(Duration::from_secs(15), resp.text()).await.unwrap().unwrap();
    let statuses: Vec<String> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str::<Value>(data.trim()).unwrap()["status"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(statuses.first().map(String::as_str), Some("pending"));
    assert_eq!(statuses.last().map(String::as_str), Some("completed"));
    assert!(statuses.iter().any(|s| s == "merging"));
    assert!(text.contains("event: progress"));

    for _ in 0..2 {
        let resp = server
            .client
            .get(server.url(&format!("/api/v1/downloads/{}/file", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "video/mp4");
        assert_eq!(resp.headers()["content-length"], "12");
        assert!(resp.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .starts_with("attachment; filename=\"Clip.mp4\""));
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"merged-bytes");
    }

    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/downloads/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let resp = server.client.get(server.url(&format!("/api/v1/downloads/{}", id))).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/downloads/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_file_before_completion_conflicts() {
    let server = TestServer::start("sleep 30").await;
    let id = server.start_download("18").await;

    let resp = server
        .client
        .get(server.url(&format!("/api/v1/downloads/{}/file", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");

    // Cancel the running task
    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/downloads/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "cancelled by client");

    // Now terminal, so a second DELETE removes it
    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/downloads/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn test_direct_download() {
    let server = TestServer::start(MERGE_SCRIPT).await;
    let url = Url::parse_with_params(
        &server.url("/api/v1/download"),
        &[("url", VIDEO_URL), ("format_id", "18")],
    )
    .unwrap();

    let resp = server.client.get(url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "video/mp4");
    assert!(resp.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains("filename*=UTF-8''Clip.mp4"));
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"hello world");
}

#[tokio::test]
async fn test_one_shot_merge_goes_through_a_task() {
    let server = TestServer::start(MERGE_SCRIPT).await;
    let resp = server
        .client
        .post(server.url("/api/v1/download"))
        .json(&serde_json::json!({ "url": VIDEO_URL, "format_id": BEST_AVAILABLE_SELECTOR }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"], "12");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"merged-bytes");
}
