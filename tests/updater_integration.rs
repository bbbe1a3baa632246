//! ═══════════════════════════════════════════════════════════════════
//! 설치 파이프라인 통합 테스트
//! ═══════════════════════════════════════════════════════════════════
//!
//! 1. **오프라인 경로** — 기본 호스트 장애 시 LAN 피드 호스트에서 설치
//! 2. **업로드 중** — 업로드 마커가 있으면 설치 중단
//! 3. **서버 오프라인** — 모든 경로 실패
//! 4. **업데이트** — 버전 비교 후 재설치 / 최신이면 생략
//!
//! 모든 테스트는 `tempdir`을 사용해 파일시스템을 격리합니다.

use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use station_launcher::config::LauncherConfig;
use station_updater_lib::pipeline::{PipelineEvent, TIME_CREATED_KEY};
use station_updater_lib::{
    generate_id, AppKind, EncryptedStore, InstallRequest, KeyProvider, LauncherEngine,
    PipelineError, TracingSink, UpdateStatus,
};

// ═══════════════════════════════════════════════════════
// 테스트 유틸리티
// ═══════════════════════════════════════════════════════

/// 파일 이름 → 내용 맵을 zip으로 패킹
fn create_test_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let buf = std::io::Cursor::new(Vec::new());
    let mut zip_writer = zip::ZipWriter::new(buf);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);

    for (name, content) in files {
        zip_writer.start_file(*name, options).unwrap();
        zip_writer.write_all(content.as_bytes()).unwrap();
    }

    let cursor = zip_writer.finish().unwrap();
    cursor.into_inner()
}

/// 경로 → 응답 본문 고정 서버. 없는 경로는 404
async fn start_file_server(files: HashMap<String, Vec<u8>>) -> SocketAddr {
    let files = Arc::new(files);
    let app = Router::new().fallback(move |uri: Uri| {
        let files = files.clone();
        async move {
            match files.get(uri.path()) {
                Some(body) => (StatusCode::OK, body.clone()).into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// 바인드 후 즉시 닫은 포트 (연결 거부)
fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn test_keys() -> KeyProvider {
    KeyProvider::from_keys("p".repeat(32), Some("b".repeat(32)))
}

fn launcher_config(app_dir: &Path, primary: SocketAddr, feed_port: Option<u16>) -> LauncherConfig {
    LauncherConfig {
        app_dir: app_dir.to_path_buf(),
        primary_host: format!("http://{}", primary),
        offline_port: feed_port.unwrap_or(1),
        feed_url: feed_port.map(|_| "http://127.0.0.1/feed".to_string()),
        legacy_base: None,
        probe_timeout_ms: 5000,
        helper_tools: vec!["nucleus".to_string()],
        ..LauncherConfig::default()
    }
}

fn engine(cfg: &LauncherConfig) -> LauncherEngine {
    LauncherEngine::new(cfg.engine_config(), test_keys(), Arc::new(TracingSink))
}

fn drain_statuses(
    events: &mut tokio::sync::broadcast::Receiver<PipelineEvent>,
    name: &str,
) -> Vec<String> {
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::Status { name: n, message } = event {
            if n == name {
                statuses.push(message);
            }
        }
    }
    statuses
}

// ═══════════════════════════════════════════════════════
// 테스트 1: 오프라인 경로로 Station 설치
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn station_installs_from_offline_feed_when_primary_is_down() {
    let mut files = HashMap::new();
    files.insert(
        "/Station.zip".to_string(),
        create_test_zip(&[
            ("Station.exe", "binary"),
            ("_logs/version.txt", "2.4.1"),
        ]),
    );
    files.insert(
        "/nucleus.zip".to_string(),
        create_test_zip(&[("nucleus.exe", "helper"), ("version.txt", "0.9.0")]),
    );
    let feed = start_file_server(files).await;

    let dir = TempDir::new().unwrap();
    let cfg = launcher_config(dir.path(), closed_addr(), Some(feed.port()));
    let engine = engine(&cfg);
    let mut events = engine.pipeline().subscribe();

    let install_dir = engine
        .install(&InstallRequest::new("Station", AppKind::Suite))
        .await
        .unwrap();
    assert_eq!(install_dir, dir.path().join("Station"));

    assert_eq!(
        drain_statuses(&mut events, "Station"),
        vec![
            "Hosting server offline",
            "Downloading",
            "Extracting complete",
            "Clean up complete",
        ]
    );

    // 압축 해제 후 아카이브 삭제
    assert_eq!(std::fs::read(install_dir.join("Station.exe")).unwrap(), b"binary");
    assert!(!install_dir.join("Station.zip").exists());

    // 생성 시각 기록 (암호화 저장)
    let store = EncryptedStore::new(Arc::new(test_keys()));
    let config = store
        .read_document(&install_dir.join("_config").join("config.env"))
        .await
        .unwrap();
    let created = config.get(TIME_CREATED_KEY).unwrap();
    assert!(created.contains('T'), "timestamp was {}", created);

    // 헬퍼 도구는 _embedded 아래에
    let helper_dir = install_dir.join("_embedded").join("nucleus");
    assert_eq!(std::fs::read(helper_dir.join("nucleus.exe")).unwrap(), b"helper");
    assert!(!helper_dir.join("nucleus.zip").exists());

    let entry = engine.manifest().find_by_name("Station").await.unwrap();
    assert_eq!(entry.id, generate_id("Station"));
    assert!(!engine.pipeline().download_state().is_downloading());
}

// ═══════════════════════════════════════════════════════
// 테스트 2: 업로드 중
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn upload_marker_aborts_install() {
    let mut files = HashMap::new();
    files.insert("/NUC-uploading".to_string(), b"1".to_vec());
    files.insert("/NUC.zip".to_string(), create_test_zip(&[("NUC.exe", "x")]));
    let primary = start_file_server(files).await;

    let dir = TempDir::new().unwrap();
    let cfg = launcher_config(dir.path(), primary, None);
    let engine = engine(&cfg);
    let mut events = engine.pipeline().subscribe();

    let err = engine
        .install(&InstallRequest::new("NUC", AppKind::Suite))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UploadInProgress));

    let statuses = drain_statuses(&mut events, "NUC");
    assert_eq!(statuses, vec![PipelineError::UploadInProgress.user_message()]);
    assert!(!dir.path().join("NUC").join("NUC.exe").exists());
    assert!(engine.manifest().find_by_name("NUC").await.is_none());
}

// ═══════════════════════════════════════════════════════
// 테스트 3: 모든 경로 실패
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn no_reachable_route_is_server_offline() {
    let dir = TempDir::new().unwrap();
    let mut cfg = launcher_config(dir.path(), closed_addr(), Some(closed_addr().port()));
    cfg.legacy_base = Some(format!("http://{}", closed_addr()));
    let engine = engine(&cfg);
    let mut events = engine.pipeline().subscribe();

    let err = engine
        .install(&InstallRequest::new("NUC", AppKind::Suite))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ServerOffline));
    assert_eq!(
        drain_statuses(&mut events, "NUC"),
        vec![
            "Hosting server offline".to_string(),
            PipelineError::ServerOffline.user_message(),
        ]
    );

    // 실패 후 다음 실행이 가능해야 한다
    assert!(!engine.pipeline().download_state().is_downloading());
}

// ═══════════════════════════════════════════════════════
// 테스트 4: 업데이트
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn embedded_tool_updates_only_when_remote_is_newer() {
    let mut files = HashMap::new();
    files.insert("/setvol-version".to_string(), b"1.2.0 volume fixes".to_vec());
    files.insert(
        "/setvol.zip".to_string(),
        create_test_zip(&[("setvol.exe", "new"), ("version.txt", "1.2.0")]),
    );
    let primary = start_file_server(files).await;

    let dir = TempDir::new().unwrap();
    let tool_dir = dir.path().join("setvol");
    std::fs::create_dir_all(&tool_dir).unwrap();
    std::fs::write(tool_dir.join("version.txt"), "1.0.3").unwrap();

    let cfg = launcher_config(dir.path(), primary, None);
    let engine = engine(&cfg);
    let request = InstallRequest::new("setvol", AppKind::Embedded);

    let outcome = engine.update(&request).await.unwrap();
    assert_eq!(outcome.status, UpdateStatus::Updated);
    assert_eq!(outcome.version_from, "1.0.3");
    assert_eq!(outcome.version_to, "1.2.0");
    assert_eq!(std::fs::read(tool_dir.join("setvol.exe")).unwrap(), b"new");

    // 두 번째 실행은 변경 없음
    let again = engine.update(&request).await.unwrap();
    assert_eq!(again.status, UpdateStatus::NoUpdateAvailable);
    assert_eq!(again.version_from, "1.2.0");
}

#[tokio::test]
async fn missing_version_endpoint_is_not_an_error() {
    let mut files = HashMap::new();
    files.insert("/setvol.zip".to_string(), create_test_zip(&[("setvol.exe", "new")]));
    let primary = start_file_server(files).await;

    let dir = TempDir::new().unwrap();
    let cfg = launcher_config(dir.path(), primary, None);
    let engine = engine(&cfg);

    let outcome = engine
        .update(&InstallRequest::new("setvol", AppKind::Embedded))
        .await
        .unwrap();
    assert_eq!(outcome.status, UpdateStatus::NoUpdateAvailable);
    assert!(!dir.path().join("setvol").join("setvol.exe").exists());
}
