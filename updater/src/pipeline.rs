//! 다운로드/설치 파이프라인
//!
//! `Idle → RoutingSource → Downloading → Extracting → PostInstall → Idle`
//! (어느 단계에서든 `Failed → Idle`).
//!
//! ## 경로 선택 순서
//! 1. 업로드 마커(`{host}/{route}-uploading`)가 있으면 `UploadInProgress`
//! 2. 기본 호스트
//! 3. 피드 URL 호스트의 오프라인 포트 (LAN)
//! 4. 레거시 경로 `{legacy}/{route}/{route}.zip`, `{legacy}/{route}.zip`
//! 5. 모두 실패 시 `ServerOffline`
//!
//! 단계는 순서대로 await되며, 동시에 하나의 실행만 허용된다 (`DownloadState`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::error::{PipelineError, VersionError};
use crate::ipc::{DownloadGuard, DownloadState, DownloadStateReader};
use crate::probe::AvailabilityProbe;
use crate::store::EncryptedStore;
use crate::telemetry::{report_detached, TelemetrySink};
use crate::version::{compare, VersionResolver};
use crate::{AppKind, InstallRequest, UpdateOutcome, UpdateStatus};

/// 헬퍼 도구를 함께 설치하는 오케스트레이션 앱
pub const ORCHESTRATOR_APP: &str = "Station";
/// 설치 후 기록하는 생성 시각 키
pub const TIME_CREATED_KEY: &str = "TIME_CREATED";

pub const STATUS_HOST_OFFLINE: &str = "Hosting server offline";
pub const STATUS_DOWNLOADING: &str = "Downloading";
pub const STATUS_EXTRACTED: &str = "Extracting complete";
pub const STATUS_CLEANED: &str = "Clean up complete";
pub const STATUS_NO_UPDATE: &str = "No update available";

const EVENT_CAPACITY: usize = 256;

/// 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 앱 설치 루트 (`<app_dir>/<name>`)
    pub app_dir: PathBuf,
    /// 예: "https://downloads.example.com/station"
    pub primary_host: String,
    /// LAN 피어가 아카이브를 제공하는 포트
    pub offline_port: u16,
    /// LAN 피어 주소 (없으면 오프라인 경로 생략)
    #[serde(default)]
    pub feed_url: Option<String>,
    /// 레거시 고정 경로 베이스 (없으면 레거시 경로 생략)
    #[serde(default)]
    pub legacy_base: Option<String>,
    /// Station 설치 후 `_embedded/` 아래에 설치할 도구
    #[serde(default)]
    pub helper_tools: Vec<String>,
}

/// 파이프라인 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    RoutingSource,
    Downloading,
    Extracting,
    PostInstall,
    Failed,
}

/// 구독자에게 전달되는 이벤트
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Stage { name: String, stage: PipelineStage },
    Status { name: String, message: String },
    Progress { name: String, percent: f64 },
}

/// 아카이브 출처
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Primary,
    Offline,
    Legacy,
}

/// 선택된 다운로드 경로
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source: RouteSource,
    /// 경로 이름 (아카이브 파일 이름)
    pub name: String,
    pub archive_url: String,
    pub version_url: String,
}

/// 다운로드 한 건
pub struct DownloadSession {
    pub url: String,
    pub destination: PathBuf,
    pub on_progress: Option<Box<dyn Fn(f64) + Send + Sync>>,
}

impl std::fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSession")
            .field("url", &self.url)
            .field("destination", &self.destination)
            .finish()
    }
}

pub struct DownloadInstallPipeline {
    config: PipelineConfig,
    http: reqwest::Client,
    probe: AvailabilityProbe,
    resolver: VersionResolver,
    store: EncryptedStore,
    state: DownloadState,
    events: broadcast::Sender<PipelineEvent>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl DownloadInstallPipeline {
    pub fn new(
        config: PipelineConfig,
        probe: AvailabilityProbe,
        resolver: VersionResolver,
        store: EncryptedStore,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        // 대용량 아카이브를 받으므로 전체 타임아웃 없이 연결 타임아웃만 둔다
        let http = reqwest::Client::builder()
            .user_agent("station-launcher/1.0")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("[Pipeline] Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            http,
            probe,
            resolver,
            store,
            state: DownloadState::new(),
            events,
            telemetry,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// 다운로드 상태 읽기 핸들 (IPC 채널용)
    pub fn download_state(&self) -> DownloadStateReader {
        self.state.reader()
    }

    pub fn install_dir(&self, name: &str) -> PathBuf {
        self.config.app_dir.join(name)
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.install_dir(name).join("_config").join("config.env")
    }

    // ─────── 공개 동작 ───────────────────────────────────────

    /// 새로 설치. 설치 디렉터리를 반환
    pub async fn install(&self, request: &InstallRequest) -> Result<PathBuf, PipelineError> {
        let _guard = self.begin(&request.name)?;
        tracing::info!("[Pipeline] Installing {} ({:?})", request.name, request.kind);
        let result = self.run_install(request, None).await;
        self.finish(&request.name, "install", result)
    }

    /// 원격 버전이 더 새로우면 재설치
    pub async fn update(&self, request: &InstallRequest) -> Result<UpdateOutcome, PipelineError> {
        let _guard = self.begin(&request.name)?;
        let result = self.run_update(request).await;
        self.finish(&request.name, "update", result)
    }

    // ─────── 경로 선택 ───────────────────────────────────────

    /// 우선순위 순 후보 경로
    pub fn candidate_routes(&self, request: &InstallRequest) -> Vec<Route> {
        let route = request.name.as_str();
        let host = self.primary_host(request);
        let template = request.url_template.as_deref().unwrap_or("{host}/{route}.zip");

        let mut routes = vec![Route {
            source: RouteSource::Primary,
            name: route.to_string(),
            archive_url: template.replace("{host}", host).replace("{route}", route),
            version_url: format!("{}/{}-version", host, route),
        }];

        if let Some(feed_host) = self.config.feed_url.as_deref().and_then(feed_host) {
            let base = format!("http://{}:{}", feed_host, self.config.offline_port);
            routes.push(Route {
                source: RouteSource::Offline,
                name: route.to_string(),
                archive_url: format!("{}/{}.zip", base, route),
                version_url: format!("{}/{}-version", base, route),
            });
        }

        if let Some(legacy) = self.config.legacy_base.as_deref() {
            let legacy = legacy.trim_end_matches('/');
            routes.push(Route {
                source: RouteSource::Legacy,
                name: route.to_string(),
                archive_url: format!("{}/{}/{}.zip", legacy, route, route),
                version_url: format!("{}/{}/{}-version", legacy, route, route),
            });
            routes.push(Route {
                source: RouteSource::Legacy,
                name: route.to_string(),
                archive_url: format!("{}/{}.zip", legacy, route),
                version_url: format!("{}/{}-version", legacy, route),
            });
        }

        routes
    }

    pub async fn resolve_route(&self, request: &InstallRequest) -> Result<Route, PipelineError> {
        let marker = format!("{}/{}-uploading", self.primary_host(request), request.name);
        if self.probe.is_reachable(&marker).await {
            tracing::warn!("[Pipeline] {} is being published, aborting", request.name);
            return Err(PipelineError::UploadInProgress);
        }

        for route in self.candidate_routes(request) {
            if self.probe.is_reachable(&route.archive_url).await {
                tracing::info!("[Pipeline] {} route selected: {}", request.name, route.archive_url);
                return Ok(route);
            }
            tracing::warn!("[Pipeline] {:?} route unreachable: {}", route.source, route.archive_url);
            if route.source == RouteSource::Primary {
                self.status(&request.name, STATUS_HOST_OFFLINE);
            }
        }

        Err(PipelineError::ServerOffline)
    }

    // ─────── 단계 ────────────────────────────────────────────

    /// 아카이브를 스트리밍으로 받으며 진행률(%) 콜백 호출
    pub async fn download(&self, session: &DownloadSession) -> Result<PathBuf, PipelineError> {
        let resp = self
            .http
            .get(&session.url)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest(&e, "download"))?;
        if !resp.status().is_success() {
            return Err(PipelineError::Download(format!(
                "{} returned {}",
                session.url,
                resp.status()
            )));
        }

        let total = resp.content_length().filter(|t| *t > 0);
        if let Some(parent) = session.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&session.destination).await?;
        let mut stream = resp.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::from_reqwest(&e, "download"))?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let (Some(total), Some(cb)) = (total, session.on_progress.as_ref()) {
                cb(received as f64 / total as f64 * 100.0);
            }
        }
        file.flush().await?;

        // 길이를 모르면 완료 시점에만 보고
        if let (None, Some(cb)) = (total, session.on_progress.as_ref()) {
            cb(100.0);
        }

        tracing::debug!("[Pipeline] Downloaded {} bytes to {}", received, session.destination.display());
        Ok(session.destination.clone())
    }

    /// 다운로드 → 압축 해제 → 아카이브 삭제
    async fn fetch_and_unpack(&self, name: &str, route: &Route, target_dir: &Path) -> Result<(), PipelineError> {
        self.stage(name, PipelineStage::Downloading);
        self.status(name, STATUS_DOWNLOADING);

        let events = self.events.clone();
        let progress_name = name.to_string();
        let session = DownloadSession {
            url: route.archive_url.clone(),
            destination: target_dir.join(format!("{}.zip", route.name)),
            on_progress: Some(Box::new(move |percent| {
                let _ = events.send(PipelineEvent::Progress {
                    name: progress_name.clone(),
                    percent,
                });
            })),
        };
        let archive = self.download(&session).await?;

        self.stage(name, PipelineStage::Extracting);
        let archive_path = archive.clone();
        let target = target_dir.to_path_buf();
        let count = tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target))
            .await
            .map_err(|e| PipelineError::ExtractionFailed(e.to_string()))??;
        tracing::info!("[Pipeline] Extracted {} entries into {}", count, target_dir.display());
        self.status(name, STATUS_EXTRACTED);

        match tokio::fs::remove_file(&archive).await {
            Ok(()) => self.status(name, STATUS_CLEANED),
            Err(e) => self.soft_fail(
                name,
                PipelineError::CleanupFailed(format!("{}: {}", archive.display(), e)),
            ),
        }
        Ok(())
    }

    async fn run_install(&self, request: &InstallRequest, route: Option<Route>) -> Result<PathBuf, PipelineError> {
        let install_dir = self.install_dir(&request.name);
        let route = match route {
            Some(route) => route,
            None => {
                self.stage(&request.name, PipelineStage::RoutingSource);
                self.resolve_route(request).await?
            }
        };

        tokio::fs::create_dir_all(&install_dir).await?;
        self.fetch_and_unpack(&request.name, &route, &install_dir).await?;

        self.stage(&request.name, PipelineStage::PostInstall);
        self.post_install(request, &install_dir).await;
        Ok(install_dir)
    }

    /// 생성 시각 기록 + Station 헬퍼 도구 설치. 실패는 기록만 한다
    async fn post_install(&self, request: &InstallRequest, install_dir: &Path) {
        let config_path = self.config_path(&request.name);
        let now = chrono::Utc::now().to_rfc3339();
        if !self.store.set_value(&config_path, TIME_CREATED_KEY, &now).await {
            self.soft_fail(
                &request.name,
                PipelineError::PostInstall(format!("could not stamp {}", config_path.display())),
            );
        }

        if request.kind != AppKind::Suite || request.name != ORCHESTRATOR_APP {
            return;
        }

        for tool in &self.config.helper_tools {
            let helper = InstallRequest {
                name: tool.clone(),
                kind: AppKind::Embedded,
                host: request.host.clone(),
                url_template: None,
            };
            let target = install_dir.join("_embedded").join(tool);
            tracing::info!("[Pipeline] Installing helper tool {} into {}", tool, target.display());

            let result = async {
                let route = self.resolve_route(&helper).await?;
                tokio::fs::create_dir_all(&target).await?;
                self.fetch_and_unpack(tool, &route, &target).await
            }
            .await;

            if let Err(e) = result {
                self.soft_fail(
                    &request.name,
                    PipelineError::PostInstall(format!("helper {}: {}", tool, e)),
                );
            }
        }
    }

    async fn run_update(&self, request: &InstallRequest) -> Result<UpdateOutcome, PipelineError> {
        if request.kind == AppKind::Imported {
            return Ok(UpdateOutcome::no_update(String::new(), String::new()));
        }

        let install_dir = self.install_dir(&request.name);
        let local = match self
            .resolver
            .resolve_local_version(&install_dir, request.kind, &request.name)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[Pipeline] {} local version unavailable: {}", request.name, e);
                self.status(&request.name, STATUS_NO_UPDATE);
                return Ok(UpdateOutcome::no_update(String::new(), String::new()));
            }
        };

        self.stage(&request.name, PipelineStage::RoutingSource);
        let route = self.resolve_route(request).await?;

        let remote = match self.resolver.resolve_remote_version(&route.version_url).await {
            Ok(v) => v,
            Err(VersionError::Connection(msg)) => return Err(PipelineError::ConnectionFailed(msg)),
            Err(e) => {
                tracing::info!("[Pipeline] {} remote version unavailable: {}", request.name, e);
                self.status(&request.name, STATUS_NO_UPDATE);
                return Ok(UpdateOutcome::no_update(local, String::new()));
            }
        };

        let comparison = compare(&remote, &local);
        if !comparison.is_newer {
            tracing::info!("[Pipeline] {} is up to date ({})", request.name, local);
            self.status(&request.name, STATUS_NO_UPDATE);
            return Ok(UpdateOutcome::no_update(local, remote));
        }
        match comparison.change {
            Some(change) => tracing::info!(
                "[Pipeline] {} {} update available: {} -> {}",
                request.name,
                change,
                local,
                remote
            ),
            None => tracing::info!("[Pipeline] {} not installed, installing {}", request.name, remote),
        }

        self.run_install(request, Some(route)).await?;
        let status = if local.is_empty() {
            UpdateStatus::Installed
        } else {
            UpdateStatus::Updated
        };
        Ok(UpdateOutcome {
            status,
            version_from: local,
            version_to: remote,
        })
    }

    // ─────── 내부 ────────────────────────────────────────────

    fn primary_host<'a>(&'a self, request: &'a InstallRequest) -> &'a str {
        request
            .host
            .as_deref()
            .unwrap_or(&self.config.primary_host)
            .trim_end_matches('/')
    }

    fn begin(&self, name: &str) -> Result<DownloadGuard, PipelineError> {
        match self.state.try_begin(name) {
            Some(guard) => Ok(guard),
            None => {
                let current = self.state.snapshot().current.unwrap_or_default();
                tracing::warn!("[Pipeline] {} rejected, {} is downloading", name, current);
                Err(PipelineError::AlreadyDownloading(current))
            }
        }
    }

    fn finish<T>(&self, name: &str, operation: &str, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(e) = &result {
            self.stage(name, PipelineStage::Failed);
            self.status(name, &e.user_message());
            if e.is_recoverable() {
                tracing::warn!("[Pipeline] {} {} failed: {}", operation, name, e);
            } else {
                tracing::error!("[Pipeline] {} {} failed: {}", operation, name, e);
                report_detached(&self.telemetry, operation, e.to_string());
            }
        }
        self.stage(name, PipelineStage::Idle);
        result
    }

    fn soft_fail(&self, name: &str, err: PipelineError) {
        tracing::warn!("[Pipeline] {}: {}", name, err);
        self.status(name, &err.user_message());
        if !err.is_recoverable() {
            report_detached(&self.telemetry, "post_install", err.to_string());
        }
    }

    fn stage(&self, name: &str, stage: PipelineStage) {
        let _ = self.events.send(PipelineEvent::Stage {
            name: name.to_string(),
            stage,
        });
    }

    fn status(&self, name: &str, message: &str) {
        tracing::info!("[Pipeline] {}: {}", name, message);
        let _ = self.events.send(PipelineEvent::Status {
            name: name.to_string(),
            message: message.to_string(),
        });
    }
}

/// 피드 URL에서 호스트 부분만 추출 (`http://10.0.0.5:8080/x` → `10.0.0.5`)
pub fn feed_host(feed: &str) -> Option<String> {
    let feed = feed.trim();
    if feed.is_empty() {
        return None;
    }
    if let Ok(url) = reqwest::Url::parse(feed) {
        if let Some(host) = url.host_str() {
            return Some(host.to_string());
        }
    }
    feed.trim_end_matches('/')
        .split(['/', ':'])
        .find(|part| !part.is_empty())
        .map(str::to_string)
}

/// zip 아카이브를 `target_dir`에 풀고 항목 수를 반환
pub fn extract_archive(archive: &Path, target_dir: &Path) -> Result<usize, PipelineError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| PipelineError::ExtractionFailed(format!("{}: {}", archive.display(), e)))?;

    let mut extracted = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| PipelineError::ExtractionFailed(e.to_string()))?;
        let name = entry.name().to_string();
        // 절대 경로, `..`, NUL 포함 항목은 대상 디렉터리 밖으로 나갈 수 있음
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!("[Pipeline] Skipping unsafe archive entry: {}", name);
            continue;
        };
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut outfile)
                .map_err(|e| PipelineError::ExtractionFailed(format!("{}: {}", name, e)))?;
        }
        extracted += 1;
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::KeyProvider;
    use crate::telemetry::TracingSink;
    use std::io::Write;

    fn pipeline(config: PipelineConfig) -> DownloadInstallPipeline {
        let keys = KeyProvider::from_keys("p".repeat(32), Some("b".repeat(32)));
        DownloadInstallPipeline::new(
            config,
            AvailabilityProbe::new(Duration::from_millis(500)),
            VersionResolver::new(Duration::from_secs(2)),
            EncryptedStore::new(Arc::new(keys)),
            Arc::new(TracingSink),
        )
    }

    fn config(app_dir: &Path) -> PipelineConfig {
        PipelineConfig {
            app_dir: app_dir.to_path_buf(),
            primary_host: "https://dl.example.com/".to_string(),
            offline_port: 8089,
            feed_url: Some("http://192.168.0.20/feed".to_string()),
            legacy_base: Some("https://legacy.example.com".to_string()),
            helper_tools: Vec::new(),
        }
    }

    fn request(name: &str) -> InstallRequest {
        InstallRequest {
            name: name.to_string(),
            kind: AppKind::Suite,
            host: None,
            url_template: None,
        }
    }

    #[test]
    fn routes_follow_fallback_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(config(dir.path()));
        let routes = p.candidate_routes(&request("NUC"));
        let urls: Vec<&str> = routes.iter().map(|r| r.archive_url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://dl.example.com/NUC.zip",
                "http://192.168.0.20:8089/NUC.zip",
                "https://legacy.example.com/NUC/NUC.zip",
                "https://legacy.example.com/NUC.zip",
            ]
        );
        assert_eq!(routes[0].version_url, "https://dl.example.com/NUC-version");
        assert_eq!(routes[1].source, RouteSource::Offline);
    }

    #[test]
    fn url_template_and_host_override_apply_to_primary() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.feed_url = None;
        cfg.legacy_base = None;
        let p = pipeline(cfg);
        let mut req = request("Station");
        req.host = Some("http://mirror.local".to_string());
        req.url_template = Some("{host}/builds/{route}-latest.zip".to_string());

        let routes = p.candidate_routes(&req);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].archive_url, "http://mirror.local/builds/Station-latest.zip");
    }

    #[test]
    fn feed_host_accepts_urls_and_bare_hosts() {
        assert_eq!(feed_host("http://10.0.0.5:8080/feed").as_deref(), Some("10.0.0.5"));
        assert_eq!(feed_host("10.0.0.5").as_deref(), Some("10.0.0.5"));
        assert_eq!(feed_host("10.0.0.5:8080").as_deref(), Some("10.0.0.5"));
        assert_eq!(feed_host("  ").as_deref(), None);
    }

    #[test]
    fn extraction_skips_parent_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("bundle.zip");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            zip.start_file("bin/app.txt", options).unwrap();
            zip.write_all(b"payload").unwrap();
            zip.start_file("../escape.txt", options).unwrap();
            zip.write_all(b"nope").unwrap();
            zip.finish().unwrap();
        }

        let target = dir.path().join("out");
        let count = extract_archive(&archive, &target).unwrap();
        assert_eq!(count, 1);
        assert_eq!(std::fs::read_to_string(target.join("bin/app.txt")).unwrap(), "payload");
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn extraction_skips_absolute_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let outside = dir.path().join("outside");
        let absolute = outside.join("planted.txt");
        let archive = dir.path().join("bundle.zip");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            zip.start_file(absolute.to_string_lossy(), options).unwrap();
            zip.write_all(b"nope").unwrap();
            zip.start_file("app.txt", options).unwrap();
            zip.write_all(b"payload").unwrap();
            zip.finish().unwrap();
        }

        let target = dir.path().join("out");
        let count = extract_archive(&archive, &target).unwrap();
        assert_eq!(count, 1);
        assert!(!absolute.exists());
        assert!(!outside.exists());
        assert_eq!(std::fs::read_to_string(target.join("app.txt")).unwrap(), "payload");
    }

    #[tokio::test]
    async fn download_without_length_reports_completion() {
        use axum::body::{Body, Bytes};
        use axum::routing::get;
        use std::sync::Mutex;

        // 스트림 본문은 Content-Length 없이 chunked로 전송됨
        let app = axum::Router::new().route(
            "/NUC.zip",
            get(|| async {
                let chunks = vec![
                    Ok::<_, std::io::Error>(Bytes::from_static(b"part-one")),
                    Ok(Bytes::from_static(b"part-two")),
                ];
                Body::from_stream(futures_util::stream::iter(chunks))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(config(dir.path()));
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let session = DownloadSession {
            url: format!("http://{}/NUC.zip", addr),
            destination: dir.path().join("NUC.zip"),
            on_progress: Some(Box::new(move |percent| sink.lock().unwrap().push(percent))),
        };

        let path = p.download(&session).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"part-onepart-two");
        assert_eq!(*reported.lock().unwrap(), vec![100.0]);
    }

    #[test]
    fn corrupt_archive_is_extraction_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        let err = extract_archive(&archive, dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionFailed(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_downloading() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(config(dir.path()));
        let _guard = p.begin("Station").unwrap();
        let err = p.install(&request("NUC")).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyDownloading(ref who) if who == "Station"));
        assert!(p.download_state().is_downloading());
    }

    #[tokio::test]
    async fn imported_apps_are_never_updated() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = pipeline(config(dir.path()));
        let mut req = request("Blender");
        req.kind = AppKind::Imported;
        let outcome = p.update(&req).await.unwrap();
        assert_eq!(outcome.status, UpdateStatus::NoUpdateAvailable);
        assert!(!p.download_state().is_downloading());
    }
}
