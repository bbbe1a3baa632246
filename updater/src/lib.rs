//! # Station 런처 엔진
//!
//! 앱 다운로드/설치/업데이트, 암호화 설정 저장소, 원격 설정 동기화를 담당합니다.
//!
//! ## 구성
//! - **secret.rs**: 머신 고유 키 (MAC / 프로세서 id)
//! - **store.rs / document.rs**: AES-256-CBC 이중 파일 저장소와 `KEY=VALUE` 문서
//! - **remote.rs**: refresh token 교환, 설정 병합, 데이터셋 워터마크 동기화
//! - **probe.rs**: 호스트 가용성 확인
//! - **version.rs**: 로컬/원격 버전 해석과 앱 버전 비교
//! - **pipeline.rs**: 경로 선택 → 다운로드 → 압축 해제 → 정리 → 설치 후 작업
//! - **manifest.rs**: 설치된 앱 목록
//! - **ipc.rs**: 다운로드 상태 공유 채널 (워치독용)
//! - **telemetry.rs**: 크래시 보고 싱크
//!
//! ## 디렉터리 구조
//! ```text
//! <app_dir>/
//!   manifest.json (+ manifest_backup.json)
//!   Station/
//!     _config/config.env, remote-config.env (+ *_backup.env)
//!     _embedded/<tool>/
//!   <name>/
//!     _config/config.env
//! ```

// ══════════════════════════════════════════════════════
// 모듈
// ══════════════════════════════════════════════════════

pub mod document;
pub mod error;
pub mod ipc;
pub mod manifest;
pub mod pipeline;
pub mod probe;
pub mod remote;
pub mod secret;
pub mod store;
pub mod telemetry;
pub mod version;


// Re-exports for convenience
pub use document::ConfigDocument;
pub use error::{PipelineError, SecretUnavailable, StoreError, SyncError, VersionError};
pub use ipc::{DownloadSnapshot, DownloadState, DownloadStateReader};
pub use manifest::{generate_id, AppManifestEntry, ManifestStore};
pub use pipeline::{DownloadInstallPipeline, PipelineConfig, PipelineEvent, PipelineStage};
pub use probe::AvailabilityProbe;
pub use remote::{DatasetWatermark, RemoteConfigSync, RemoteSyncConfig, SyncDirection};
pub use secret::KeyProvider;
pub use store::EncryptedStore;
pub use telemetry::{TelemetrySink, TracingSink};
pub use version::{compare, ChangeMagnitude, VersionResolver};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::telemetry::report_detached;

// ══════════════════════════════════════════════════════
// 요청/응답 레코드
// ══════════════════════════════════════════════════════

/// 앱 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// 스위트 앱 (Station, NUC). `writeversion`으로 버전 기록
    Suite,
    /// 임베디드 도구. `version.txt` 동봉
    Embedded,
    /// 사용자가 가져온 실행 파일. 업데이트 대상 아님
    Imported,
}

/// 설치/업데이트 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub name: String,
    pub kind: AppKind,
    /// 기본 호스트 대신 사용할 호스트
    #[serde(default)]
    pub host: Option<String>,
    /// 기본 경로 아카이브 URL 템플릿 (`{host}`, `{route}`). 기본값 `{host}/{route}.zip`
    #[serde(default)]
    pub url_template: Option<String>,
}

impl InstallRequest {
    pub fn new(name: impl Into<String>, kind: AppKind) -> Self {
        Self {
            name: name.into(),
            kind,
            host: None,
            url_template: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Installed,
    Updated,
    /// 오류가 아닌 정상 종료
    NoUpdateAvailable,
}

/// 업데이트 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub status: UpdateStatus,
    pub version_from: String,
    pub version_to: String,
}

impl UpdateOutcome {
    pub fn no_update(version_from: String, version_to: String) -> Self {
        Self {
            status: UpdateStatus::NoUpdateAvailable,
            version_from,
            version_to,
        }
    }
}

// ══════════════════════════════════════════════════════
// 엔진
// ══════════════════════════════════════════════════════

/// 엔진 설정
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub probe_timeout_ms: u64,
    /// 없으면 원격 동기화 비활성
    pub remote: Option<RemoteSyncConfig>,
    /// 보조 데이터셋 디렉터리
    pub data_dir: PathBuf,
}

/// 모든 구성요소를 하나의 `KeyProvider`로 묶은 진입점
pub struct LauncherEngine {
    store: EncryptedStore,
    pipeline: Arc<DownloadInstallPipeline>,
    sync: Option<RemoteConfigSync>,
    manifest: ManifestStore,
    telemetry: Arc<dyn TelemetrySink>,
}

impl LauncherEngine {
    pub fn new(config: EngineConfig, keys: KeyProvider, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let store = EncryptedStore::new(Arc::new(keys));
        let app_dir = config.pipeline.app_dir.clone();

        let probe = AvailabilityProbe::with_clamped_timeout(config.probe_timeout_ms);
        let resolver = VersionResolver::new(probe.timeout() * 3);
        let pipeline = Arc::new(DownloadInstallPipeline::new(
            config.pipeline,
            probe,
            resolver,
            store.clone(),
            telemetry.clone(),
        ));

        let sync = config.remote.map(|remote| {
            RemoteConfigSync::new(
                remote,
                store.clone(),
                Self::bootstrap_path(&app_dir),
                app_dir.clone(),
                config.data_dir.clone(),
            )
        });
        if sync.is_none() {
            tracing::info!("[Engine] Remote sync not configured");
        }

        let manifest = ManifestStore::new(app_dir.join("manifest.json"), store.clone());

        Self {
            store,
            pipeline,
            sync,
            manifest,
            telemetry,
        }
    }

    /// 원격 인증 정보 파일 (`Station/_config/remote-config.env`)
    pub fn bootstrap_path(app_dir: &Path) -> PathBuf {
        app_dir
            .join(pipeline::ORCHESTRATOR_APP)
            .join("_config")
            .join("remote-config.env")
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    pub fn pipeline(&self) -> Arc<DownloadInstallPipeline> {
        self.pipeline.clone()
    }

    pub fn sync(&self) -> Option<&RemoteConfigSync> {
        self.sync.as_ref()
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// 설치 후 manifest에 등록
    pub async fn install(&self, request: &InstallRequest) -> Result<PathBuf, PipelineError> {
        let dir = self.pipeline.install(request).await?;
        self.register(request).await;
        Ok(dir)
    }

    pub async fn update(&self, request: &InstallRequest) -> Result<UpdateOutcome, PipelineError> {
        let outcome = self.pipeline.update(request).await?;
        if outcome.status == UpdateStatus::Installed {
            self.register(request).await;
        }
        Ok(outcome)
    }

    /// 설치 디렉터리와 manifest 항목 삭제
    pub async fn uninstall(&self, name: &str) -> anyhow::Result<()> {
        let dir = self.pipeline.install_dir(name);
        if tokio::fs::metadata(&dir).await.is_ok() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        self.manifest.remove(&generate_id(name)).await?;
        tracing::info!("[Engine] Uninstalled {}", name);
        Ok(())
    }

    /// 원격 설정을 가져와 로컬 설정에 병합
    pub async fn sync_config(&self, app_id: &str) -> Result<usize, SyncError> {
        let sync = self.sync.as_ref().ok_or(SyncError::MissingBootstrap)?;
        let result = sync.pull_and_merge_config(app_id).await;
        self.report_sync_failure("sync_config", &result);
        result
    }

    pub async fn sync_dataset(&self, dataset: &str) -> Result<SyncDirection, SyncError> {
        let sync = self.sync.as_ref().ok_or(SyncError::MissingBootstrap)?;
        let result = sync.reconcile_dataset(dataset).await;
        self.report_sync_failure("sync_dataset", &result);
        result
    }

    fn report_sync_failure<T>(&self, operation: &str, result: &Result<T, SyncError>) {
        if let Err(e) = result {
            if e.is_unexpected() {
                report_detached(&self.telemetry, operation, e.to_string());
            }
        }
    }

    async fn register(&self, request: &InstallRequest) {
        if self.manifest.find_by_name(&request.name).await.is_some() {
            return;
        }
        let entry = AppManifestEntry::new(request.kind, &request.name);
        if let Err(e) = self.manifest.upsert(entry).await {
            tracing::warn!("[Engine] Could not register {} in manifest: {}", request.name, e);
        }
    }
}
