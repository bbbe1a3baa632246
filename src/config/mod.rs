use std::path::{Path, PathBuf};

use serde::Deserialize;
use station_updater_lib::{EngineConfig, PipelineConfig, RemoteSyncConfig};

/// 설정 파일 경로를 덮어쓰는 환경 변수
pub const CONFIG_PATH_ENV: &str = "STATION_LAUNCHER_CONFIG";
/// 앱 설치 루트를 덮어쓰는 환경 변수
pub const APP_DIR_ENV: &str = "STATION_APP_DIR";
pub const DEFAULT_CONFIG_PATH: &str = "config/launcher.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LauncherConfig {
    pub app_dir: PathBuf,
    pub primary_host: String,
    pub offline_port: u16,
    /// LAN 피어 주소 (기본 호스트 장애 시 사용)
    pub feed_url: Option<String>,
    pub legacy_base: Option<String>,
    pub probe_timeout_ms: u64,
    pub remote_base: Option<String>,
    pub remote_collection: String,
    pub token_endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Station 설치 시 함께 받는 도구
    pub helper_tools: Vec<String>,
    /// 다운로드 상태 채널 (기본: 런타임 디렉터리의 소켓 / named pipe)
    pub ipc_socket: Option<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            app_dir: PathBuf::from("./apps"),
            primary_host: "https://downloads.station.local".to_string(),
            offline_port: 8089,
            feed_url: None,
            legacy_base: None,
            probe_timeout_ms: 5000,
            remote_base: None,
            remote_collection: "stations".to_string(),
            token_endpoint: None,
            api_key: None,
            helper_tools: vec!["nucleus".to_string(), "setvol".to_string()],
            ipc_socket: None,
        }
    }
}

impl LauncherConfig {
    /// `STATION_LAUNCHER_CONFIG` 또는 `config/launcher.toml`. 파일이 없으면 기본값
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        if let Ok(dir) = std::env::var(APP_DIR_ENV) {
            if !dir.trim().is_empty() {
                cfg.app_dir = PathBuf::from(dir);
            }
        }
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("[Config] {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let cfg: Self = toml::from_str(&s)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(cfg)
    }

    /// 원격 동기화는 저장소 주소와 토큰 엔드포인트가 모두 있을 때만 활성
    pub fn remote_sync(&self) -> Option<RemoteSyncConfig> {
        let remote_base = self.remote_base.clone().filter(|s| !s.is_empty())?;
        let token_endpoint = self.token_endpoint.clone().filter(|s| !s.is_empty())?;
        Some(RemoteSyncConfig {
            remote_base,
            collection: self.remote_collection.clone(),
            token_endpoint,
            api_key: self.api_key.clone(),
        })
    }

    pub fn ipc_endpoint(&self) -> String {
        self.ipc_socket
            .clone()
            .unwrap_or_else(station_updater_lib::ipc::default_endpoint)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pipeline: PipelineConfig {
                app_dir: self.app_dir.clone(),
                primary_host: self.primary_host.clone(),
                offline_port: self.offline_port,
                feed_url: self.feed_url.clone(),
                legacy_base: self.legacy_base.clone(),
                helper_tools: self.helper_tools.clone(),
            },
            probe_timeout_ms: self.probe_timeout_ms,
            remote: self.remote_sync(),
            data_dir: self.app_dir.join("_data"),
        }
    }
}
