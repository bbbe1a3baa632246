//! 에러 타입 정의
//!
//! ## 분류
//! - **StoreError**: 암호화 저장소 (복호화 실패는 백업/레거시 경로로 복구)
//! - **SyncError**: 원격 설정 동기화 (인증 실패 시 이번 사이클 중단, 재시도 없음)
//! - **VersionError**: 로컬/원격 버전 조회 ("업데이트 없음"으로 취급)
//! - **PipelineError**: 다운로드/설치 파이프라인 (경로 폴백 후에도 실패한 경우)

use serde::Serialize;
use thiserror::Error;

/// 머신 바인딩 백업 키를 얻을 수 없음 — 백업 경로만 건너뛴다
#[derive(Debug, Clone, Error, Serialize)]
#[error("Backup secret unavailable: {reason}")]
pub struct SecretUnavailable {
    pub reason: String,
}

/// 암호화 저장소 에러
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Encryption key must be 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("Blob is not valid UTF-16LE text")]
    Encoding,

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// 원격 설정 동기화 에러
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote bootstrap file is missing or unreadable")]
    MissingBootstrap,

    #[error("Remote bootstrap has {0} line(s), expected at least 2")]
    MalformedBootstrap(usize),

    #[error("Token exchange failed: {0}")]
    AuthFailure(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Remote store returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Local config could not be written: {0}")]
    LocalWrite(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            SyncError::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::NetworkUnavailable(err.to_string())
        }
    }

    /// 설정/네트워크 문제가 아닌 예기치 않은 실패 (텔레메트리 대상)
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            SyncError::LocalWrite(_) | SyncError::Io(_) | SyncError::Json(_)
        )
    }

    /// 사용자에게 표시할 상태 메시지
    pub fn user_message(&self) -> String {
        match self {
            SyncError::MissingBootstrap | SyncError::MalformedBootstrap(_) => {
                "Remote sync is not configured on this device".to_string()
            }
            SyncError::AuthFailure(_) => "Could not authenticate with the remote database".to_string(),
            SyncError::NetworkUnavailable(_) => "Remote database unreachable".to_string(),
            SyncError::Remote { status, .. } => format!("Remote database error ({})", status),
            SyncError::LocalWrite(_) | SyncError::Io(_) => "Could not save synchronized config".to_string(),
            SyncError::Json(_) => "Remote database returned malformed data".to_string(),
        }
    }
}

/// 버전 조회 에러
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Version unavailable: {0}")]
    Unavailable(String),

    #[error("Version endpoint unreachable: {0}")]
    Connection(String),

    #[error("Timed out after {waited_ms}ms waiting for {path}")]
    Timeout { path: String, waited_ms: u64 },

    #[error("Failed to launch '{exe}': {source}")]
    Spawn {
        exe: String,
        #[source]
        source: std::io::Error,
    },
}

/// 다운로드/설치 파이프라인 에러
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Another download is already in progress ({0})")]
    AlreadyDownloading(String),

    #[error("No download route is reachable")]
    ServerOffline,

    #[error("A new version is currently being published")]
    UploadInProgress,

    #[error("Online version fetch failed: {0}")]
    ConnectionFailed(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// 치명적이지 않음 — 로그만 남긴다
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("Post-install step failed: {0}")]
    PostInstall(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn from_reqwest(err: &reqwest::Error, operation: &str) -> Self {
        if err.is_timeout() {
            PipelineError::Download(format!("{} timed out", operation))
        } else if err.is_connect() {
            PipelineError::ConnectionFailed(format!("{}: connection refused", operation))
        } else {
            PipelineError::Download(format!("{}: {}", operation, err))
        }
    }

    /// 경로 폴백/재시도로 복구 가능한 에러인지
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::ServerOffline
                | PipelineError::UploadInProgress
                | PipelineError::ConnectionFailed(_)
                | PipelineError::Download(_)
                | PipelineError::AlreadyDownloading(_)
                | PipelineError::CleanupFailed(_)
        )
    }

    /// 사용자에게 표시할 상태 메시지
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::AlreadyDownloading(_) => "A download is already running".to_string(),
            PipelineError::ServerOffline => "Server offline, please try again later".to_string(),
            PipelineError::UploadInProgress => {
                "A new version is being uploaded, please try again in a few minutes".to_string()
            }
            PipelineError::ConnectionFailed(_) => "Could not connect to the update server".to_string(),
            PipelineError::Download(_) => "Download interrupted".to_string(),
            PipelineError::ExtractionFailed(_) => "Extraction failed".to_string(),
            PipelineError::CleanupFailed(_) => "Clean up failed".to_string(),
            PipelineError::PostInstall(_) => "Install finished with configuration errors".to_string(),
            PipelineError::Io(_) => "Could not write to the install directory".to_string(),
        }
    }
}
