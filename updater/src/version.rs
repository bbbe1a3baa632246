//! 버전 해석 및 비교
//!
//! - 로컬 버전: 스위트 앱은 `<exe> writeversion` 실행 후 `_logs/version.txt`를 폴링,
//!   임베디드 도구는 `version.txt`를 직접 읽는다. 파일이 없으면 빈 문자열.
//! - 원격 버전: 버전 엔드포인트 응답의 첫 토큰
//! - 비교: `AppVersion` 순서. 변경 크기(major/minor/patch)는 표시용 라벨일 뿐이다.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::VersionError;
use crate::AppKind;

/// 앱 빌드 버전 `major.minor[.patch][-label]`. 라벨이 붙은 빌드는 같은 번호의 정식 빌드보다 낮다
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVersion {
    release: [u64; 3],
    label: Option<String>,
}

impl FromStr for AppVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::Unavailable(format!("'{}' is not a version", s));
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let (numbers, label) = match trimmed.split_once(['-', '+']) {
            Some((numbers, label)) => (numbers, Some(label.to_string()).filter(|l| !l.is_empty())),
            None => (trimmed, None),
        };

        let mut release = [0u64; 3];
        let mut count = 0;
        for part in numbers.split('.') {
            let slot = release.get_mut(count).ok_or_else(invalid)?;
            *slot = part.parse().map_err(|_| invalid())?;
            count += 1;
        }
        if count < 2 {
            return Err(invalid());
        }
        Ok(Self { release, label })
    }
}

impl AppVersion {
    /// `older`에서 이 버전으로 바뀐 자릿수
    fn magnitude_since(&self, older: &AppVersion) -> ChangeMagnitude {
        match self.release.iter().zip(older.release.iter()).position(|(a, b)| a != b) {
            Some(0) => ChangeMagnitude::Major,
            Some(1) => ChangeMagnitude::Minor,
            _ => ChangeMagnitude::Patch,
        }
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.release;
        write!(f, "{}.{}.{}", major, minor, patch)?;
        if let Some(label) = &self.label {
            write!(f, "-{}", label)?;
        }
        Ok(())
    }
}

impl Ord for AppVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release.cmp(&other.release).then_with(|| match (&self.label, &other.label) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }
}

impl PartialOrd for AppVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 버전 차이의 크기 (운영자 표시용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMagnitude {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for ChangeMagnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeMagnitude::Major => write!(f, "major"),
            ChangeMagnitude::Minor => write!(f, "minor"),
            ChangeMagnitude::Patch => write!(f, "patch"),
        }
    }
}

/// `compare(remote, local)` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionComparison {
    pub is_newer: bool,
    pub change: Option<ChangeMagnitude>,
}

/// 원격 버전이 로컬보다 새로운지 판정.
/// 로컬 버전이 비어 있거나 파싱 불가면 어떤 원격 버전보다도 오래된 것으로 본다.
pub fn compare(remote: &str, local: &str) -> VersionComparison {
    match (remote.parse::<AppVersion>(), local.parse::<AppVersion>()) {
        (Ok(r), Ok(l)) if r > l => VersionComparison {
            is_newer: true,
            change: Some(r.magnitude_since(&l)),
        },
        (Ok(_), Ok(_)) => VersionComparison { is_newer: false, change: None },
        (Ok(_), Err(_)) => VersionComparison { is_newer: true, change: None },
        _ => VersionComparison { is_newer: false, change: None },
    }
}

/// 외부 프로세스가 쓰는 파일을 기다리는 폴링 정책 (지수 백오프, 최대 대기 시간)
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl PollPolicy {
    /// `path`가 `previous`(실행 전 mtime)보다 새로 기록될 때까지 대기.
    /// 실행 전에 파일이 없었다면 비어 있지 않은 파일이 생기기만 하면 된다
    pub async fn wait_for_file(&self, path: &Path, previous: Option<SystemTime>) -> Result<(), VersionError> {
        let started = Instant::now();
        let mut delay = self.initial_delay;

        loop {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                let fresh = match (previous, meta.modified()) {
                    (Some(before), Ok(modified)) => modified > before,
                    (Some(_), Err(_)) => false,
                    (None, _) => true,
                };
                if fresh && meta.len() > 0 {
                    return Ok(());
                }
            }
            if started.elapsed() >= self.max_wait {
                return Err(VersionError::Timeout {
                    path: path.display().to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.max_delay);
        }
    }
}

/// 로컬/원격 버전 해석기
#[derive(Debug, Clone)]
pub struct VersionResolver {
    http: reqwest::Client,
    poll: PollPolicy,
}

impl VersionResolver {
    pub fn new(http_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("station-launcher/1.0")
            .timeout(http_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("[Version] Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { http, poll: PollPolicy::default() }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// 설치 디렉터리 내 실행 파일 경로 (`Station` → `Station.exe` on Windows)
    pub fn executable_path(install_dir: &Path, executable: &str) -> PathBuf {
        if cfg!(target_os = "windows") && !executable.to_lowercase().ends_with(".exe") {
            install_dir.join(format!("{}.exe", executable))
        } else {
            install_dir.join(executable)
        }
    }

    /// 스위트 앱이 `writeversion` 실행 시 기록하는 파일
    pub fn version_log_path(install_dir: &Path) -> PathBuf {
        install_dir.join("_logs").join("version.txt")
    }

    /// 로컬 설치 버전. 설치되어 있지 않으면 빈 문자열
    pub async fn resolve_local_version(
        &self,
        install_dir: &Path,
        kind: AppKind,
        executable: &str,
    ) -> Result<String, VersionError> {
        match kind {
            AppKind::Suite => {
                let exe = Self::executable_path(install_dir, executable);
                if !exe.exists() {
                    tracing::debug!("[Version] {} not installed", exe.display());
                    return Ok(String::new());
                }
                let version_file = Self::version_log_path(install_dir);
                // 아카이브에 포함된 기존 파일은 결과로 보지 않음
                let previous = tokio::fs::metadata(&version_file)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok());

                let mut child = tokio::process::Command::new(&exe)
                    .arg("writeversion")
                    .current_dir(install_dir)
                    .spawn()
                    .map_err(|source| VersionError::Spawn {
                        exe: exe.display().to_string(),
                        source,
                    })?;
                // 종료 코드는 기록만 하고 판정에 쓰지 않는다
                let exe_name = executable.to_string();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => tracing::debug!("[Version] {} writeversion exited: {}", exe_name, status),
                        Err(e) => tracing::debug!("[Version] {} writeversion wait failed: {}", exe_name, e),
                    }
                });

                self.poll.wait_for_file(&version_file, previous).await?;
                Ok(read_version_file(&version_file).await.unwrap_or_default())
            }
            AppKind::Embedded => {
                let version_file = install_dir.join("version.txt");
                Ok(read_version_file(&version_file).await.unwrap_or_default())
            }
            AppKind::Imported => Ok(String::new()),
        }
    }

    /// 원격 버전 엔드포인트 응답 `"<version> <부가 텍스트>"`의 첫 토큰
    pub async fn resolve_remote_version(&self, url: &str) -> Result<String, VersionError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| VersionError::Connection(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(VersionError::Unavailable(format!("{} returned {}", url, resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| VersionError::Unavailable(e.to_string()))?;
        first_token(&body)
            .map(str::to_string)
            .ok_or_else(|| VersionError::Unavailable(format!("{} returned an empty body", url)))
    }
}

impl Default for VersionResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn first_token(body: &str) -> Option<&str> {
    body.split_whitespace().next()
}

async fn read_version_file(path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    first_token(&content).map(str::to_string)
}
