//! 다운로드 상태 공유 및 로컬 IPC 채널
//!
//! ## 구조
//! - **DownloadState**: 쓰기 주체는 파이프라인 하나. `try_begin()`이 반환하는 가드가
//!   살아있는 동안만 `downloading = true`
//! - **DownloadStateReader**: 읽기 전용 스냅샷 핸들
//! - **채널 서버**: 외부 워치독이 다운로드 중 앱을 종료하지 않도록
//!   `downloading` 질의에 `true`/`false`로 응답 (Unix 소켓 / Windows named pipe)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;

/// 다운로드 진행 여부 질의
pub const QUERY_DOWNLOADING: &str = "downloading";
/// 상태 전체(JSON) 질의
pub const QUERY_STATUS: &str = "status";

/// 기본 채널 이름
#[cfg(unix)]
pub fn default_endpoint() -> String {
    let dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| std::env::temp_dir().display().to_string());
    std::path::Path::new(&dir)
        .join("station-launcher.sock")
        .display()
        .to_string()
}

#[cfg(windows)]
pub fn default_endpoint() -> String {
    r"\\.\pipe\station-launcher".to_string()
}

/// 외부로 노출되는 다운로드 상태 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub downloading: bool,
    /// 현재 설치 중인 앱 이름
    pub current: Option<String>,
}

/// 프로세스 전역 다운로드 플래그 (파이프라인이 소유)
#[derive(Debug, Clone)]
pub struct DownloadState {
    tx: Arc<watch::Sender<DownloadSnapshot>>,
}

impl DownloadState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DownloadSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// 다운로드 시작. 이미 진행 중이면 `None`
    pub fn try_begin(&self, name: &str) -> Option<DownloadGuard> {
        let started = self.tx.send_if_modified(|s| {
            if s.downloading {
                false
            } else {
                s.downloading = true;
                s.current = Some(name.to_string());
                true
            }
        });
        if started {
            Some(DownloadGuard { tx: self.tx.clone() })
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> DownloadStateReader {
        DownloadStateReader { rx: self.tx.subscribe() }
    }
}

impl Default for DownloadState {
    fn default() -> Self {
        Self::new()
    }
}

/// drop 시 다운로드 플래그 해제
#[derive(Debug)]
pub struct DownloadGuard {
    tx: Arc<watch::Sender<DownloadSnapshot>>,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|s| {
            s.downloading = false;
            s.current = None;
        });
    }
}

/// 읽기 전용 상태 핸들
#[derive(Debug, Clone)]
pub struct DownloadStateReader {
    rx: watch::Receiver<DownloadSnapshot>,
}

impl DownloadStateReader {
    pub fn snapshot(&self) -> DownloadSnapshot {
        self.rx.borrow().clone()
    }

    pub fn is_downloading(&self) -> bool {
        self.rx.borrow().downloading
    }
}

/// 한 줄 질의에 대한 응답 문자열
pub fn answer(query: &str, state: &DownloadStateReader) -> String {
    match query.trim() {
        QUERY_DOWNLOADING => state.is_downloading().to_string(),
        QUERY_STATUS => serde_json::to_string(&state.snapshot()).unwrap_or_else(|_| "{}".to_string()),
        other => format!("unknown query: {}", other),
    }
}

async fn handle_connection<S>(stream: S, state: DownloadStateReader) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = answer(&line, &state) + "\n";
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// 채널 서버 실행 (종료하지 않음)
#[cfg(unix)]
pub async fn serve(endpoint: &str, state: DownloadStateReader) -> anyhow::Result<()> {
    use tokio::net::UnixListener;

    // 이전 실행에서 남은 소켓 제거
    let _ = std::fs::remove_file(endpoint);
    let listener = UnixListener::bind(endpoint)?;
    tracing::info!("[Ipc] Download state channel listening on {}", endpoint);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                tracing::debug!("[Ipc] Connection closed with error: {}", e);
            }
        });
    }
}

#[cfg(windows)]
pub async fn serve(endpoint: &str, state: DownloadStateReader) -> anyhow::Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let mut server = ServerOptions::new().first_pipe_instance(true).create(endpoint)?;
    tracing::info!("[Ipc] Download state channel listening on {}", endpoint);

    loop {
        server.connect().await?;
        let connected = std::mem::replace(&mut server, ServerOptions::new().create(endpoint)?);
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(connected, state).await {
                tracing::debug!("[Ipc] Pipe closed with error: {}", e);
            }
        });
    }
}

async fn send_query<S>(stream: S, query: &str) -> anyhow::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    writer.write_all(format!("{}\n", query).as_bytes()).await?;
    writer.flush().await?;
    let mut lines = BufReader::new(reader).lines();
    lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("channel closed without a response"))
}

/// 워치독용 클라이언트: 현재 다운로드 중인지 질의
pub async fn query_downloading(endpoint: &str) -> anyhow::Result<bool> {
    let response = query(endpoint, QUERY_DOWNLOADING).await?;
    match response.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => anyhow::bail!("unexpected response: {}", other),
    }
}

pub async fn query(endpoint: &str, query: &str) -> anyhow::Result<String> {
    #[cfg(unix)]
    let stream = tokio::net::UnixStream::connect(endpoint).await?;
    #[cfg(windows)]
    let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)?;
    send_query(stream, query).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_download_at_a_time() {
        let state = DownloadState::new();
        let guard = state.try_begin("Station").expect("first begin");
        assert!(state.try_begin("NUC").is_none());
        assert_eq!(state.snapshot().current.as_deref(), Some("Station"));

        drop(guard);
        assert!(!state.snapshot().downloading);
        assert!(state.try_begin("NUC").is_some());
    }

    #[test]
    fn reader_observes_writer() {
        let state = DownloadState::new();
        let reader = state.reader();
        assert_eq!(answer("downloading", &reader), "false");
        let _guard = state.try_begin("Station").unwrap();
        assert_eq!(answer("downloading\n", &reader), "true");
        assert!(answer("status", &reader).contains("\"current\":\"Station\""));
        assert!(answer("reboot", &reader).starts_with("unknown query"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn channel_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let endpoint = dir.path().join("launcher.sock").display().to_string();
        let state = DownloadState::new();

        let server_endpoint = endpoint.clone();
        let reader = state.reader();
        tokio::spawn(async move {
            let _ = serve(&server_endpoint, reader).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(!query_downloading(&endpoint).await.unwrap());
        let _guard = state.try_begin("Station").unwrap();
        assert!(query_downloading(&endpoint).await.unwrap());
    }
}
