//! 호스트 가용성 확인
//!
//! HTTP 200일 때만 `true`. 상태 코드 불일치, 전송 오류, 타임아웃은 모두 `false`이며
//! 호출자에게 에러를 던지지 않는다. 타임아웃 시 진행 중인 요청 future를 drop하여
//! 소켓을 닫는다. 유휴 연결 풀을 두지 않으므로 응답을 받은 뒤에도 소켓이 남지 않는다.

use std::time::Duration;

/// 기본 프로브 타임아웃
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_millis(10000);

#[derive(Debug, Clone)]
pub struct AvailabilityProbe {
    http: reqwest::Client,
    timeout: Duration,
}

impl AvailabilityProbe {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("station-launcher-probe/1.0")
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("[Probe] Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { http, timeout }
    }

    /// 설정값을 허용 범위(5~10초)로 제한하여 생성
    pub fn with_clamped_timeout(timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms).clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT);
        Self::new(timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn is_reachable(&self, url: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.http.get(url).send()).await {
            Ok(Ok(resp)) => {
                let ok = resp.status() == reqwest::StatusCode::OK;
                tracing::debug!("[Probe] {} -> {}", url, resp.status());
                ok
            }
            Ok(Err(e)) => {
                tracing::debug!("[Probe] {} unreachable: {}", url, e);
                false
            }
            Err(_) => {
                tracing::debug!("[Probe] {} timed out after {:?}", url, self.timeout);
                false
            }
        }
    }
}

impl Default for AvailabilityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn configured_timeout_is_clamped() {
        assert_eq!(AvailabilityProbe::with_clamped_timeout(100).timeout(), MIN_PROBE_TIMEOUT);
        assert_eq!(AvailabilityProbe::with_clamped_timeout(60_000).timeout(), MAX_PROBE_TIMEOUT);
        assert_eq!(
            AvailabilityProbe::with_clamped_timeout(7_500).timeout(),
            Duration::from_millis(7_500)
        );
    }

    #[tokio::test]
    async fn only_200_counts_as_reachable() {
        let app = Router::new()
            .route("/ok", get(|| async { "up" }))
            .route("/teapot", get(|| async { (StatusCode::IM_A_TEAPOT, "no") }));
        let addr = serve(app).await;
        let probe = AvailabilityProbe::new(Duration::from_secs(2));

        assert!(probe.is_reachable(&format!("http://{}/ok", addr)).await);
        assert!(!probe.is_reachable(&format!("http://{}/teapot", addr)).await);
        assert!(!probe.is_reachable(&format!("http://{}/missing", addr)).await);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // 바인드 후 즉시 해제한 포트
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let probe = AvailabilityProbe::new(Duration::from_secs(2));
        assert!(!probe.is_reachable(&format!("http://{}/", addr)).await);
    }

    /// accept 후 `response`를 보내고(비어 있으면 무응답) 상대가 소켓을 닫는 시각을 보고
    async fn eof_recording_server(response: &'static [u8]) -> (std::net::SocketAddr, oneshot::Receiver<Instant>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let mut responded = response.is_empty();
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) if !responded => {
                        sock.write_all(response).await.unwrap();
                        responded = true;
                    }
                    Ok(_) => {}
                }
            }
            let _ = tx.send(Instant::now());
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn silent_server_times_out_and_socket_is_closed() {
        let (addr, closed) = eof_recording_server(b"").await;

        let timeout = Duration::from_millis(300);
        let probe = AvailabilityProbe::new(timeout);
        let started = Instant::now();
        assert!(!probe.is_reachable(&format!("http://{}/", addr)).await);
        let returned = Instant::now();
        let elapsed = returned - started;
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(700), "took {:?}", elapsed);

        let closed_at = tokio::time::timeout(Duration::from_secs(2), closed)
            .await
            .expect("socket still open after timeout")
            .unwrap();
        assert!(closed_at.saturating_duration_since(returned) < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn successful_probe_does_not_keep_connection() {
        let (addr, closed) =
            eof_recording_server(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

        let probe = AvailabilityProbe::new(Duration::from_secs(2));
        assert!(probe.is_reachable(&format!("http://{}/", addr)).await);
        let returned = Instant::now();

        let closed_at = tokio::time::timeout(Duration::from_secs(2), closed)
            .await
            .expect("pooled connection left open")
            .unwrap();
        assert!(closed_at.saturating_duration_since(returned) < Duration::from_millis(500));
    }
}
