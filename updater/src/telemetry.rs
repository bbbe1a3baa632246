//! 크래시 텔레메트리 싱크
//!
//! 예기치 않은 실패를 보고하는 fire-and-forget 인터페이스.
//! 보고는 별도 태스크에서 실행되며 실패해도 원래 작업에 영향을 주지 않는다.

use std::sync::Arc;

use serde::Serialize;

/// 보고 이벤트
#[derive(Debug, Clone, Serialize)]
pub struct CrashReport {
    pub id: String,
    pub timestamp: String,
    pub operation: String,
    pub message: String,
}

impl CrashReport {
    pub fn new(operation: &str, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// 텔레메트리 수신자
pub trait TelemetrySink: Send + Sync {
    fn report(&self, report: CrashReport) -> anyhow::Result<()>;
}

/// 로그로만 남기는 기본 싱크
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn report(&self, report: CrashReport) -> anyhow::Result<()> {
        tracing::error!(
            "[Telemetry] {} failed ({}): {}",
            report.operation,
            report.id,
            report.message
        );
        Ok(())
    }
}

/// 보고를 백그라운드로 넘기고 즉시 반환
pub fn report_detached(sink: &Arc<dyn TelemetrySink>, operation: &str, message: impl Into<String>) {
    let sink = sink.clone();
    let report = CrashReport::new(operation, message);
    let send = move || {
        if let Err(e) = sink.report(report) {
            tracing::debug!("[Telemetry] Sink rejected report: {}", e);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(send);
        }
        Err(_) => send(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CrashReport>>);

    impl TelemetrySink for Recorder {
        fn report(&self, report: CrashReport) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(report);
            Ok(())
        }
    }

    struct Broken;

    impl TelemetrySink for Broken {
        fn report(&self, _report: CrashReport) -> anyhow::Result<()> {
            anyhow::bail!("collector offline")
        }
    }

    #[tokio::test]
    async fn detached_report_arrives() {
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn TelemetrySink> = recorder.clone();
        report_detached(&sink, "install", "zip header corrupt");

        for _ in 0..50 {
            if !recorder.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let reports = recorder.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].operation, "install");
    }

    #[test]
    fn failing_sink_is_swallowed_outside_runtime() {
        let sink: Arc<dyn TelemetrySink> = Arc::new(Broken);
        report_detached(&sink, "sync", "boom");
    }
}
