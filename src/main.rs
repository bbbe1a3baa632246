use std::sync::Arc;

use station_launcher::config::LauncherConfig;
use station_launcher::launcher;
use station_updater_lib::pipeline::PipelineEvent;
use station_updater_lib::{ipc, AppKind, InstallRequest, KeyProvider, LauncherEngine, TracingSink};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: station-launcher [serve | status | install <name> [suite|embedded] | update <name> | \
launch <name> | stop <name> | uninstall <name> | sync <app> | dataset <name>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = LauncherConfig::load()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("serve");

    // 채널 질의는 키 파생 없이 바로 처리
    if command == "status" {
        let endpoint = cfg.ipc_endpoint();
        let status = ipc::query(&endpoint, ipc::QUERY_STATUS).await?;
        println!("{}", status);
        return Ok(());
    }

    let keys = KeyProvider::detect();
    let engine = Arc::new(LauncherEngine::new(cfg.engine_config(), keys, Arc::new(TracingSink)));
    spawn_event_logger(&engine);

    match command {
        "serve" => serve(engine, &cfg).await?,
        "install" => {
            let name = required(&args, 1)?;
            let kind = match args.get(2).map(String::as_str) {
                None | Some("suite") => AppKind::Suite,
                Some("embedded") => AppKind::Embedded,
                Some(other) => anyhow::bail!("unknown app kind '{}'\n{}", other, USAGE),
            };
            let dir = engine.install(&InstallRequest::new(name, kind)).await?;
            println!("{}", dir.display());
        }
        "update" => {
            let name = required(&args, 1)?;
            let kind = engine
                .manifest()
                .find_by_name(name)
                .await
                .map(|e| e.kind)
                .unwrap_or(AppKind::Suite);
            let outcome = engine.update(&InstallRequest::new(name, kind)).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        "launch" | "stop" => {
            let name = required(&args, 1)?;
            let entry = engine
                .manifest()
                .find_by_name(name)
                .await
                .ok_or_else(|| anyhow::anyhow!("'{}' is not in the manifest", name))?;
            if command == "launch" {
                let pid = launcher::launch(&entry, &cfg.app_dir)?;
                println!("{}", pid);
            } else {
                let stopped = launcher::stop_async(&entry, &cfg.app_dir).await;
                println!("{}", stopped);
            }
        }
        "uninstall" => engine.uninstall(required(&args, 1)?).await?,
        "sync" => {
            let app = required(&args, 1)?;
            let merged = engine.sync_config(app).await.map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("{}", merged);
        }
        "dataset" => {
            let name = required(&args, 1)?;
            let direction = engine.sync_dataset(name).await.map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("{:?}", direction);
        }
        other => anyhow::bail!("unknown command '{}'\n{}", other, USAGE),
    }

    Ok(())
}

fn required(args: &[String], index: usize) -> anyhow::Result<&str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!(USAGE))
}

/// 파이프라인 이벤트를 로그로 출력
fn spawn_event_logger(engine: &LauncherEngine) {
    let mut events = engine.pipeline().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::Status { name, message }) => tracing::info!("[{}] {}", name, message),
                Ok(PipelineEvent::Progress { name, percent }) => {
                    tracing::debug!("[{}] {:.1}%", name, percent)
                }
                Ok(PipelineEvent::Stage { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger skipped {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// 상주 모드: 다운로드 상태 채널, 원격 설정 동기화, 자동 실행
async fn serve(engine: Arc<LauncherEngine>, cfg: &LauncherConfig) -> anyhow::Result<()> {
    tracing::info!("Station launcher starting (apps in {})", cfg.app_dir.display());

    let endpoint = cfg.ipc_endpoint();
    let reader = engine.pipeline().download_state();
    tokio::spawn(async move {
        if let Err(e) = ipc::serve(&endpoint, reader).await {
            tracing::error!("Download state channel stopped: {}", e);
        }
    });

    if engine.sync().is_some() {
        match engine.sync_config(station_updater_lib::pipeline::ORCHESTRATOR_APP).await {
            Ok(merged) => tracing::info!("Remote config synced ({} entries)", merged),
            Err(e) => tracing::warn!("Remote config sync skipped: {}", e.user_message()),
        }
    }

    for entry in engine.manifest().load().await {
        if !entry.autostart {
            continue;
        }
        if launcher::is_running_async(&entry, &cfg.app_dir).await {
            tracing::info!("{} already running", entry.name);
            continue;
        }
        if let Err(e) = launcher::launch(&entry, &cfg.app_dir) {
            tracing::warn!("Autostart of {} failed: {}", entry.name, e);
        }
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received");

    // 다운로드 중이면 끝날 때까지 대기
    let state = engine.pipeline().download_state();
    while state.is_downloading() {
        tracing::info!("Waiting for the running download to finish...");
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    tracing::info!("Station launcher shutting down");
    Ok(())
}
