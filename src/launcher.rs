use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use station_updater_lib::{AppManifestEntry, VersionResolver};
use sysinfo::System;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("'{0}' is not installed")]
    NotInstalled(PathBuf),

    #[error("Failed to start '{path}': {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<String>,
}

/// 실행 파일 경로. 가져온 앱은 `altPath`, 나머지는 `<app_dir>/<name>/<alias or name>`
pub fn executable_for(entry: &AppManifestEntry, app_dir: &Path) -> PathBuf {
    match entry.alt_path.as_deref().filter(|p| !p.is_empty()) {
        Some(alt) => PathBuf::from(alt),
        None => VersionResolver::executable_path(&app_dir.join(&entry.name), entry.executable()),
    }
}

/// `params`를 `--key value` 인수로 변환. 값이 비어 있으면 플래그만
pub fn render_params(params: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(params.len() * 2);
    for (key, value) in params {
        args.push(format!("--{}", key));
        if !value.is_empty() {
            args.push(value.clone());
        }
    }
    args
}

/// 앱 실행. 자식 프로세스는 런처와 독립적으로 계속 실행된다
pub fn launch(entry: &AppManifestEntry, app_dir: &Path) -> Result<u32, LaunchError> {
    let exe = executable_for(entry, app_dir);
    if !exe.exists() {
        return Err(LaunchError::NotInstalled(exe));
    }
    let working_dir = exe.parent().map(Path::to_path_buf).unwrap_or_else(|| app_dir.to_path_buf());

    let child = std::process::Command::new(&exe)
        .args(render_params(&entry.params))
        .current_dir(&working_dir)
        .spawn()
        .map_err(|source| LaunchError::Spawn { path: exe.clone(), source })?;

    tracing::info!("[Launcher] Started {} (pid {})", entry.name, child.id());
    Ok(child.id())
}

/// 실행 파일 이름이 일치하는 프로세스 목록
pub fn find_processes(entry: &AppManifestEntry, app_dir: &Path) -> Vec<RunningProcess> {
    let exe = executable_for(entry, app_dir);
    let Some(target) = exe.file_stem().map(|s| s.to_string_lossy().to_lowercase()) else {
        return Vec::new();
    };

    let mut sys = System::new();
    sys.refresh_processes();
    sys.processes()
        .iter()
        .filter(|(_, process)| process_stem(process.name()) == target)
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            executable_path: process.exe().and_then(|p| p.to_str()).map(String::from),
        })
        .collect()
}

pub fn is_running(entry: &AppManifestEntry, app_dir: &Path) -> bool {
    !find_processes(entry, app_dir).is_empty()
}

/// 일치하는 프로세스를 모두 종료하고 종료된 개수를 반환
pub fn stop(entry: &AppManifestEntry, app_dir: &Path) -> usize {
    let targets = find_processes(entry, app_dir);
    if targets.is_empty() {
        tracing::debug!("[Launcher] {} is not running", entry.name);
        return 0;
    }

    let mut sys = System::new();
    sys.refresh_processes();
    let mut stopped = 0;
    for target in targets {
        match sys.process(sysinfo::Pid::from_u32(target.pid)) {
            Some(process) if process.kill() => {
                tracing::info!("[Launcher] Stopped {} (pid {})", target.name, target.pid);
                stopped += 1;
            }
            _ => tracing::warn!("[Launcher] Could not stop {} (pid {})", target.name, target.pid),
        }
    }
    stopped
}

fn process_stem(name: &str) -> String {
    let lower = name.to_lowercase();
    lower.strip_suffix(".exe").unwrap_or(&lower).to_string()
}

// ── Async wrappers ─────────────────────────────────────────
// 프로세스 테이블 스캔은 동기 호출이므로 블로킹 스레드풀에서 실행

pub async fn is_running_async(entry: &AppManifestEntry, app_dir: &Path) -> bool {
    let entry = entry.clone();
    let app_dir = app_dir.to_path_buf();
    tokio::task::spawn_blocking(move || is_running(&entry, &app_dir))
        .await
        .unwrap_or(false)
}

pub async fn stop_async(entry: &AppManifestEntry, app_dir: &Path) -> usize {
    let entry = entry.clone();
    let app_dir = app_dir.to_path_buf();
    tokio::task::spawn_blocking(move || stop(&entry, &app_dir))
        .await
        .unwrap_or(0)
}
