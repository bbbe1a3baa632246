//! 머신 바인딩 키 유도
//!
//! - **primary**: 루프백이 아닌 첫 번째 네트워크 인터페이스의 MAC 주소
//! - **backup**: 프로세서 ID (실패 시 OS 제품 ID)
//!
//! 두 키 모두 32자로 패딩된다. 시작 시 `KeyProvider::detect()`로 한 번만 계산하고
//! `Arc`로 저장소와 동기화 클라이언트에 주입한다.

use crate::error::SecretUnavailable;

/// AES-256 키 길이 (문자 수 = 바이트 수)
pub const KEY_LEN: usize = 32;

/// 프로세스 수명 동안 고정되는 키 묶음
#[derive(Debug, Clone)]
pub struct KeyProvider {
    primary: String,
    backup: Option<String>,
    /// 이전 세대 저장 형식(UTF-8 hex)에 사용된 키. None이면 primary와 동일
    legacy: Option<String>,
}

impl KeyProvider {
    /// 현재 머신에서 두 키를 유도
    pub fn detect() -> Self {
        let primary = derive_primary_key();
        if primary.is_empty() {
            tracing::warn!("[Secret] No non-loopback interface found, primary key is empty");
        }
        let backup = match derive_backup_key() {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("[Secret] {}", e);
                None
            }
        };
        tracing::info!(
            "[Secret] Keys derived (primary: {}, backup: {})",
            if primary.is_empty() { "missing" } else { "ok" },
            if backup.is_some() { "ok" } else { "missing" }
        );
        Self { primary, backup, legacy: None }
    }

    /// 고정 키로 생성 (테스트, 마이그레이션 도구용)
    pub fn from_keys(primary: impl Into<String>, backup: Option<String>) -> Self {
        Self {
            primary: primary.into(),
            backup,
            legacy: None,
        }
    }

    pub fn with_legacy(mut self, legacy: impl Into<String>) -> Self {
        self.legacy = Some(legacy.into());
        self
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn backup(&self) -> Option<&str> {
        self.backup.as_deref()
    }

    pub fn legacy(&self) -> Option<&str> {
        match self.legacy.as_deref() {
            Some(key) => Some(key),
            None if !self.primary.is_empty() => Some(&self.primary),
            None => None,
        }
    }
}

/// 구분자를 제거하고 `'0'`으로 32자까지 오른쪽 패딩
fn pad_key(raw: &str) -> String {
    let mut key: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-' && !c.is_whitespace())
        .take(KEY_LEN)
        .collect();
    while key.len() < KEY_LEN {
        key.push('0');
    }
    key
}

fn is_loopback(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "lo" || lower.starts_with("lo0") || lower.contains("loopback")
}

/// 루프백이 아닌 첫 번째 인터페이스의 MAC 주소 기반 키 (없으면 빈 문자열)
pub fn derive_primary_key() -> String {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    // HashMap 순회 순서가 매번 다르므로 이름순으로 고정
    let mut candidates: Vec<(String, String)> = networks
        .iter()
        .filter(|(name, data)| !is_loopback(name) && !data.mac_address().is_unspecified())
        .map(|(name, data)| (name.clone(), data.mac_address().to_string()))
        .collect();
    candidates.sort();

    match candidates.first() {
        Some((name, mac)) => {
            tracing::debug!("[Secret] Using interface '{}' for primary key", name);
            pad_key(mac)
        }
        None => String::new(),
    }
}

/// 프로세서 ID → OS 제품 ID 순으로 백업 키 유도
pub fn derive_backup_key() -> Result<String, SecretUnavailable> {
    if let Some(id) = read_processor_id() {
        return Ok(pad_key(&id).to_lowercase());
    }
    tracing::debug!("[Secret] Processor id unavailable, falling back to product id");
    match read_product_id() {
        Some(id) => Ok(pad_key(&id).to_lowercase()),
        None => Err(SecretUnavailable {
            reason: "neither processor id nor product id could be read".to_string(),
        }),
    }
}

#[cfg(target_os = "windows")]
fn read_processor_id() -> Option<String> {
    let output = std::process::Command::new("wmic")
        .args(["cpu", "get", "ProcessorId"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    // 첫 줄은 "ProcessorId" 헤더
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(not(target_os = "windows"))]
fn read_processor_id() -> Option<String> {
    let output = std::process::Command::new("hostid").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if id.is_empty() || id.chars().all(|c| c == '0') {
        None
    } else {
        Some(id)
    }
}

#[cfg(target_os = "windows")]
fn read_product_id() -> Option<String> {
    use winreg::enums::HKEY_LOCAL_MACHINE;
    use winreg::RegKey;

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let key = hklm
        .open_subkey("SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion")
        .ok()?;
    key.get_value::<String, _>("ProductId").ok()
}

#[cfg(not(target_os = "windows"))]
fn read_product_id() -> Option<String> {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
