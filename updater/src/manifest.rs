//! 설치된 앱 목록 (`manifest.json`, 암호화 저장)

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::EncryptedStore;
use crate::AppKind;

/// 이름으로부터 결정적인 id 생성 — 재스캔 시 중복 항목 방지
pub fn generate_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..8])
}

/// 설치 단위 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppManifestEntry {
    #[serde(rename = "type")]
    pub kind: AppKind,
    pub id: String,
    pub name: String,
    /// 실행 파일 이름이 앱 이름과 다를 때
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub autostart: bool,
    /// 가져온(imported) 앱의 절대 경로
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_path: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<bool>,
}

impl AppManifestEntry {
    pub fn new(kind: AppKind, name: &str) -> Self {
        Self {
            kind,
            id: generate_id(name),
            name: name.to_string(),
            alias: None,
            autostart: false,
            alt_path: None,
            params: BTreeMap::new(),
            mode: String::new(),
            setup_complete: None,
        }
    }

    /// 실행 파일 이름 (alias 우선)
    pub fn executable(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// 암호화된 manifest 파일 관리
pub struct ManifestStore {
    path: PathBuf,
    store: EncryptedStore,
}

impl ManifestStore {
    pub fn new(path: PathBuf, store: EncryptedStore) -> Self {
        Self { path, store }
    }

    /// 파일이 없거나 읽을 수 없으면 빈 목록
    pub async fn load(&self) -> Vec<AppManifestEntry> {
        let Some(text) = self.store.read(&self.path).await else {
            return Vec::new();
        };
        match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("[Manifest] {} is not a valid entry list: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    pub async fn save(&self, entries: &[AppManifestEntry]) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        if !self.store.write(&self.path, &json).await {
            anyhow::bail!("failed to write {}", self.path.display());
        }
        Ok(())
    }

    /// id 기준 추가/교체
    pub async fn upsert(&self, entry: AppManifestEntry) -> anyhow::Result<()> {
        let mut entries = self.load().await;
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.save(&entries).await
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let mut entries = self.load().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if removed {
            self.save(&entries).await?;
        }
        Ok(removed)
    }

    pub async fn find_by_name(&self, name: &str) -> Option<AppManifestEntry> {
        self.load().await.into_iter().find(|e| e.name == name)
    }
}
