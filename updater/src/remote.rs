//! 원격 설정 동기화
//!
//! ## 흐름
//! 1. `remote-config.env`(암호화)에서 uid / refresh token 로드
//! 2. refresh token → access token 교환 (실패 시 이번 사이클 중단, 재시도 없음)
//! 3. `config.json` 병합 또는 데이터셋 워터마크 비교
//!
//! 원격 저장소 경로: `{remote_base}/{collection}/{uid}/{resource}.json?auth={token}`
//! 모든 호출은 멱등 GET/PUT이며 삭제는 없다.
//!
//! 데이터셋 동기화는 명시적 워터마크를 가진 last-writer-wins 방식이다.
//! 두 기기에서 동시에 수정하면 한쪽 변경이 덮어써질 수 있다.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::document::{split_entry, ConfigDocument};
use crate::error::SyncError;
use crate::store::EncryptedStore;

/// 원격 동기화 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSyncConfig {
    /// 예: "https://station-db.example.com"
    pub remote_base: String,
    /// 사용자별 데이터가 들어있는 컬렉션 이름
    pub collection: String,
    /// refresh token 교환 엔드포인트
    pub token_endpoint: String,
    /// 토큰 엔드포인트에 `?key=`로 붙는 API 키
    #[serde(default)]
    pub api_key: Option<String>,
}

/// 토큰 교환 결과 — 저장하지 않고 한 번의 동기화 동안만 사용
#[derive(Debug, Clone)]
pub struct IdTokenResponse {
    pub access_token: String,
    pub user_id: String,
}

/// `remote-config.env` 부트스트랩: 0번 줄 uid, 1번 줄 refresh token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBootstrap {
    pub uid: String,
    pub refresh_token: String,
}

impl RemoteBootstrap {
    pub fn from_document(doc: &ConfigDocument) -> Result<Self, SyncError> {
        let lines = doc.lines();
        if lines.len() < 2 {
            return Err(SyncError::MalformedBootstrap(lines.len()));
        }
        let value_of = |line: &str| {
            split_entry(line)
                .map(|(_, v)| v.trim().to_string())
                .unwrap_or_else(|| line.trim().to_string())
        };
        let uid = value_of(&lines[0]);
        let refresh_token = value_of(&lines[1]);
        if uid.is_empty() || refresh_token.is_empty() {
            return Err(SyncError::MalformedBootstrap(lines.len()));
        }
        Ok(Self { uid, refresh_token })
    }

    pub fn to_document(&self) -> ConfigDocument {
        let mut doc = ConfigDocument::new();
        doc.set("uid", &self.uid);
        doc.set("refresh_token", &self.refresh_token);
        doc
    }
}

/// 데이터셋 동기화 워터마크 (unix 밀리초)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetWatermark {
    #[serde(default)]
    pub latest_online_update: i64,
    #[serde(default)]
    pub latest_local_update: i64,
}

/// `reconcile_dataset` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncDirection {
    /// 원격 → 로컬
    Pulled,
    /// 로컬 → 원격
    Pushed,
    /// 변경 없음
    Unchanged,
}

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// 원격 설정 동기화 클라이언트
pub struct RemoteConfigSync {
    http: reqwest::Client,
    config: RemoteSyncConfig,
    store: EncryptedStore,
    /// 암호화된 `remote-config.env` 경로
    bootstrap_path: PathBuf,
    /// 앱 설치 루트 (`<app_dir>/<app_id>/_config/config.env`)
    app_dir: PathBuf,
    /// 보조 데이터셋 디렉터리 (`<data_dir>/<name>.json`)
    data_dir: PathBuf,
}

impl RemoteConfigSync {
    pub fn new(
        config: RemoteSyncConfig,
        store: EncryptedStore,
        bootstrap_path: PathBuf,
        app_dir: PathBuf,
        data_dir: PathBuf,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("station-launcher-sync/1.0")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("[Sync] Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            http,
            config,
            store,
            bootstrap_path,
            app_dir,
            data_dir,
        }
    }

    pub fn config_path(&self, app_id: &str) -> PathBuf {
        self.app_dir.join(app_id).join("_config").join("config.env")
    }

    pub fn dataset_path(&self, dataset: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", dataset))
    }

    /// refresh token을 access token으로 교환
    pub async fn fetch_access_token(&self, refresh_token: &str) -> Result<IdTokenResponse, SyncError> {
        let mut req = self.http.post(&self.config.token_endpoint).json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        }));
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.query(&[("key", key)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::AuthFailure(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SyncError::AuthFailure(format!("token endpoint returned {}", resp.status())));
        }
        let payload: TokenPayload = resp
            .json()
            .await
            .map_err(|e| SyncError::AuthFailure(format!("malformed token response: {}", e)))?;

        let access_token = payload
            .id_token
            .or(payload.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::AuthFailure("token response has no id_token".to_string()))?;

        Ok(IdTokenResponse {
            access_token,
            user_id: payload.user_id.unwrap_or_default(),
        })
    }

    /// 부트스트랩 로드 + 토큰 교환. uid는 응답값을 우선하고 없으면 부트스트랩 값
    pub async fn authenticate(&self) -> Result<IdTokenResponse, SyncError> {
        let doc = self
            .store
            .read_document(&self.bootstrap_path)
            .await
            .ok_or(SyncError::MissingBootstrap)?;
        let bootstrap = RemoteBootstrap::from_document(&doc)?;
        let mut token = self.fetch_access_token(&bootstrap.refresh_token).await?;
        if token.user_id.is_empty() {
            token.user_id = bootstrap.uid;
        }
        tracing::debug!("[Sync] Authenticated as {}", token.user_id);
        Ok(token)
    }

    /// 원격 `config.json`을 로컬 설정에 병합한 뒤 결과를 다시 업로드. 병합된 항목 수 반환
    pub async fn pull_and_merge_config(&self, app_id: &str) -> Result<usize, SyncError> {
        let session = self.authenticate().await?;
        let remote: Option<Vec<String>> = self.get_json(&session, "config").await?;

        let path = self.config_path(app_id);
        let mut doc = self.store.read_document(&path).await.unwrap_or_default();
        let merged = match &remote {
            Some(entries) => doc.merge_entries(entries),
            None => 0,
        };

        if !self.store.write_document(&path, &doc).await {
            return Err(SyncError::LocalWrite(path.display().to_string()));
        }
        self.put_json(&session, "config", &doc.lines()).await?;

        tracing::info!("[Sync] Merged {} remote entries into {} config", merged, app_id);
        Ok(merged)
    }

    /// 로컬 설정을 원격으로 업로드
    pub async fn push_config(&self, app_id: &str) -> Result<(), SyncError> {
        let session = self.authenticate().await?;
        let path = self.config_path(app_id);
        let doc = self.store.read_document(&path).await.unwrap_or_default();
        self.put_json(&session, "config", &doc.lines()).await?;
        tracing::info!("[Sync] Pushed {} config ({} entries)", app_id, doc.len());
        Ok(())
    }

    /// 워터마크 비교로 데이터셋 동기화 방향 결정
    pub async fn reconcile_dataset(&self, dataset: &str) -> Result<SyncDirection, SyncError> {
        let session = self.authenticate().await?;
        let dates_resource = format!("{}_dates", dataset);
        let watermark: DatasetWatermark = self
            .get_json::<DatasetWatermark>(&session, &dates_resource)
            .await?
            .unwrap_or_default();

        let local_path = self.dataset_path(dataset);
        let local_mtime = modified_millis(&local_path).await;

        if watermark.latest_online_update > local_mtime.unwrap_or(0) {
            let content: Option<serde_json::Value> = self.get_json(&session, dataset).await?;
            // 워터마크만 있고 본문이 없으면 로컬 파일을 건드리지 않음
            let Some(content) = content.filter(|c| !c.is_null()) else {
                tracing::warn!(
                    "[Sync] Dataset '{}' is newer remotely but has no content, keeping local copy",
                    dataset
                );
                return Ok(SyncDirection::Unchanged);
            };
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local_path, serde_json::to_vec_pretty(&content)?).await?;

            let new_mtime = modified_millis(&local_path).await.unwrap_or_else(now_millis);
            let updated = DatasetWatermark {
                latest_online_update: watermark.latest_online_update,
                latest_local_update: new_mtime,
            };
            self.put_json(&session, &dates_resource, &updated).await?;
            tracing::info!("[Sync] Dataset '{}' pulled from remote", dataset);
            return Ok(SyncDirection::Pulled);
        }

        if let Some(mtime) = local_mtime {
            if mtime > watermark.latest_local_update {
                let raw = tokio::fs::read(&local_path).await?;
                let content: serde_json::Value = serde_json::from_slice(&raw)?;
                self.put_json(&session, dataset, &content).await?;

                let updated = DatasetWatermark {
                    latest_online_update: watermark.latest_online_update,
                    latest_local_update: mtime,
                };
                self.put_json(&session, &dates_resource, &updated).await?;
                tracing::info!("[Sync] Dataset '{}' pushed to remote", dataset);
                return Ok(SyncDirection::Pushed);
            }
        }

        tracing::debug!("[Sync] Dataset '{}' already in sync", dataset);
        Ok(SyncDirection::Unchanged)
    }

    fn resource_url(&self, uid: &str, resource: &str) -> String {
        format!(
            "{}/{}/{}/{}.json",
            self.config.remote_base.trim_end_matches('/'),
            self.config.collection,
            uid,
            resource
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        session: &IdTokenResponse,
        resource: &str,
    ) -> Result<Option<T>, SyncError> {
        let url = self.resource_url(&session.user_id, resource);
        let resp = self
            .http
            .get(&url)
            .query(&[("auth", session.access_token.as_str())])
            .send()
            .await
            .map_err(|e| SyncError::from_reqwest(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SyncError::Remote { status: status.as_u16(), message });
        }
        let bytes = resp.bytes().await.map_err(|e| SyncError::from_reqwest(&e))?;
        // 존재하지 않는 키는 `null`로 응답된다
        Ok(serde_json::from_slice::<Option<T>>(&bytes)?)
    }

    async fn put_json<T: Serialize + ?Sized>(
        &self,
        session: &IdTokenResponse,
        resource: &str,
        body: &T,
    ) -> Result<(), SyncError> {
        let url = self.resource_url(&session.user_id, resource);
        let resp = self
            .http
            .put(&url)
            .query(&[("auth", session.access_token.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::from_reqwest(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SyncError::Remote { status: status.as_u16(), message });
        }
        Ok(())
    }
}

/// 파일 수정 시각 (unix 밀리초). 파일이 없으면 `None`
pub async fn modified_millis(path: &Path) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    Some(system_time_millis(modified))
}

fn system_time_millis(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn now_millis() -> i64 {
    system_time_millis(SystemTime::now())
}
