//! 암호화 설정 저장소
//!
//! 파일 형식: `hex(iv 16바이트) || hex(AES-256-CBC 암호문)`을 UTF-16LE 텍스트로 저장.
//! 각 문서는 primary 파일(primary 키)과 `_backup` 파일(backup 키) 두 벌로 저장된다.
//!
//! ## 읽기 복구 순서
//! 1. primary 파일 + primary 키
//! 2. backup 파일 + backup 키 → 성공 시 primary 파일 재작성
//! 3. primary 파일을 UTF-8 레거시 형식 + legacy 키로 해석 → 성공 시 현재 형식으로 재작성
//! 4. 모두 실패하면 문서가 없는 것으로 취급 (`None`)
//!
//! 설정 경로는 이 저장소가 독점한다. 호출자는 파일을 직접 쓰지 않는다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes::Aes256;
use byteorder::{ByteOrder, LittleEndian};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::document::ConfigDocument;
use crate::error::StoreError;
use crate::secret::{KeyProvider, KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

/// 암호화 저장소 — primary/backup 이중 파일과 자가 복구
#[derive(Debug, Clone)]
pub struct EncryptedStore {
    keys: Arc<KeyProvider>,
}

impl EncryptedStore {
    pub fn new(keys: Arc<KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyProvider {
        &self.keys
    }

    /// `config.env` → `config_backup.env`
    pub fn backup_path(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{}_backup.{}", stem, ext.to_string_lossy()),
            None => format!("{}_backup", stem),
        };
        path.with_file_name(name)
    }

    /// 평문을 primary/backup 두 파일에 암호화해 저장.
    /// 두 쓰기가 모두 성공해야 `true`. backup 키가 없으면 backup 쓰기는 건너뛴다.
    pub async fn write(&self, path: &Path, plaintext: &str) -> bool {
        let primary_ok = match write_blob(path, self.keys.primary(), plaintext).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[Store] Primary write failed for {}: {}", path.display(), e);
                false
            }
        };

        let backup_ok = match self.keys.backup() {
            Some(key) => {
                let backup = Self::backup_path(path);
                match write_blob(&backup, key, plaintext).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("[Store] Backup write failed for {}: {}", backup.display(), e);
                        false
                    }
                }
            }
            None => {
                tracing::debug!("[Store] No backup key, skipping backup copy of {}", path.display());
                true
            }
        };

        primary_ok && backup_ok
    }

    /// 복호화된 평문 반환. 파일이 없거나 비어 있거나 모든 복구 경로가 실패하면 `None`
    pub async fn read(&self, path: &Path) -> Option<String> {
        let backup = Self::backup_path(path);

        let primary_bytes = match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("[Store] Cannot read {}: {}", path.display(), e);
                None
            }
        };

        if primary_bytes.is_none() && !tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            return None;
        }

        if let Some(bytes) = &primary_bytes {
            if bytes.is_empty() {
                tracing::debug!("[Store] {} is empty", path.display());
                return None;
            }
            match decrypt_utf16_blob(bytes, self.keys.primary()) {
                Ok(plaintext) => {
                    self.heal_backup(path, &plaintext).await;
                    return Some(plaintext);
                }
                Err(e) => {
                    tracing::debug!("[Store] Primary decrypt failed for {}: {}", path.display(), e);
                }
            }
        }

        if let Some(key) = self.keys.backup() {
            match tokio::fs::read(&backup).await {
                Ok(bytes) if !bytes.is_empty() => match decrypt_utf16_blob(&bytes, key) {
                    Ok(plaintext) => {
                        tracing::info!("[Store] Recovered {} from backup copy", path.display());
                        if let Err(e) = write_blob(path, self.keys.primary(), &plaintext).await {
                            tracing::warn!("[Store] Could not repair {}: {}", path.display(), e);
                        }
                        return Some(plaintext);
                    }
                    Err(e) => {
                        tracing::debug!("[Store] Backup decrypt failed for {}: {}", backup.display(), e);
                    }
                },
                _ => {}
            }
        }

        if let (Some(bytes), Some(key)) = (&primary_bytes, self.keys.legacy()) {
            if let Some(plaintext) = decrypt_legacy_blob(bytes, key) {
                tracing::info!("[Store] Migrating {} from legacy format", path.display());
                if !self.write(path, &plaintext).await {
                    tracing::warn!("[Store] Legacy migration rewrite incomplete for {}", path.display());
                }
                return Some(plaintext);
            }
        }

        tracing::warn!("[Store] All decryption paths failed for {}", path.display());
        None
    }

    /// primary는 읽혔지만 backup이 없거나 손상된 경우 backup 재작성
    async fn heal_backup(&self, path: &Path, plaintext: &str) {
        let Some(key) = self.keys.backup() else {
            return;
        };
        let backup = Self::backup_path(path);
        let healthy = match tokio::fs::read(&backup).await {
            Ok(bytes) => decrypt_utf16_blob(&bytes, key).is_ok(),
            Err(_) => false,
        };
        if !healthy {
            tracing::info!("[Store] Rewriting missing or corrupt backup {}", backup.display());
            if let Err(e) = write_blob(&backup, key, plaintext).await {
                tracing::warn!("[Store] Backup repair failed for {}: {}", backup.display(), e);
            }
        }
    }

    pub async fn read_document(&self, path: &Path) -> Option<ConfigDocument> {
        self.read(path).await.map(|text| ConfigDocument::parse(&text))
    }

    pub async fn write_document(&self, path: &Path, doc: &ConfigDocument) -> bool {
        self.write(path, &doc.to_text()).await
    }

    /// 단일 키 설정 (문서가 없으면 새로 생성)
    pub async fn set_value(&self, path: &Path, key: &str, value: &str) -> bool {
        let mut doc = self.read_document(path).await.unwrap_or_default();
        doc.set(key, value);
        self.write_document(path, &doc).await
    }
}

/// 평문을 UTF-16LE로 인코딩한 뒤 `hex(iv) || hex(ciphertext)` 문자열로 암호화
pub fn encrypt_blob(key: &str, plaintext: &str) -> Result<String, StoreError> {
    seal(key, &encode_utf16le(plaintext))
}

/// `encrypt_blob`의 역연산. 복호화된 바이트는 UTF-16LE로 해석
pub fn decrypt_blob(key: &str, blob: &str) -> Result<String, StoreError> {
    let plaintext = open(key, blob)?;
    decode_utf16le(&plaintext)
        .map_err(|_| StoreError::Decryption("plaintext is not UTF-16LE".to_string()))
}

fn seal(key: &str, plaintext: &[u8]) -> Result<String, StoreError> {
    let key_bytes = key.as_bytes();
    if key_bytes.len() != KEY_LEN {
        return Err(StoreError::InvalidKey(key_bytes.len()));
    }
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key_bytes, &iv)
        .map_err(|_| StoreError::InvalidKey(key_bytes.len()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(format!("{}{}", hex::encode(iv), hex::encode(ciphertext)))
}

fn open(key: &str, blob: &str) -> Result<Vec<u8>, StoreError> {
    let key_bytes = key.as_bytes();
    if key_bytes.len() != KEY_LEN {
        return Err(StoreError::InvalidKey(key_bytes.len()));
    }
    let blob = blob.trim().trim_start_matches('\u{feff}');
    if blob.len() < IV_LEN * 2 * 2 || !blob.is_char_boundary(IV_LEN * 2) {
        return Err(StoreError::Decryption("blob too short".to_string()));
    }
    let (iv_hex, ct_hex) = blob.split_at(IV_LEN * 2);
    let iv = hex::decode(iv_hex).map_err(|e| StoreError::Decryption(e.to_string()))?;
    let ciphertext = hex::decode(ct_hex).map_err(|e| StoreError::Decryption(e.to_string()))?;

    let cipher = Aes256CbcDec::new_from_slices(key_bytes, &iv)
        .map_err(|_| StoreError::Decryption("invalid iv length".to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| StoreError::Decryption("bad padding (wrong key?)".to_string()))
}

pub(crate) fn encode_utf16le(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut bytes = vec![0u8; units.len() * 2];
    LittleEndian::write_u16_into(&units, &mut bytes);
    bytes
}

pub(crate) fn decode_utf16le(bytes: &[u8]) -> Result<String, StoreError> {
    let bytes = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    if bytes.len() % 2 != 0 {
        return Err(StoreError::Encoding);
    }
    let mut units = vec![0u16; bytes.len() / 2];
    LittleEndian::read_u16_into(bytes, &mut units);
    String::from_utf16(&units).map_err(|_| StoreError::Encoding)
}

fn decrypt_utf16_blob(bytes: &[u8], key: &str) -> Result<String, StoreError> {
    let text = decode_utf16le(bytes)?;
    decrypt_blob(key, &text)
}

/// 레거시 형식: 파일과 평문 모두 UTF-8
fn decrypt_legacy_blob(bytes: &[u8], key: &str) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    let plaintext = open(key, text).ok()?;
    String::from_utf8(plaintext).ok()
}

async fn write_blob(path: &Path, key: &str, plaintext: &str) -> Result<(), StoreError> {
    let blob = encrypt_blob(key, plaintext)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    tokio::fs::write(path, encode_utf16le(&blob))
        .await
        .map_err(|e| StoreError::io(path, e))
}
