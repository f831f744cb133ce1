//! 键值存储抽象与实现（内存 / 单文件 JSON）。
//!
//! 存储内容：
//! - `settings`、`keywords`、`negative_keywords`、`enhanced_<keyword>`（见 [`crate::state`]）
//!
//! 约束与注意事项：
//! - 存储本身不做并发控制；读-改-写的串行化由协调器负责
//! - 读取一律宽松：缺失或类型不符的值按默认值处理并记录日志
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::keyword::KeywordSet;
use crate::state::{self, KeywordMeta, StoredSettings};

/// 存储错误。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("存储读写失败: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("存储文件已损坏: {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("存储不可用: {0}")]
    Unavailable(String),
}

/// 键值存储接口。
///
/// 说明：
/// - 值统一为 JSON（`serde_json::Value`）
/// - [`KvStore::verify`] 用于协调器初始化时验证存储可读写
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// 写入校验键、读回并删除；任一步失败或读回不一致即返回错误。
    async fn verify(&self) -> Result<(), StoreError> {
        let marker = Value::from(OffsetDateTime::now_utc().unix_timestamp_nanos().to_string());
        self.set(state::VERIFY_KEY, marker.clone()).await?;
        let back = self.get(state::VERIFY_KEY).await?;
        self.remove(state::VERIFY_KEY).await?;
        if back.as_ref() != Some(&marker) {
            return Err(StoreError::Unavailable("校验值读回不一致".to_string()));
        }
        Ok(())
    }
}

/// 内存存储（测试与 `--ephemeral` 运行使用）。
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// 单文件 JSON 存储。
///
/// 落盘格式：
/// - 一个 JSON 对象，键即存储键
///
/// 写入策略：
/// - 先写临时文件再重命名，避免中途崩溃留下半截文件
/// - 首次访问时加载到内存缓存，之后每次写入整体落盘
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, Value>>>,
}

impl JsonFileStore {
    /// 创建存储（不做 IO；文件在首次访问时读取）。
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        let bytes = serde_json::to_vec_pretty(entries).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| self.io_err(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// 在缓存上执行一次修改并落盘；落盘失败时缓存回滚为修改前的状态。
    async fn mutate<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) + Send,
    {
        let mut guard = self.cache.lock().await;
        let current = match guard.take() {
            Some(entries) => entries,
            None => self.load().await?,
        };
        let mut next = current.clone();
        f(&mut next);
        match self.flush(&next).await {
            Ok(()) => {
                *guard = Some(next);
                Ok(())
            }
            Err(e) => {
                *guard = Some(current);
                Err(e)
            }
        }
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.clone().unwrap_or_default())
    }
}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.snapshot().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let key = key.to_string();
        self.mutate(move |entries| {
            entries.insert(key, value);
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.mutate(move |entries| {
            entries.remove(&key);
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.snapshot().await?.into_keys().collect())
    }

    async fn verify(&self) -> Result<(), StoreError> {
        // 丢弃缓存，强制重新读取文件，以便发现外部损坏。
        *self.cache.lock().await = None;
        let marker = Value::from(OffsetDateTime::now_utc().unix_timestamp_nanos().to_string());
        self.set(state::VERIFY_KEY, marker.clone()).await?;
        let back = self.get(state::VERIFY_KEY).await?;
        self.remove(state::VERIFY_KEY).await?;
        if back.as_ref() != Some(&marker) {
            return Err(StoreError::Unavailable("校验值读回不一致".to_string()));
        }
        debug!("存储验证通过: {}", self.path.display());
        Ok(())
    }
}

/// 读取关键词列表；非数组值视为空列表，非字符串元素被忽略。
pub async fn load_list(store: &dyn KvStore, negative: bool) -> Result<KeywordSet, StoreError> {
    let key = state::list_key(negative);
    let items = match store.get(key).await? {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => values
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                other => {
                    warn!("忽略非字符串关键词: {key}: {other}");
                    None
                }
            })
            .collect(),
        Some(other) => {
            warn!("关键词列表类型不符，按空列表处理: {key}: {other}");
            Vec::new()
        }
    };
    Ok(KeywordSet::from_vec(items))
}

/// 整体覆盖写入关键词列表。
pub async fn save_list(
    store: &dyn KvStore,
    negative: bool,
    set: &KeywordSet,
) -> Result<(), StoreError> {
    let value = Value::Array(set.iter().cloned().map(Value::String).collect());
    store.set(state::list_key(negative), value).await
}

/// 读取设置；解析失败时返回默认设置。
pub async fn load_settings(store: &dyn KvStore) -> Result<StoredSettings, StoreError> {
    match store.get(state::SETTINGS_KEY).await? {
        None | Some(Value::Null) => Ok(StoredSettings::default()),
        Some(value) => Ok(serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("设置记录解析失败，使用默认设置: {e}");
            StoredSettings::default()
        })),
    }
}

pub async fn save_settings(
    store: &dyn KvStore,
    settings: &StoredSettings,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(settings)
        .map_err(|e| StoreError::Unavailable(format!("序列化设置失败: {e}")))?;
    store.set(state::SETTINGS_KEY, value).await
}

/// 读取关键词元数据；不存在或无法解析时返回 `None`。
pub async fn load_meta(store: &dyn KvStore, clean: &str) -> Result<Option<KeywordMeta>, StoreError> {
    let key = state::meta_key(clean);
    Ok(store.get(&key).await?.and_then(|value| {
        serde_json::from_value(value)
            .map_err(|e| warn!("元数据解析失败: {key}: {e}"))
            .ok()
    }))
}

pub async fn save_meta(
    store: &dyn KvStore,
    clean: &str,
    meta: &KeywordMeta,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(meta)
        .map_err(|e| StoreError::Unavailable(format!("序列化元数据失败: {e}")))?;
    store.set(&state::meta_key(clean), value).await
}

pub async fn remove_meta(store: &dyn KvStore, clean: &str) -> Result<(), StoreError> {
    store.remove(&state::meta_key(clean)).await
}

/// 列出所有元数据记录的主体（去掉 `enhanced_` 前缀后的部分）。
pub async fn meta_subjects(store: &dyn KvStore) -> Result<Vec<String>, StoreError> {
    Ok(store
        .keys()
        .await?
        .into_iter()
        .filter_map(|key| key.strip_prefix(state::META_KEY_PREFIX).map(str::to_string))
        .collect())
}
