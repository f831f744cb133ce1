//! 协调器：关键词状态的唯一写入方，负责命令分发、存储读-改-写与变更广播。
//!
//! 启动状态机：
//! - `Uninitialized` → 验证存储 → `Ready`；验证失败回到 `Uninitialized`（可重试）
//! - 除 `ping` 外的命令在未就绪时触发一次（重新）初始化；初始化进行中到达的命令排队等待
//! - 初始化失败时命令以 `init` 错误返回，而不是挂起
//! - 初始化成功后清理孤立的关键词元数据（对应关键词已不在列表中）
//!
//! 并发约定：
//! - 同一协调器内，add/remove/save/clear 的读-改-写在写闸门内串行执行
//! - `saveKeywords` 仍是整体覆盖（后写覆盖先写，不合并）；多个调用方交替保存时以最后一次为准
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::export::{self, ExportFormat};
use crate::ipc::{Command, ErrorKind, Event, Reason, Reply, Request, Response, TabId};
use crate::keyword::{apply_match_type, detect_match_type, normalize, KeywordSet, MatchType, ParsedKeyword};
use crate::pages::{fan_out, summarize, PageRegistry};
use crate::state::{KeywordMeta, KeywordMetadata, KeywordSource, StoredSettings};
use crate::store::{self, KvStore, StoreError};
use crate::transform;

/// 界面事件总线容量。
const EVENT_BUS_CAPACITY: usize = 64;

/// 协调器初始化状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
}

/// 命令处理错误。
///
/// 说明：
/// - 所有错误都在命令边界转换为失败响应，不会跨越上下文抛出
/// - `Duplicate` / `NotFound` 是正常的失败结果，响应中同时携带 `added/removed:false`
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("存储初始化失败: {0}")]
    Init(String),
    #[error("未提供标签页 ID")]
    NoTab,
    #[error("关键词抓取失败: {0}")]
    Scrape(String),
    #[error("duplicate")]
    Duplicate { keyword: String, negative: bool },
    #[error("not_found")]
    NotFound { keyword: String, negative: bool },
    #[error("参数错误: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Init(_) => ErrorKind::Init,
            CoordinatorError::NoTab => ErrorKind::NoTab,
            CoordinatorError::Scrape(_) => ErrorKind::Scrape,
            CoordinatorError::Duplicate { .. } => ErrorKind::Duplicate,
            CoordinatorError::NotFound { .. } => ErrorKind::NotFound,
            CoordinatorError::InvalidInput(_) => ErrorKind::InvalidInput,
            CoordinatorError::Store(_) => ErrorKind::Storage,
        }
    }

    /// 失败响应中附带的应答数据。
    fn reply(&self) -> Option<Reply> {
        match self {
            CoordinatorError::Duplicate { keyword, negative } => Some(Reply::Added {
                added: false,
                reason: Some(Reason::Duplicate),
                keyword: keyword.clone(),
                negative: *negative,
            }),
            CoordinatorError::NotFound { keyword, negative } => Some(Reply::Removed {
                removed: false,
                reason: Some(Reason::NotFound),
                keyword: keyword.clone(),
                negative: *negative,
            }),
            _ => None,
        }
    }
}

/// 元数据主体：否定关键词带 `-` 前缀，避免与同名正向关键词共用一条记录。
fn meta_subject(clean: &str, negative: bool) -> String {
    if negative {
        format!("-{clean}")
    } else {
        clean.to_string()
    }
}

/// 协调器。
pub struct Coordinator {
    store: Arc<dyn KvStore>,
    pages: Arc<PageRegistry>,
    bus: broadcast::Sender<Event>,
    state: watch::Sender<InitState>,
    init_gate: Mutex<()>,
    write_gate: Mutex<()>,
}

impl Coordinator {
    /// 创建协调器（初始状态 `Uninitialized`，不做 IO）。
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (state, _) = watch::channel(InitState::Uninitialized);
        Self {
            store,
            pages: Arc::new(PageRegistry::new()),
            bus,
            state,
            init_gate: Mutex::new(()),
            write_gate: Mutex::new(()),
        }
    }

    pub fn state(&self) -> InitState {
        *self.state.borrow()
    }

    /// 观察状态变化（测试与诊断使用）。
    pub fn watch_state(&self) -> watch::Receiver<InitState> {
        self.state.subscribe()
    }

    pub fn pages(&self) -> &Arc<PageRegistry> {
        &self.pages
    }

    /// 订阅界面事件。
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// 当前界面订阅者数量。
    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }

    /// 首次激活：尝试初始化；失败时保持 `Uninitialized`，后续命令会再次尝试。
    pub async fn activate(&self) -> InitState {
        if let Err(e) = self.ensure_ready().await {
            warn!("协调器首次激活失败，将在下一条命令时重试: {e}");
        }
        self.state()
    }

    /// 确保已就绪；必要时执行（重新）初始化。
    ///
    /// 异常处理：
    /// - 存储验证失败返回 [`CoordinatorError::Init`]，状态回到 `Uninitialized`
    pub async fn ensure_ready(&self) -> Result<(), CoordinatorError> {
        if self.state() == InitState::Ready {
            return Ok(());
        }
        let _gate = self.init_gate.lock().await;
        // 排队期间前一次初始化可能已经成功。
        if self.state() == InitState::Ready {
            return Ok(());
        }
        self.state.send_replace(InitState::Initializing);
        match self.store.verify().await {
            Ok(()) => {
                {
                    let _write = self.write_gate.lock().await;
                    self.prune_orphan_meta().await;
                }
                self.state.send_replace(InitState::Ready);
                info!("协调器已就绪");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(InitState::Uninitialized);
                warn!("存储验证失败: {e}");
                Err(CoordinatorError::Init(e.to_string()))
            }
        }
    }

    /// 处理一条请求并返回恰好一个响应。
    pub async fn handle(&self, request: Request) -> Response {
        let Request {
            request_id,
            command,
        } = request;
        let name = command.name();
        debug!("处理命令: {name} ({request_id})");

        let result = match command {
            Command::Ping => Ok(self.ping()),
            other => match self.ensure_ready().await {
                Ok(()) => self.dispatch(other).await,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(reply) => Response::ok(request_id, reply),
            Err(e) => {
                match e.kind() {
                    ErrorKind::Duplicate | ErrorKind::NotFound => {
                        debug!("命令未生效: {name}: {e}")
                    }
                    _ => warn!("命令失败: {name}: {e}"),
                }
                Response::fail(request_id, e.kind(), e.to_string(), e.reply())
            }
        }
    }

    fn ping(&self) -> Reply {
        let state = self.state();
        Reply::Pong {
            ready: state == InitState::Ready,
            state,
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Reply, CoordinatorError> {
        match command {
            Command::Ping => Ok(self.ping()),
            Command::DetectKeywords { tab_id } => self.detect_keywords(tab_id).await,
            Command::SaveKeywords { keywords, negative } => {
                self.save_keywords(keywords, negative).await
            }
            Command::LoadKeywords => self.load_keywords().await,
            Command::ExportKeywords { format, negative } => {
                self.export_keywords(format, negative).await
            }
            Command::AddKeyword {
                keyword,
                metadata,
                is_negative,
                match_type,
            } => self.add_keyword(&keyword, metadata, is_negative, match_type).await,
            Command::RemoveKeyword {
                keyword,
                is_negative,
            } => self.remove_keyword(&keyword, is_negative).await,
            Command::BroadcastHighlight { keywords, on } => {
                Ok(self.broadcast_highlight(keywords, on).await)
            }
            Command::LoadSettings => Ok(Reply::Settings {
                settings: store::load_settings(self.store.as_ref()).await?,
            }),
            Command::SaveSettings { settings } => self.save_settings(settings).await,
            Command::ClearKeywords { negative } => self.clear_keywords(negative).await,
        }
    }

    /// 解析目标集合与写入文本。
    ///
    /// 规则：
    /// - `is_negative` 为空时按 `-` 前缀识别
    /// - 写入否定集合的文本去掉 `-` 前缀，保留匹配类型包裹
    fn resolve_target(keyword: &str, is_negative: Option<bool>) -> Result<(String, bool), CoordinatorError> {
        let parsed = ParsedKeyword::parse(keyword);
        let negative = is_negative.unwrap_or(parsed.negative);
        let entry = if negative {
            ParsedKeyword::body(keyword).to_string()
        } else {
            keyword.trim().to_string()
        };
        if normalize(&entry).is_empty() {
            return Err(CoordinatorError::InvalidInput("关键词为空".to_string()));
        }
        Ok((entry, negative))
    }

    /// 添加关键词。
    ///
    /// 匹配类型：
    /// - 显式给出 `match_type` 时按该类型重新包裹
    /// - 否则未带包裹的（广泛匹配）输入使用设置中的 `default_match_type`
    async fn add_keyword(
        &self,
        keyword: &str,
        metadata: Option<KeywordMetadata>,
        is_negative: Option<bool>,
        match_type: Option<MatchType>,
    ) -> Result<Reply, CoordinatorError> {
        let (entry, negative) = Self::resolve_target(keyword, is_negative)?;
        let entry = match match_type {
            Some(mt) => apply_match_type(&entry, mt),
            None if detect_match_type(&entry) == MatchType::Broad => {
                let default = self.settings_or_default().await.default_match_type;
                apply_match_type(&entry, default)
            }
            None => entry,
        };
        let clean = normalize(&entry);
        {
            let _write = self.write_gate.lock().await;
            let store = self.store.as_ref();
            let mut set = store::load_list(store, negative).await?;
            if !set.insert(entry.clone()) {
                return Err(CoordinatorError::Duplicate {
                    keyword: entry,
                    negative,
                });
            }
            store::save_list(store, negative, &set).await?;

            let metadata = metadata.unwrap_or_default();
            let mut meta = KeywordMeta::new(
                metadata.source.unwrap_or(KeywordSource::Manual),
                detect_match_type(&entry),
                negative,
            );
            meta.context = metadata.context;
            if let Err(e) = store::save_meta(store, &meta_subject(&clean, negative), &meta).await {
                warn!("关键词元数据写入失败（列表已保存）: {clean}: {e}");
            }
        }
        info!("已添加关键词: {entry} (negative={negative})");
        self.publish_update().await;
        Ok(Reply::Added {
            added: true,
            reason: None,
            keyword: entry,
            negative,
        })
    }

    async fn remove_keyword(
        &self,
        keyword: &str,
        is_negative: Option<bool>,
    ) -> Result<Reply, CoordinatorError> {
        let (entry, negative) = Self::resolve_target(keyword, is_negative)?;
        let removed = {
            let _write = self.write_gate.lock().await;
            let store = self.store.as_ref();
            let mut set = store::load_list(store, negative).await?;
            let Some(removed) = set.remove(&entry) else {
                return Err(CoordinatorError::NotFound {
                    keyword: entry,
                    negative,
                });
            };
            store::save_list(store, negative, &set).await?;
            let subject = meta_subject(&normalize(&removed), negative);
            if let Err(e) = store::remove_meta(store, &subject).await {
                warn!("关键词元数据删除失败: {subject}: {e}");
            }
            removed
        };
        info!("已移除关键词: {removed} (negative={negative})");
        self.publish_update().await;
        Ok(Reply::Removed {
            removed: true,
            reason: None,
            keyword: removed,
            negative,
        })
    }

    async fn save_keywords(
        &self,
        keywords: Vec<String>,
        negative: bool,
    ) -> Result<Reply, CoordinatorError> {
        let set = KeywordSet::from_vec(keywords);
        {
            let _write = self.write_gate.lock().await;
            store::save_list(self.store.as_ref(), negative, &set).await?;
            self.prune_orphan_meta().await;
        }
        info!("已保存关键词列表: {} 条 (negative={negative})", set.len());
        self.publish_update().await;
        Ok(Reply::Saved {
            negative,
            count: set.len(),
        })
    }

    async fn load_keywords(&self) -> Result<Reply, CoordinatorError> {
        let store = self.store.as_ref();
        Ok(Reply::Keywords {
            positive: store::load_list(store, false).await?.into_vec(),
            negative: store::load_list(store, true).await?.into_vec(),
        })
    }

    async fn export_keywords(
        &self,
        format: ExportFormat,
        negative: bool,
    ) -> Result<Reply, CoordinatorError> {
        let list = store::load_list(self.store.as_ref(), negative).await?.into_vec();
        let now = OffsetDateTime::now_utc();
        let content = export::render(&list, format, now)
            .map_err(|e| CoordinatorError::InvalidInput(format!("导出失败: {e}")))?;
        Ok(Reply::Exported {
            format,
            file_name: format.file_name(now),
            mime: format.mime().to_string(),
            keyword_count: list.len(),
            content,
        })
    }

    async fn detect_keywords(&self, tab_id: Option<TabId>) -> Result<Reply, CoordinatorError> {
        let tab_id = tab_id.ok_or(CoordinatorError::NoTab)?;
        let page = self
            .pages
            .get(tab_id)
            .await
            .ok_or_else(|| CoordinatorError::Scrape(format!("标签页 {tab_id} 没有在线的页面代理")))?;
        let raw = page
            .agent
            .scrape()
            .await
            .map_err(|e| CoordinatorError::Scrape(e.to_string()))?;
        let keywords = transform::dedupe(&transform::trim_empty(&raw));
        if keywords.is_empty() {
            return Err(CoordinatorError::Scrape(format!("标签页 {tab_id} 未返回任何关键词")));
        }
        info!("标签页 {tab_id} 检测到 {} 个候选关键词", keywords.len());
        Ok(Reply::Detected { tab_id, keywords })
    }

    /// 广播高亮；每个页面独立投递，失败只记录日志。
    ///
    /// 说明：
    /// - 设置中关闭高亮时，开启请求不投递（`suppressed: true`）；关闭请求照常投递
    /// - 开启时附带设置中的高亮颜色
    async fn broadcast_highlight(&self, keywords: Vec<String>, on: bool) -> Reply {
        let settings = self.settings_or_default().await;
        if on && !settings.highlight_enabled {
            info!("高亮已在设置中关闭，跳过广播");
            return Reply::Highlight {
                delivered: Vec::new(),
                failed: Vec::new(),
                suppressed: true,
            };
        }
        let color = on.then(|| settings.highlight_color.clone());
        let _ = self.bus.send(Event::Highlight {
            keywords: keywords.clone(),
            on,
            color: color.clone(),
        });
        let pages = self.pages.matching(|url| settings.matches_site(url)).await;
        let deliveries = fan_out(pages, |page| {
            let keywords = keywords.clone();
            let color = color.clone();
            async move {
                page.agent
                    .apply_highlight(&keywords, on, color.as_deref())
                    .await
                    .map(|_| ())
            }
        })
        .await;
        let (delivered, failed) = summarize(&deliveries);
        for f in &failed {
            debug!("高亮投递失败（忽略）: tab={} {}", f.tab_id, f.error);
        }
        Reply::Highlight {
            delivered,
            failed,
            suppressed: false,
        }
    }

    async fn save_settings(&self, settings: StoredSettings) -> Result<Reply, CoordinatorError> {
        {
            let _write = self.write_gate.lock().await;
            store::save_settings(self.store.as_ref(), &settings).await?;
        }
        info!("设置已保存: {:?}", settings.redacted());
        Ok(Reply::Settings { settings })
    }

    async fn clear_keywords(&self, negative: Option<bool>) -> Result<Reply, CoordinatorError> {
        let targets: &[bool] = match negative {
            Some(true) => &[true],
            Some(false) => &[false],
            None => &[false, true],
        };
        {
            let _write = self.write_gate.lock().await;
            let store = self.store.as_ref();
            for &neg in targets {
                let set = store::load_list(store, neg).await?;
                store::save_list(store, neg, &KeywordSet::new()).await?;
                for entry in set.iter() {
                    let subject = meta_subject(&normalize(entry), neg);
                    if let Err(e) = store::remove_meta(store, &subject).await {
                        warn!("关键词元数据删除失败: {subject}: {e}");
                    }
                }
            }
        }
        info!("已清空关键词列表: {targets:?}");
        self.publish_update().await;
        Ok(Reply::Cleared {
            positive: targets.contains(&false),
            negative: targets.contains(&true),
        })
    }

    /// 当前设置；读取失败时按默认设置处理。
    async fn settings_or_default(&self) -> StoredSettings {
        match store::load_settings(self.store.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                warn!("读取设置失败，使用默认设置: {e}");
                StoredSettings::default()
            }
        }
    }

    /// 当前设置下的目标页面。
    async fn target_pages(&self) -> Vec<crate::pages::PageHandle> {
        let settings = self.settings_or_default().await;
        self.pages.matching(|url| settings.matches_site(url)).await
    }

    /// 删除对应关键词已不在列表中的元数据记录（需在写闸门内调用）。
    ///
    /// 说明：
    /// - `saveKeywords` 整体覆盖列表时不会逐条删除元数据，孤立记录在此统一清理
    /// - 清理失败只记录日志
    async fn prune_orphan_meta(&self) -> usize {
        let store = self.store.as_ref();
        let scan = async {
            let positive = store::load_list(store, false).await?;
            let negative = store::load_list(store, true).await?;
            let mut orphans = Vec::new();
            for subject in store::meta_subjects(store).await? {
                let meta = store::load_meta(store, &subject).await?;
                let is_negative = meta.map(|m| m.negative).unwrap_or_else(|| subject.starts_with('-'));
                let alive = if is_negative {
                    negative.contains(subject.strip_prefix('-').unwrap_or(&subject))
                } else {
                    positive.contains(&subject)
                };
                if !alive {
                    orphans.push(subject);
                }
            }
            for subject in &orphans {
                store::remove_meta(store, subject).await?;
            }
            Ok::<_, StoreError>(orphans.len())
        };
        match scan.await {
            Ok(0) => 0,
            Ok(n) => {
                info!("已清理 {n} 条孤立的关键词元数据");
                n
            }
            Err(e) => {
                warn!("清理关键词元数据失败: {e}");
                0
            }
        }
    }

    /// 变更后异步通知界面与匹配站点的页面；通知失败只记录日志。
    async fn publish_update(&self) {
        let store = self.store.as_ref();
        let lists = async {
            Ok::<_, StoreError>((
                store::load_list(store, false).await?.into_vec(),
                store::load_list(store, true).await?.into_vec(),
            ))
        };
        let (positive, negative) = match lists.await {
            Ok(lists) => lists,
            Err(e) => {
                warn!("读取列表失败，跳过变更通知: {e}");
                return;
            }
        };
        let event = Event::KeywordsUpdated { positive, negative };
        if self.bus.send(event.clone()).is_err() {
            debug!("没有界面订阅者，跳过界面通知");
        }

        let pages = self.target_pages().await;
        if pages.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let deliveries = fan_out(pages, |page| {
                let event = event.clone();
                async move { page.agent.notify(&event).await }
            })
            .await;
            for d in deliveries {
                if let Err(e) = d.outcome {
                    debug!("页面通知失败（忽略）: tab={} {e}", d.tab_id);
                }
            }
        });
    }
}
