//! 页面代理抽象、在线页面登记表与广播投递。
//!
//! 说明：
//! - 页面代理是外部协作方：可能未加载、不在目标站点或随时断开
//! - 广播为“尽力而为”：每个接收方独立成功/失败，结果以列表形式返回
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::ipc::{Event, FailedDelivery, TabId};

/// 页面代理调用错误。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("页面代理已断开")]
    Disconnected,
    #[error("页面代理响应超时")]
    Timeout,
    #[error("页面代理返回了不匹配的应答")]
    UnexpectedReply,
    #[error("页面连接发送队列已满")]
    QueueFull,
    #[error("页面代理执行失败: {0}")]
    Failed(String),
}

/// 页面代理能力。
///
/// 实现方：
/// - 协调器侧：通过连接转发调用的远程代理
/// - 页面侧：真正执行抓取/高亮的本地实现
#[async_trait]
pub trait PageAgent: Send + Sync {
    /// 抓取候选关键词（尽力而为，无正确性保证）。
    async fn scrape(&self) -> Result<Vec<String>, AgentError>;

    /// 高亮开关（幂等），返回实际生效的关键词数量；`color` 为空时使用页面默认样式。
    async fn apply_highlight(&self, keywords: &[String], on: bool, color: Option<&str>) -> Result<usize, AgentError>;

    /// 状态变更通知（单向）。
    async fn notify(&self, event: &Event) -> Result<(), AgentError>;
}

/// 已登记的页面。
#[derive(Clone)]
pub struct PageHandle {
    pub tab_id: TabId,
    pub url: String,
    pub agent: Arc<dyn PageAgent>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("tab_id", &self.tab_id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// 在线页面登记表（标签 ID → 页面）。
#[derive(Debug, Default)]
pub struct PageRegistry {
    pages: RwLock<BTreeMap<TabId, PageHandle>>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记页面；同一标签页重复登记时替换旧连接并返回旧记录。
    pub async fn register(&self, handle: PageHandle) -> Option<PageHandle> {
        self.pages.write().await.insert(handle.tab_id, handle)
    }

    /// 注销页面；仅当登记的仍是同一个代理实例时才移除，避免误删重连后的新记录。
    pub async fn unregister(&self, tab_id: TabId, agent: &Arc<dyn PageAgent>) -> bool {
        let mut pages = self.pages.write().await;
        match pages.get(&tab_id) {
            Some(existing) if Arc::ptr_eq(&existing.agent, agent) => {
                pages.remove(&tab_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, tab_id: TabId) -> Option<PageHandle> {
        self.pages.read().await.get(&tab_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.pages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pages.read().await.is_empty()
    }

    /// 返回 URL 满足谓词的所有页面（按标签 ID 排序）。
    pub async fn matching<F>(&self, mut predicate: F) -> Vec<PageHandle>
    where
        F: FnMut(&str) -> bool,
    {
        self.pages
            .read()
            .await
            .values()
            .filter(|p| predicate(&p.url))
            .cloned()
            .collect()
    }
}

/// 单个接收方的投递结果。
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tab_id: TabId,
    pub outcome: Result<(), AgentError>,
}

/// 并发投递到所有页面并收集每个接收方的结果；任何一个失败都不会中止其他投递。
pub async fn fan_out<F, Fut>(pages: Vec<PageHandle>, op: F) -> Vec<Delivery>
where
    F: Fn(PageHandle) -> Fut,
    Fut: Future<Output = Result<(), AgentError>>,
{
    let tasks = pages.into_iter().map(|page| {
        let tab_id = page.tab_id;
        let fut = op(page);
        async move {
            Delivery {
                tab_id,
                outcome: fut.await,
            }
        }
    });
    futures::future::join_all(tasks).await
}

/// 将投递结果拆分为成功的标签 ID 与失败记录。
pub fn summarize(deliveries: &[Delivery]) -> (Vec<TabId>, Vec<FailedDelivery>) {
    let mut delivered = Vec::new();
    let mut failed = Vec::new();
    for d in deliveries {
        match &d.outcome {
            Ok(()) => delivered.push(d.tab_id),
            Err(e) => failed.push(FailedDelivery {
                tab_id: d.tab_id,
                error: e.to_string(),
            }),
        }
    }
    (delivered, failed)
}
