//! 协调器 IPC 服务：本机 TCP，单行一条 JSON。
//!
//! 每个连接：
//! - 读循环解析 [`ClientFrame`]，每个请求在独立任务中处理（页面在被调用期间仍可发起命令）
//! - 写循环从有界队列中取出 [`ServerFrame`] 顺序写回；事件在队列满时丢弃并记录日志
//! - 单行超过 [`MAX_FRAME_BYTES`] 时丢弃该行并回复 `invalid_input`
//! - `register` 后该连接同时承载协调器对该标签页的调用（见 [`RemotePage`]）
//! - `subscribe` 后转发事件总线上的状态变更
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::ipc::{
    read_frame_line, write_frame, AgentCall, AgentReply, ClientFrame, ErrorKind, Event, FrameLine, Response,
    ServerFrame, TabId, MAX_FRAME_BYTES,
};
use crate::pages::{AgentError, PageAgent, PageHandle};

/// 每个连接的发送队列容量。
pub const OUTBOX_CAPACITY: usize = 256;

/// 服务配置。
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 等待页面代理应答的上限。
    pub call_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// 监听主循环：接收连接并为每个连接启动异步任务。
///
/// 参数：
/// - `listener`：已绑定的监听端口
/// - `coordinator`：共享协调器
/// - `config`：服务配置
///
/// 说明：
/// - 连接任务归属于本循环；本 future 被丢弃（例如所在任务被中止）时所有连接随之关闭
///
/// 异常处理：
/// - `accept()` 失败会直接向上传播（通常为系统资源问题）
pub async fn serve(listener: TcpListener, coordinator: Arc<Coordinator>, config: ServerConfig) -> Result<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("接受 IPC 连接失败")?;
                debug!("新连接: {peer}");
                let coordinator = coordinator.clone();
                let config = config.clone();
                connections.spawn(async move {
                    handle_connection(stream, coordinator, config).await;
                    debug!("连接关闭: {peer}");
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// 等待中的页面调用（call_id → 应答通道）。
#[derive(Default)]
struct PendingCalls {
    inner: Mutex<HashMap<Uuid, oneshot::Sender<AgentReply>>>,
}

impl PendingCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<AgentReply>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, call_id: Uuid, tx: oneshot::Sender<AgentReply>) {
        self.lock().insert(call_id, tx);
    }

    fn remove(&self, call_id: &Uuid) {
        self.lock().remove(call_id);
    }

    /// 完成调用；未知 call_id 返回 `false`。
    fn complete(&self, call_id: &Uuid, reply: AgentReply) -> bool {
        match self.lock().remove(call_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// 丢弃全部等待者，调用方随即得到“已断开”。
    fn fail_all(&self) -> usize {
        let mut calls = self.lock();
        let n = calls.len();
        calls.clear();
        n
    }
}

/// 协调器侧的页面代理：把调用转成 `agent_call` 帧发往页面连接。
pub struct RemotePage {
    tx: mpsc::Sender<ServerFrame>,
    pending: Arc<PendingCalls>,
    call_timeout: Duration,
}

impl RemotePage {
    async fn call(&self, call: AgentCall) -> Result<AgentReply, AgentError> {
        let call_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);
        if self.tx.send(ServerFrame::AgentCall { call_id, call }).await.is_err() {
            self.pending.remove(&call_id);
            return Err(AgentError::Disconnected);
        }
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AgentError::Disconnected),
            Err(_) => {
                self.pending.remove(&call_id);
                Err(AgentError::Timeout)
            }
        }
    }
}

#[async_trait]
impl PageAgent for RemotePage {
    async fn scrape(&self) -> Result<Vec<String>, AgentError> {
        match self.call(AgentCall::Scrape).await? {
            AgentReply::Scraped { keywords } => Ok(keywords),
            AgentReply::Failed { message } => Err(AgentError::Failed(message)),
            AgentReply::Highlighted { .. } => Err(AgentError::UnexpectedReply),
        }
    }

    async fn apply_highlight(&self, keywords: &[String], on: bool, color: Option<&str>) -> Result<usize, AgentError> {
        let call = AgentCall::ApplyHighlight {
            keywords: keywords.to_vec(),
            on,
            color: color.map(str::to_string),
        };
        match self.call(call).await? {
            AgentReply::Highlighted { applied } => Ok(applied),
            AgentReply::Failed { message } => Err(AgentError::Failed(message)),
            AgentReply::Scraped { .. } => Err(AgentError::UnexpectedReply),
        }
    }

    /// 通知不等待队列空位：队列满时本次通知失败。
    async fn notify(&self, event: &Event) -> Result<(), AgentError> {
        match self.tx.try_send(ServerFrame::Event { event: event.clone() }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AgentError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(AgentError::Disconnected),
        }
    }
}

async fn handle_connection(stream: TcpStream, coordinator: Arc<Coordinator>, config: ServerConfig) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<ServerFrame>(OUTBOX_CAPACITY);
    // 读循环结束并释放发送端后，写循环写完队列中剩余的帧再退出。
    tokio::join!(write_frames(writer, rx), read_frames(reader, tx, coordinator, config));
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("写回失败，停止写循环: {e}");
            break;
        }
    }
}

async fn read_frames(
    reader: OwnedReadHalf,
    tx: mpsc::Sender<ServerFrame>,
    coordinator: Arc<Coordinator>,
    config: ServerConfig,
) {
    let pending = Arc::new(PendingCalls::default());
    let mut page: Option<(TabId, Arc<dyn PageAgent>)> = None;
    let mut subscription: Option<JoinHandle<()>> = None;

    let mut reader = BufReader::new(reader);
    loop {
        let line = match read_frame_line(&mut reader, MAX_FRAME_BYTES).await {
            Ok(FrameLine::Line(line)) => line,
            Ok(FrameLine::TooLong) => {
                warn!("丢弃超过 {MAX_FRAME_BYTES} 字节的请求行");
                let resp = Response::fail(Uuid::nil(), ErrorKind::InvalidInput, "frame too long", None);
                if tx.send(ServerFrame::Response { response: resp }).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(FrameLine::Eof) => break,
            Err(e) => {
                debug!("读取连接失败: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: ClientFrame = match serde_json::from_str(line.trim()) {
            Ok(v) => v,
            Err(e) => {
                let resp = Response::fail(Uuid::nil(), ErrorKind::InvalidInput, format!("bad request: {e}"), None);
                if tx.send(ServerFrame::Response { response: resp }).await.is_err() {
                    break;
                }
                continue;
            }
        };
        match frame {
            ClientFrame::Request { request } => {
                let coordinator = coordinator.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = coordinator.handle(request).await;
                    let _ = tx.send(ServerFrame::Response { response }).await;
                });
            }
            ClientFrame::Register { tab_id, url } => {
                let agent: Arc<dyn PageAgent> = Arc::new(RemotePage {
                    tx: tx.clone(),
                    pending: pending.clone(),
                    call_timeout: config.call_timeout,
                });
                if let Some((old_tab, old_agent)) = page.take() {
                    coordinator.pages().unregister(old_tab, &old_agent).await;
                }
                let handle = PageHandle {
                    tab_id,
                    url: url.clone(),
                    agent: agent.clone(),
                };
                if coordinator.pages().register(handle).await.is_some() {
                    info!("标签页 {tab_id} 重新登记: {url}");
                } else {
                    info!("标签页 {tab_id} 登记: {url}");
                }
                page = Some((tab_id, agent));
            }
            ClientFrame::Subscribe => {
                if subscription.is_none() {
                    subscription = Some(spawn_forwarder(coordinator.subscribe(), tx.clone()));
                }
            }
            ClientFrame::AgentReply { call_id, reply } => {
                if !pending.complete(&call_id, reply) {
                    debug!("丢弃过期或未知的页面应答: {call_id}");
                }
            }
        }
    }

    if let Some((tab_id, agent)) = page.take() {
        if coordinator.pages().unregister(tab_id, &agent).await {
            info!("标签页 {tab_id} 已断开");
        }
    }
    if let Some(task) = subscription.take() {
        task.abort();
    }
    let dropped = pending.fail_all();
    if dropped > 0 {
        debug!("连接断开，{dropped} 个页面调用失败");
    }
}

/// 把总线事件转发到连接的发送队列；队列满时丢弃该事件。
fn spawn_forwarder(mut events: broadcast::Receiver<Event>, tx: mpsc::Sender<ServerFrame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match tx.try_send(ServerFrame::Event { event }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("订阅方发送队列已满，丢弃一条事件"),
                    Err(TrySendError::Closed(_)) => break,
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("订阅方处理过慢，跳过 {n} 条事件");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
