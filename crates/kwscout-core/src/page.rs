//! 页面侧会话：向协调器登记标签页，并用本地 [`PageAgent`] 应答协调器的调用。
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{classify_io, TcpTransport};
use crate::ipc::{
    read_frame_line, write_frame, AgentCall, AgentReply, ClientFrame, Command, Event, FrameLine, Response,
    ServerFrame, TabId, MAX_FRAME_BYTES,
};
use crate::keyword::{normalize, MatchType};
use crate::pages::{AgentError, PageAgent};
use crate::retry::{with_retry, ClientError, Messenger, RetryPolicy, TransportError};
use crate::state::{KeywordMetadata, KeywordSource};

struct PageConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// 建立一条页面连接并发送登记帧。
async fn open(addr: &str, tab_id: TabId, url: &str) -> Result<PageConnection, TransportError> {
    let stream = TcpStream::connect(addr).await.map_err(|e| classify_io(&e))?;
    let (reader, mut writer) = stream.into_split();
    let register = ClientFrame::Register {
        tab_id,
        url: url.to_string(),
    };
    write_frame(&mut writer, &register).await.map_err(|e| classify_io(&e))?;
    info!("标签页 {tab_id} 已登记: {url}");
    Ok(PageConnection {
        reader: BufReader::new(reader),
        writer,
    })
}

/// 已登记的页面连接。
///
/// 说明：
/// - 协调器重启或连接断开后，[`PageSession::run`] 按重试策略重新连接并重新登记
/// - 页面发起的命令（例如双击添加）通过 [`PageSession::commands`] 走短连接发送
pub struct PageSession {
    addr: String,
    tab_id: TabId,
    url: String,
    policy: RetryPolicy,
    conn: PageConnection,
}

impl PageSession {
    /// 连接协调器并登记标签页。
    ///
    /// 参数：
    /// - `addr`：协调器地址
    /// - `tab_id`：标签页 ID
    /// - `url`：页面地址（协调器据此判断是否属于目标站点）
    /// - `policy`：首次登记与断线重登记共用的重试策略
    ///
    /// 异常处理：
    /// - 协调器在重试上限内都不可达：[`ClientError::Communication`]
    /// - 其他写入失败：[`ClientError::Transport`]
    pub async fn connect(addr: &str, tab_id: TabId, url: &str, policy: RetryPolicy) -> Result<Self, ClientError> {
        let conn = with_retry(&policy, "登记标签页", || open(addr, tab_id, url)).await?;
        Ok(Self {
            addr: addr.to_string(),
            tab_id,
            url: url.to_string(),
            policy,
            conn,
        })
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    /// 页面发起命令的句柄（可克隆，可在 [`PageSession::run`] 运行期间使用）。
    pub fn commands(&self) -> PageCommands {
        PageCommands {
            tab_id: self.tab_id,
            url: self.url.clone(),
            messenger: Arc::new(Messenger::new(TcpTransport::new(self.addr.clone()), self.policy.clone())),
        }
    }

    /// 应答协调器调用；连接关闭后重新登记，直到协调器在重试上限内都不可达。
    ///
    /// 异常处理：
    /// - 重新登记失败：[`ClientError::Communication`]
    /// - 不可重试的传输错误：[`ClientError::Transport`]
    pub async fn run(mut self, agent: Arc<dyn PageAgent>) -> Result<(), ClientError> {
        loop {
            match serve_calls(&mut self.conn, agent.as_ref()).await {
                Ok(()) => info!("标签页 {} 的连接已被协调器关闭，重新登记", self.tab_id),
                Err(e) if e.is_retryable() => warn!("标签页 {} 的连接中断: {e}，重新登记", self.tab_id),
                Err(e) => return Err(ClientError::Transport(e)),
            }
            let conn = with_retry(&self.policy, "重新登记标签页", || {
                open(&self.addr, self.tab_id, &self.url)
            })
            .await?;
            self.conn = conn;
        }
    }
}

/// 在一条连接上应答调用直到对端关闭。
///
/// 说明：
/// - 超长、非 UTF-8 或无法解析的帧记录警告后跳过，不中断连接
async fn serve_calls(conn: &mut PageConnection, agent: &dyn PageAgent) -> Result<(), TransportError> {
    loop {
        let line = match read_frame_line(&mut conn.reader, MAX_FRAME_BYTES).await {
            Ok(FrameLine::Line(line)) => line,
            Ok(FrameLine::TooLong) => {
                warn!("忽略超长帧（上限 {MAX_FRAME_BYTES} 字节）");
                continue;
            }
            Ok(FrameLine::Eof) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("忽略非 UTF-8 帧: {e}");
                continue;
            }
            Err(e) => return Err(classify_io(&e)),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let frame: ServerFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("忽略无法解析的帧: {e}");
                continue;
            }
        };
        match frame {
            ServerFrame::AgentCall { call_id, call } => {
                let reply = answer(agent, call).await;
                write_frame(&mut conn.writer, &ClientFrame::AgentReply { call_id, reply })
                    .await
                    .map_err(|e| classify_io(&e))?;
            }
            ServerFrame::Event { event } => {
                if let Err(e) = agent.notify(&event).await {
                    debug!("处理通知失败: {e}");
                }
            }
            ServerFrame::Response { response } => {
                debug!("忽略响应帧: {}", response.request_id);
            }
        }
    }
}

async fn answer(agent: &dyn PageAgent, call: AgentCall) -> AgentReply {
    let result = match call {
        AgentCall::Scrape => agent.scrape().await.map(|keywords| AgentReply::Scraped { keywords }),
        AgentCall::ApplyHighlight { keywords, on, color } => agent
            .apply_highlight(&keywords, on, color.as_deref())
            .await
            .map(|applied| AgentReply::Highlighted { applied }),
    };
    result.unwrap_or_else(|e| AgentReply::Failed {
        message: e.to_string(),
    })
}

/// 页面发起的命令。
#[derive(Clone)]
pub struct PageCommands {
    tab_id: TabId,
    url: String,
    messenger: Arc<Messenger<TcpTransport>>,
}

impl PageCommands {
    /// 发送任意命令（带重试）。
    pub async fn send(&self, command: Command) -> Result<Response, ClientError> {
        self.messenger.call(command).await
    }

    /// 把页面上选中的文本作为正向关键词添加，成功后在本页高亮其基础形式。
    ///
    /// 参数：
    /// - `selection`：选中的文本（会先去掉包裹符号）
    /// - `match_type`：包裹方式
    /// - `agent`：本页代理，用于就地高亮
    ///
    /// 返回值：
    /// - 协调器的响应；重复等失败响应原样返回，此时不高亮
    ///
    /// 异常处理：
    /// - 通信失败返回 [`ClientError`]；本地高亮失败只记录调试日志
    pub async fn add_selection(
        &self,
        selection: &str,
        match_type: MatchType,
        agent: &dyn PageAgent,
    ) -> Result<Response, ClientError> {
        let base = normalize(selection);
        let mut context = BTreeMap::new();
        context.insert("tab_id".to_string(), json!(self.tab_id));
        context.insert("url".to_string(), json!(self.url));
        let response = self
            .send(Command::AddKeyword {
                keyword: base.clone(),
                metadata: Some(KeywordMetadata {
                    source: Some(KeywordSource::Page),
                    context,
                }),
                is_negative: Some(false),
                match_type: Some(match_type),
            })
            .await?;
        if response.success {
            if let Err(e) = agent.apply_highlight(std::slice::from_ref(&base), true, None).await {
                debug!("本页高亮失败: {base}: {e}");
            }
        }
        Ok(response)
    }
}

/// 以文本文件作为页面内容的代理：每个非空行是一个候选关键词。
pub struct TextSourcePage {
    path: PathBuf,
    highlighted: Mutex<BTreeSet<String>>,
    highlight_color: Mutex<Option<String>>,
    last_update: Mutex<Option<Event>>,
}

impl TextSourcePage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            highlighted: Mutex::new(BTreeSet::new()),
            highlight_color: Mutex::new(None),
            last_update: Mutex::new(None),
        }
    }

    /// 当前处于高亮状态的关键词。
    pub async fn highlighted(&self) -> Vec<String> {
        self.highlighted.lock().await.iter().cloned().collect()
    }

    /// 最近一次开启高亮时指定的颜色。
    pub async fn highlight_color(&self) -> Option<String> {
        self.highlight_color.lock().await.clone()
    }

    /// 最近一次收到的关键词变更通知。
    pub async fn last_update(&self) -> Option<Event> {
        self.last_update.lock().await.clone()
    }

    async fn read_lines(&self) -> Result<Vec<String>, AgentError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AgentError::Failed(format!("读取页面内容失败 {}: {e}", self.path.display())))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl PageAgent for TextSourcePage {
    async fn scrape(&self) -> Result<Vec<String>, AgentError> {
        self.read_lines().await
    }

    /// 开启时只高亮页面中出现的关键词（不区分大小写）；关闭时移除给定关键词。
    async fn apply_highlight(&self, keywords: &[String], on: bool, color: Option<&str>) -> Result<usize, AgentError> {
        let mut highlighted = self.highlighted.lock().await;
        if !on {
            return Ok(keywords.iter().filter(|k| highlighted.remove(k.as_str())).count());
        }
        if let Some(color) = color {
            *self.highlight_color.lock().await = Some(color.to_string());
        }
        let text = self.read_lines().await?.join("\n").to_lowercase();
        let mut applied = 0;
        for keyword in keywords {
            if !keyword.is_empty() && text.contains(&keyword.to_lowercase()) {
                highlighted.insert(keyword.clone());
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn notify(&self, event: &Event) -> Result<(), AgentError> {
        if let Event::KeywordsUpdated { positive, negative } = event {
            debug!("关键词已更新: {} 个正向, {} 个否定", positive.len(), negative.len());
            *self.last_update.lock().await = Some(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CleanupDir(PathBuf);

    impl Drop for CleanupDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn source(lines: &str) -> (CleanupDir, TextSourcePage) {
        let dir = std::env::temp_dir().join(format!("kwscout-page-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("page.txt");
        std::fs::write(&file, lines).unwrap();
        (CleanupDir(dir), TextSourcePage::new(file))
    }

    #[tokio::test]
    async fn scrape_returns_non_empty_lines() {
        let (_guard, page) = source("running shoes\n\n  trail shoes  \n");
        assert_eq!(
            page.scrape().await.unwrap(),
            vec!["running shoes".to_string(), "trail shoes".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_source_fails_scrape() {
        let page = TextSourcePage::new(std::env::temp_dir().join(format!("missing-{}", uuid::Uuid::new_v4())));
        assert!(matches!(page.scrape().await, Err(AgentError::Failed(_))));
    }

    #[tokio::test]
    async fn highlight_toggle_is_idempotent() {
        let (_guard, page) = source("Running Shoes\nsocks\n");
        let keywords = vec!["running shoes".to_string(), "hats".to_string()];
        assert_eq!(page.apply_highlight(&keywords, true, None).await.unwrap(), 1);
        assert_eq!(page.apply_highlight(&keywords, true, None).await.unwrap(), 1);
        assert_eq!(page.highlighted().await, vec!["running shoes".to_string()]);

        assert_eq!(page.apply_highlight(&keywords, false, None).await.unwrap(), 1);
        assert_eq!(page.apply_highlight(&keywords, false, None).await.unwrap(), 0);
        assert!(page.highlighted().await.is_empty());
    }

    #[tokio::test]
    async fn answer_maps_agent_errors_to_failed_reply() {
        let page = TextSourcePage::new(std::env::temp_dir().join(format!("missing-{}", uuid::Uuid::new_v4())));
        let reply = answer(&page, AgentCall::Scrape).await;
        assert!(matches!(reply, AgentReply::Failed { .. }));
    }

    #[tokio::test]
    async fn answer_passes_highlight_color_to_agent() {
        let (_guard, page) = source("running shoes\n");
        let reply = answer(
            &page,
            AgentCall::ApplyHighlight {
                keywords: vec!["running shoes".to_string()],
                on: true,
                color: Some("#ffeb3b".to_string()),
            },
        )
        .await;
        assert!(matches!(reply, AgentReply::Highlighted { applied: 1 }));
        assert_eq!(page.highlight_color().await.as_deref(), Some("#ffeb3b"));
    }

    #[tokio::test]
    async fn serve_calls_skips_garbage_and_answers_next_call() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let call_id = uuid::Uuid::new_v4();
        let coordinator_side = tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let register = lines.next_line().await.unwrap().unwrap();
            assert!(register.contains("register"));
            writer.write_all(b"not json\n").await.unwrap();
            let call = ServerFrame::AgentCall {
                call_id,
                call: AgentCall::Scrape,
            };
            write_frame(&mut writer, &call).await.unwrap();
            let reply = lines.next_line().await.unwrap().unwrap();
            drop(writer);
            reply
        });

        let (_guard, page) = source("trail shoes\n");
        let mut conn = open(&addr, 3, "https://ads.example/x").await.unwrap();
        serve_calls(&mut conn, &page).await.unwrap();

        let reply: ClientFrame = serde_json::from_str(&coordinator_side.await.unwrap()).unwrap();
        match reply {
            ClientFrame::AgentReply {
                call_id: id,
                reply: AgentReply::Scraped { keywords },
            } => {
                assert_eq!(id, call_id);
                assert_eq!(keywords, vec!["trail shoes".to_string()]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
