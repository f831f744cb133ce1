//! 本机 IPC 协议定义（命令/响应/事件/页面调用）。
//!
//! 协议形态：
//! - 以 JSON 序列化帧，按“单行一条消息”的方式传输
//! - 客户端 → 协调器：[`ClientFrame`]；协调器 → 客户端：[`ServerFrame`]
//! - 每个 [`Command`] 恰好得到一个 [`Response`]，通过 `request_id` 关联
//! - [`Event`] 为单向通知，不需要应答
//!
//! 约束与注意事项：
//! - `message` 字段不应包含敏感信息（API 密钥等）
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::coordinator::InitState;
use crate::export::ExportFormat;
use crate::keyword::MatchType;
use crate::state::{KeywordMetadata, StoredSettings};

/// 页面标签 ID。
pub type TabId = u64;

/// 协调器命令（封闭的标签联合，每个 action 一个变体）。
///
/// 序列化格式：
/// - `{"action": "addKeyword", "keyword": "shoes", "isNegative": false}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    /// 存活/就绪校验；不等待初始化。
    Ping,
    /// 委托指定标签页的页面代理抓取候选关键词。
    DetectKeywords {
        #[serde(default)]
        tab_id: Option<TabId>,
    },
    /// 整体覆盖保存列表（后写覆盖，不合并）。
    SaveKeywords {
        keywords: Vec<String>,
        #[serde(default)]
        negative: bool,
    },
    /// 读取正/负两个列表。
    LoadKeywords,
    /// 按格式导出列表。
    ExportKeywords {
        #[serde(default)]
        format: ExportFormat,
        #[serde(default)]
        negative: bool,
    },
    /// 添加单个关键词；`is_negative` 为空时按 `-` 前缀自动识别。
    ///
    /// `match_type` 给出时按该类型包裹；为空且关键词未带包裹时使用设置中的默认匹配类型。
    AddKeyword {
        keyword: String,
        #[serde(default)]
        metadata: Option<KeywordMetadata>,
        #[serde(default)]
        is_negative: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_type: Option<MatchType>,
    },
    /// 移除单个关键词；`is_negative` 为空时按 `-` 前缀自动识别。
    RemoveKeyword {
        keyword: String,
        #[serde(default)]
        is_negative: Option<bool>,
    },
    /// 向所有匹配站点的页面广播高亮（尽力而为）。
    BroadcastHighlight {
        keywords: Vec<String>,
        #[serde(default = "default_on")]
        on: bool,
    },
    LoadSettings,
    SaveSettings {
        settings: StoredSettings,
    },
    /// 清空列表；`negative` 为空表示两个列表都清空。
    ClearKeywords {
        #[serde(default)]
        negative: Option<bool>,
    },
}

fn default_on() -> bool {
    true
}

impl Command {
    /// 命令名（与 `action` 字段一致，用于日志）。
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::DetectKeywords { .. } => "detectKeywords",
            Command::SaveKeywords { .. } => "saveKeywords",
            Command::LoadKeywords => "loadKeywords",
            Command::ExportKeywords { .. } => "exportKeywords",
            Command::AddKeyword { .. } => "addKeyword",
            Command::RemoveKeyword { .. } => "removeKeyword",
            Command::BroadcastHighlight { .. } => "broadcastHighlight",
            Command::LoadSettings => "loadSettings",
            Command::SaveSettings { .. } => "saveSettings",
            Command::ClearKeywords { .. } => "clearKeywords",
        }
    }
}

/// 请求：命令 + 请求 ID。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: Uuid,
    pub command: Command,
}

impl Request {
    /// 使用随机请求 ID 包装命令。
    pub fn new(command: Command) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            command,
        }
    }
}

/// 失败原因（`added:false` / `removed:false` 时携带）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Duplicate,
    NotFound,
}

/// 错误分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 重试耗尽后仍无法联系接收方。
    Communication,
    /// 存储验证失败，协调器未就绪。
    Init,
    /// 缺少标签页 ID。
    NoTab,
    /// 页面代理不可达或未返回内容。
    Scrape,
    /// 关键词已存在（非致命）。
    Duplicate,
    /// 关键词不存在（非致命）。
    NotFound,
    /// 请求格式或参数错误。
    InvalidInput,
    /// 存储读写失败。
    Storage,
    /// 外部文本生成服务调用失败。
    Api,
}

/// 错误体。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// 单个接收方的投递失败记录。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub tab_id: TabId,
    pub error: String,
}

/// 各命令的应答数据。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Pong {
        ready: bool,
        state: InitState,
    },
    Detected {
        tab_id: TabId,
        keywords: Vec<String>,
    },
    Saved {
        negative: bool,
        count: usize,
    },
    Keywords {
        positive: Vec<String>,
        negative: Vec<String>,
    },
    Exported {
        format: ExportFormat,
        file_name: String,
        mime: String,
        keyword_count: usize,
        content: String,
    },
    Added {
        added: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
        keyword: String,
        negative: bool,
    },
    Removed {
        removed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
        keyword: String,
        negative: bool,
    },
    /// `suppressed` 为真表示设置中关闭了高亮，本次未投递。
    Highlight {
        delivered: Vec<TabId>,
        failed: Vec<FailedDelivery>,
        #[serde(default)]
        suppressed: bool,
    },
    Settings {
        settings: StoredSettings,
    },
    Cleared {
        positive: bool,
        negative: bool,
    },
}

/// 响应：`success` + 应答数据 + 可选错误。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Reply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(request_id: Uuid, data: Reply) -> Self {
        Self {
            request_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// 失败响应（可附带应答数据，例如 `added:false` + `reason`）。
    pub fn fail(request_id: Uuid, kind: ErrorKind, message: impl Into<String>, data: Option<Reply>) -> Self {
        Self {
            request_id,
            success: false,
            data,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// 状态变更事件（单向通知界面与页面）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    KeywordsUpdated {
        positive: Vec<String>,
        negative: Vec<String>,
    },
    Highlight {
        keywords: Vec<String>,
        on: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
}

/// 协调器对页面代理的调用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentCall {
    Scrape,
    /// `color` 为空时页面使用自身默认样式。
    ApplyHighlight {
        keywords: Vec<String>,
        on: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
}

/// 页面代理对调用的应答。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AgentReply {
    Scraped { keywords: Vec<String> },
    Highlighted { applied: usize },
    Failed { message: String },
}

/// 客户端（界面/页面）→ 协调器的帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Request { request: Request },
    /// 页面代理上线：此后该连接承载对该标签页的调用。
    Register { tab_id: TabId, url: String },
    /// 订阅状态变更事件。
    Subscribe,
    AgentReply { call_id: Uuid, reply: AgentReply },
}

/// 协调器 → 客户端的帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Response { response: Response },
    Event { event: Event },
    AgentCall { call_id: Uuid, call: AgentCall },
}

/// 单帧（单行）字节数上限，不含换行符。
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// 按行读取的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameLine {
    Line(String),
    /// 超过上限的行：已读到该行末尾并丢弃。
    TooLong,
    Eof,
}

/// 读取一行，最多缓存 `limit` 个字节。
///
/// 异常处理：
/// - 读取失败返回 `std::io::Error`；非 UTF-8 内容返回 `InvalidData`
pub async fn read_frame_line<R>(reader: &mut R, limit: usize) -> std::io::Result<FrameLine>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(cap).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(FrameLine::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > limit {
        skip_line(reader).await?;
        return Ok(FrameLine::TooLong);
    }
    String::from_utf8(buf)
        .map(FrameLine::Line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// 丢弃到下一个换行符（含）或连接结束。
async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                (0, true)
            } else {
                match available.iter().position(|b| *b == b'\n') {
                    Some(i) => (i + 1, true),
                    None => (available.len(), false),
                }
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

/// 将帧序列化为单行 JSON 并写出。
///
/// 异常处理：
/// - 序列化失败或写入失败会返回 `std::io::Error`
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
