//! 客户端传输：TCP 短连接、进程内直连与事件订阅。
//!
//! 说明：
//! - [`TcpTransport`] 每个请求建立一次新连接（短时消息传递），读到匹配的响应即关闭
//! - 连接被拒绝/重置、或对端在响应前关闭，一律归类为“接收方不存在”，交给重试层处理
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::ipc::{
    read_frame_line, write_frame, ClientFrame, Event, FrameLine, Request, Response, ServerFrame, MAX_FRAME_BYTES,
};
use crate::retry::{Transport, TransportError};

/// 默认等待响应的时间（与宿主消息通道的超时量级一致）。
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// 将 IO 错误归类为传输错误。
pub fn classify_io(e: &std::io::Error) -> TransportError {
    use std::io::ErrorKind::*;
    match e.kind() {
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
        | UnexpectedEof | AddrNotAvailable => TransportError::NoReceiver(e.to_string()),
        _ => TransportError::Io(e.to_string()),
    }
}

/// TCP 短连接传输。
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| classify_io(&e))?;
        let (reader, mut writer) = stream.into_split();
        let request_id = request.request_id;
        write_frame(&mut writer, &ClientFrame::Request { request })
            .await
            .map_err(|e| classify_io(&e))?;

        let mut reader = BufReader::new(reader);
        loop {
            let line = match read_frame_line(&mut reader, MAX_FRAME_BYTES).await {
                Ok(FrameLine::Line(line)) => line,
                Ok(FrameLine::TooLong) => {
                    return Err(TransportError::Malformed("响应超过单帧上限".to_string()))
                }
                Ok(FrameLine::Eof) => {
                    return Err(TransportError::NoReceiver("连接在响应前关闭".to_string()))
                }
                Err(e) => return Err(classify_io(&e)),
            };
            if line.trim().is_empty() {
                continue;
            }
            let frame: ServerFrame = serde_json::from_str(line.trim())
                .map_err(|e| TransportError::Malformed(e.to_string()))?;
            match frame {
                ServerFrame::Response { response } if response.request_id == request_id => {
                    return Ok(response)
                }
                other => debug!("忽略无关帧: {other:?}"),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| TransportError::Io(format!("等待响应超时（{:?}）", self.timeout)))?
    }
}

/// 进程内直连传输（同进程内的界面或测试使用）。
#[derive(Clone)]
pub struct LocalTransport {
    coordinator: Arc<Coordinator>,
}

impl LocalTransport {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        Ok(self.coordinator.handle(request).await)
    }
}

/// 订阅协调器事件，直到连接关闭或回调返回 `false`。
///
/// 异常处理：
/// - 连接失败返回传输错误；连接建立后的断开视为正常结束
pub async fn watch_events<F>(addr: &str, mut on_event: F) -> Result<(), TransportError>
where
    F: FnMut(Event) -> bool,
{
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| classify_io(&e))?;
    let (reader, mut writer) = stream.into_split();
    write_frame(&mut writer, &ClientFrame::Subscribe)
        .await
        .map_err(|e| classify_io(&e))?;
    let mut reader = BufReader::new(reader);
    loop {
        let line = match read_frame_line(&mut reader, MAX_FRAME_BYTES).await {
            Ok(FrameLine::Line(line)) => line,
            Ok(FrameLine::TooLong) => {
                debug!("忽略超长事件帧");
                continue;
            }
            Ok(FrameLine::Eof) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ServerFrame>(line.trim()) {
            Ok(ServerFrame::Event { event }) => {
                if !on_event(event) {
                    break;
                }
            }
            Ok(other) => debug!("忽略无关帧: {other:?}"),
            Err(e) => return Err(TransportError::Malformed(e.to_string())),
        }
    }
    Ok(())
}
