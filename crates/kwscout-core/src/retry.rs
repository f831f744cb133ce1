//! 调用方重试与健康检查。
//!
//! 协调器可能在两次消息之间被宿主回收并重启；调用方通过以下策略屏蔽这种短暂不可用：
//! - 多步交互开始前先发送 `ping`
//! - 任意一次尝试遇到“接收方不存在”类错误时按指数退避重试（基准延迟逐次翻倍）
//! - 达到重试上限后以通信错误失败，由调用方给出用户可见提示
//! - 非连通性错误（例如消息格式错误）不重试，直接返回
//!
//! 幂等性：
//! - 重复发送同一个 `addKeyword` 不会重复插入（由协调器的集合成员检查保证）
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ipc::{Command, Request, Response};

/// 传输层错误。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 对端不存在或连接在应答前断开（可重试）。
    #[error("接收方不存在: {0}")]
    NoReceiver(String),
    /// 消息无法解析（不重试）。
    #[error("消息格式错误: {0}")]
    Malformed(String),
    /// 其他 IO 错误或超时（不重试）。
    #[error("传输失败: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::NoReceiver(_))
    }
}

/// 调用方可见的错误。
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("无法联系协调器（已尝试 {attempts} 次）: {last}")]
    Communication { attempts: u32, last: TransportError },
    #[error(transparent)]
    Transport(TransportError),
    #[error("响应与请求不匹配")]
    Mismatch,
}

/// 重试策略。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）。
    pub max_attempts: u32,
    /// 首次重试前的等待时间。
    pub base_delay: Duration,
    /// 单次等待上限。
    pub max_delay: Duration,
    /// 是否在等待时间上叠加 0~10% 的随机抖动。
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次（从 1 开始）失败后的等待时间（不含抖动）。
    pub fn base_delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// 第 `attempt` 次失败后的实际等待时间。
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_after(attempt);
        if !self.jitter {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=0.1);
        delay.mul_f64(1.0 + extra)
    }

    /// 一次调用在重试上的总等待上限。
    pub fn max_total_wait(&self) -> Duration {
        let total: Duration = (1..self.max_attempts.max(1))
            .map(|attempt| self.base_delay_after(attempt))
            .sum();
        if self.jitter {
            total.mul_f64(1.1)
        } else {
            total
        }
    }
}

/// 按策略重复执行一次连通性操作，直到成功、遇到不可重试错误或达到尝试上限。
///
/// 参数：
/// - `policy`：重试策略
/// - `label`：日志中的操作名
/// - `op`：每次尝试调用一次，返回该次尝试的结果
///
/// 异常处理：
/// - 重试耗尽：[`ClientError::Communication`]
/// - 不可重试的传输错误：[`ClientError::Transport`]
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{label} 失败（第 {attempt}/{} 次）: {e}，{delay:?} 后重试",
                    policy.max_attempts
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(ClientError::Communication {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => return Err(ClientError::Transport(e)),
        }
    }
}

/// 请求传输。
///
/// 实现方：
/// - TCP 短连接（见 [`crate::client::TcpTransport`]）
/// - 进程内直连（见 [`crate::client::LocalTransport`]）
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// 带重试与健康检查的命令发送器。
pub struct Messenger<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> Messenger<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// 单次交互：发送命令，遇到“接收方不存在”时按策略重试。
    ///
    /// 返回值：
    /// - 成功：协调器的响应（响应本身可能是失败响应，例如 `duplicate`）
    ///
    /// 异常处理：
    /// - 重试耗尽：[`ClientError::Communication`]
    /// - 不可重试的传输错误：[`ClientError::Transport`]
    pub async fn call(&self, command: Command) -> Result<Response, ClientError> {
        let request = Request::new(command);
        let label = format!("发送 {}", request.command.name());
        let response = with_retry(&self.policy, &label, || self.transport.send(request.clone())).await?;
        if response.request_id != request.request_id {
            return Err(ClientError::Mismatch);
        }
        Ok(response)
    }

    /// 健康检查。
    pub async fn ping(&self) -> Result<Response, ClientError> {
        self.call(Command::Ping).await
    }

    /// 多步交互：先 `ping`，再按顺序发送各命令；任一步通信失败即中止。
    pub async fn exchange(&self, commands: Vec<Command>) -> Result<Vec<Response>, ClientError> {
        let pong = self.ping().await?;
        debug!("健康检查通过: {:?}", pong.data);
        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            responses.push(self.call(command).await?);
        }
        Ok(responses)
    }
}
