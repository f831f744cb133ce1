//! 关键词协调器（常驻进程）。
//!
//! 职责：
//! - 持有唯一的关键词存储并串行化写入
//! - 在本机 TCP 端口上接收界面命令与页面代理登记
//! - 向界面订阅者与目标站点页面推送状态变更
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kwscout_core::coordinator::Coordinator;
use kwscout_core::paths;
use kwscout_core::server::{serve, ServerConfig};
use kwscout_core::store::{JsonFileStore, KvStore, MemoryStore};
use tracing::{info, warn};

/// 运行参数。
///
/// 说明：
/// - `--listen`：监听地址（默认读取 `KWSCOUT_IPC_ADDR`，否则 `127.0.0.1:47615`）
/// - `--data-dir`：数据目录（默认读取 `KWSCOUT_HOME`，否则系统数据目录下的 `kwscout`）
/// - `--ephemeral`：仅使用内存存储（调试用，退出即丢失）
#[derive(Debug, Parser)]
#[command(name = "kwscout-coordinator", version)]
struct Args {
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    ephemeral: bool,

    /// 等待页面代理应答的秒数。
    #[arg(long, default_value_t = 10)]
    call_timeout_secs: u64,
}

/// 程序入口：初始化日志、构建存储与协调器并启动服务。
///
/// 异常处理：
/// - 数据目录不可用或端口绑定失败会返回错误
/// - 存储验证失败不会退出：协调器保持未就绪并在下一条命令时重试
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let store = open_store(&args)?;
    let coordinator = Arc::new(Coordinator::new(store));
    let state = coordinator.activate().await;
    info!("协调器初始状态: {state:?}");

    let listen = args.listen.clone().unwrap_or_else(paths::default_ipc_addr);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("绑定 IPC 端口失败: {listen}"))?;
    let addr = listener.local_addr().context("读取监听地址失败")?;
    info!("协调器监听: {addr}");

    let config = ServerConfig {
        call_timeout: Duration::from_secs(args.call_timeout_secs.max(1)),
    };
    tokio::select! {
        res = serve(listener, coordinator, config) => res,
        res = tokio::signal::ctrl_c() => {
            res.context("等待 Ctrl-C 信号失败")?;
            info!("收到退出信号，协调器停止");
            Ok(())
        }
    }
}

/// 按参数构建存储。
///
/// 返回值：
/// - `--ephemeral`：内存存储
/// - 否则：数据目录下的 `store.json`
fn open_store(args: &Args) -> Result<Arc<dyn KvStore>> {
    if args.ephemeral {
        warn!("使用内存存储，退出后数据将丢失");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => paths::data_dir()?,
    };
    paths::ensure_dir(&dir)?;
    let file = paths::store_file_in(&dir);
    info!("存储文件: {}", file.display());
    Ok(Arc::new(JsonFileStore::new(file)))
}
