//! 统一路径与地址约定。
//!
//! 目标：
//! - 将落盘路径集中管理，避免散落在各模块中
//! - 环境变量优先，便于测试与多实例并存
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// 覆盖数据目录的环境变量。
pub const HOME_ENV: &str = "KWSCOUT_HOME";

/// 覆盖协调器地址的环境变量。
pub const IPC_ADDR_ENV: &str = "KWSCOUT_IPC_ADDR";

/// 协调器默认监听地址。
pub const DEFAULT_IPC_ADDR: &str = "127.0.0.1:47615";

/// 存储文件名。
pub const STORE_FILE: &str = "store.json";

/// 获取本项目的数据根目录。
///
/// 返回值：
/// - 设置了 `KWSCOUT_HOME`：该目录
/// - 否则：系统数据目录下的 `kwscout`（例如 `~/.local/share/kwscout`）
///
/// 异常处理：
/// - 系统数据目录无法确定时返回错误
pub fn data_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let base = dirs::data_dir().ok_or_else(|| anyhow!("无法确定系统数据目录，请设置 {HOME_ENV}"))?;
    Ok(base.join("kwscout"))
}

/// 确保目录存在（不存在则递归创建）。
///
/// 异常处理：
/// - 目录创建失败（权限、路径非法等）会返回错误。
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("创建目录失败: {}", path.display()))?;
    Ok(())
}

/// 指定数据目录下的存储文件路径。
pub fn store_file_in(dir: &Path) -> PathBuf {
    dir.join(STORE_FILE)
}

/// 协调器地址：`KWSCOUT_IPC_ADDR` 优先，否则为默认地址。
pub fn default_ipc_addr() -> String {
    std::env::var(IPC_ADDR_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_IPC_ADDR.to_string())
}
