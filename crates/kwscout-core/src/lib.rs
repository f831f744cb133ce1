//! KwScout 核心库：关键词采集的协调器、消息协议与存储。
//!
//! 功能：
//! - 关键词集合、匹配类型与列表变换（keyword / transform / export）
//! - 持久化记录与键值存储（state / store）
//! - 界面、页面代理与协调器之间的消息协议（ipc）
//! - 协调器状态机与命令处理、页面登记与广播（coordinator / pages）
//! - 调用方重试与健康检查、TCP 传输、服务端与页面会话（retry / client / server / page）
//! - 统一路径与地址约定（paths）
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

pub mod client;
pub mod coordinator;
pub mod export;
pub mod ipc;
pub mod keyword;
pub mod page;
pub mod pages;
pub mod paths;
pub mod retry;
pub mod server;
pub mod state;
pub mod store;
pub mod transform;
