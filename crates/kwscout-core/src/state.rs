//! 持久化记录模型（设置、关键词元数据）与存储键约定。
//!
//! 目的：
//! - 统一存储键名，避免散落在各模块中
//! - 定义 `settings` 与 `enhanced_<keyword>` 两类记录的结构
//!
//! 约定：
//! - 没有 schema 版本号，所有字段都通过 `#[serde(default)]` 视为可选
//! - 设置“后写覆盖先写”，不做合并
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::keyword::MatchType;
use crate::transform::CaseMode;

/// 设置记录键。
pub const SETTINGS_KEY: &str = "settings";
/// 正向关键词列表键。
pub const KEYWORDS_KEY: &str = "keywords";
/// 否定关键词列表键。
pub const NEGATIVE_KEYWORDS_KEY: &str = "negative_keywords";
/// 关键词元数据键前缀。
pub const META_KEY_PREFIX: &str = "enhanced_";
/// 初始化时用于验证存储可读写的校验键。
pub const VERIFY_KEY: &str = "__kwscout_verify__";

/// 默认目标站点（广告后台）。
pub const DEFAULT_TARGET_SITE: &str = "ads.google.com";

/// 根据列表类型选择存储键。
pub fn list_key(negative: bool) -> &'static str {
    if negative {
        NEGATIVE_KEYWORDS_KEY
    } else {
        KEYWORDS_KEY
    }
}

/// 关键词元数据的存储键：`enhanced_<keyword>`。
pub fn meta_key(clean: &str) -> String {
    format!("{META_KEY_PREFIX}{clean}")
}

/// 用户设置（显示偏好 + API 凭据）。
///
/// 字段说明：
/// - `default_match_type`：新关键词默认匹配类型
/// - `case_mode`：界面默认大小写转换（可为空）
/// - `highlight_enabled`：是否在页面中高亮关键词
/// - `highlight_color`：高亮颜色（CSS 颜色字符串）
/// - `target_sites`：页面代理所在站点（按 URL 包含关系匹配）
/// - `api_key` / `api_model`：外部文本生成服务凭据与模型名（仅保存，不在此处使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSettings {
    #[serde(default)]
    pub default_match_type: MatchType,
    #[serde(default)]
    pub case_mode: Option<CaseMode>,
    #[serde(default = "default_true")]
    pub highlight_enabled: bool,
    #[serde(default = "default_highlight_color")]
    pub highlight_color: String,
    #[serde(default = "default_target_sites")]
    pub target_sites: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_model: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_highlight_color() -> String {
    "#fff59d".to_string()
}

fn default_target_sites() -> Vec<String> {
    vec![DEFAULT_TARGET_SITE.to_string()]
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            default_match_type: MatchType::default(),
            case_mode: None,
            highlight_enabled: true,
            highlight_color: default_highlight_color(),
            target_sites: default_target_sites(),
            api_key: None,
            api_model: None,
        }
    }
}

impl StoredSettings {
    /// 判断页面 URL 是否属于目标站点。
    ///
    /// 说明：
    /// - `target_sites` 为空时视为匹配所有页面
    pub fn matches_site(&self, url: &str) -> bool {
        self.target_sites.is_empty()
            || self
                .target_sites
                .iter()
                .any(|site| !site.is_empty() && url.contains(site.as_str()))
    }

    /// 用于日志/展示的副本：隐藏 API 密钥。
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.api_key.is_some() {
            copy.api_key = Some("***".to_string());
        }
        copy
    }
}

/// 关键词来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordSource {
    /// 用户在界面中手动添加。
    #[default]
    Manual,
    /// 页面代理（双击等）发起。
    Page,
    /// 批量导入。
    Import,
}

impl std::str::FromStr for KeywordSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(KeywordSource::Manual),
            "page" => Ok(KeywordSource::Page),
            "import" => Ok(KeywordSource::Import),
            other => Err(format!("未知关键词来源: {other}")),
        }
    }
}

/// 关键词元数据（`enhanced_<keyword>`）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordMeta {
    #[serde(default)]
    pub source: KeywordSource,
    #[serde(default)]
    pub match_type: MatchType,
    #[serde(default)]
    pub negative: bool,
    #[serde(default)]
    pub added_at_unix: Option<i64>,
    /// 页面上下文（例如所在表格列、广告组名），原样保存。
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl KeywordMeta {
    /// 创建一条新的元数据，`added_at_unix` 为当前 UTC 时间。
    pub fn new(source: KeywordSource, match_type: MatchType, negative: bool) -> Self {
        Self {
            source,
            match_type,
            negative,
            added_at_unix: Some(OffsetDateTime::now_utc().unix_timestamp()),
            context: BTreeMap::new(),
        }
    }
}

/// `addKeyword` 携带的可选元数据（来自页面或界面）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordMetadata {
    #[serde(default)]
    pub source: Option<KeywordSource>,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}
