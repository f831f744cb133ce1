//! 关键词模型：匹配类型、规范化与去重集合。
//!
//! 约定：
//! - 广泛匹配（Broad）为裸文本：`shoes`
//! - 词组匹配（Phrase）以双引号包裹：`"shoes"`
//! - 完全匹配（Exact）以方括号包裹：`[shoes]`
//! - 以 `-` 开头表示否定关键词（negative），否定关键词单独成集
//!
//! 集合内比较一律按“规范形式”（去掉匹配类型包裹后的文本）进行，大小写敏感。
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use serde::{Deserialize, Serialize};

/// 关键词匹配类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// 广泛匹配（不加包裹）。
    #[default]
    Broad,
    /// 词组匹配（`"kw"`）。
    Phrase,
    /// 完全匹配（`[kw]`）。
    Exact,
}

impl MatchType {
    /// 以关键词文本包裹规范形式。
    pub fn wrap(self, clean: &str) -> String {
        match self {
            MatchType::Broad => clean.to_string(),
            MatchType::Phrase => format!("\"{clean}\""),
            MatchType::Exact => format!("[{clean}]"),
        }
    }
}

impl std::str::FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broad" => Ok(MatchType::Broad),
            "phrase" => Ok(MatchType::Phrase),
            "exact" => Ok(MatchType::Exact),
            other => Err(format!("未知匹配类型: {other}")),
        }
    }
}

/// 去掉一层匹配类型包裹；无包裹时返回 `None`。
fn strip_wrapping(text: &str) -> Option<&str> {
    text.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .or_else(|| text.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')))
}

/// 根据包裹符号识别匹配类型（只看最外层）。
pub fn detect_match_type(raw: &str) -> MatchType {
    let text = raw.trim();
    let text = text.strip_prefix('-').map(str::trim_start).unwrap_or(text);
    if text.len() >= 2 && text.starts_with('[') && text.ends_with(']') {
        MatchType::Exact
    } else if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        MatchType::Phrase
    } else {
        MatchType::Broad
    }
}

/// 计算关键词的规范形式：去掉首尾空白与（可能多层的）匹配类型包裹。
///
/// 说明：
/// - 否定前缀 `-` 不在此处处理，见 [`ParsedKeyword::parse`]
/// - `[[foo]]`、`"[foo]"` 都会得到 `foo`
pub fn normalize(raw: &str) -> String {
    let mut text = raw.trim();
    loop {
        match strip_wrapping(text) {
            Some(inner) => text = inner.trim(),
            None => return text.to_string(),
        }
    }
}

/// 判断文本是否带否定前缀。
pub fn has_negative_prefix(raw: &str) -> bool {
    raw.trim_start().starts_with('-')
}

/// 解析后的关键词。
///
/// 字段说明：
/// - `clean`：规范形式（无否定前缀、无匹配类型包裹）
/// - `match_type`：识别出的匹配类型
/// - `negative`：是否带否定前缀
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyword {
    pub clean: String,
    pub match_type: MatchType,
    pub negative: bool,
}

impl ParsedKeyword {
    /// 解析原始文本。
    ///
    /// 示例：
    /// - `-[shoes]` → `{ clean: "shoes", match_type: Exact, negative: true }`
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };
        Self {
            clean: normalize(body),
            match_type: detect_match_type(body),
            negative,
        }
    }

    /// 去掉否定前缀后的文本（保留匹配类型包裹）。
    pub fn body(raw: &str) -> &str {
        let trimmed = raw.trim();
        trimmed
            .strip_prefix('-')
            .map(str::trim_start)
            .unwrap_or(trimmed)
    }
}

/// 将关键词转换为指定匹配类型（幂等：`[foo]` 再转 Exact 仍为 `[foo]`）。
///
/// 否定前缀会被保留。
pub fn apply_match_type(raw: &str, match_type: MatchType) -> String {
    let parsed = ParsedKeyword::parse(raw);
    let wrapped = match_type.wrap(&parsed.clean);
    if parsed.negative {
        format!("-{wrapped}")
    } else {
        wrapped
    }
}

/// 有序、去重的关键词集合。
///
/// 不变式：
/// - 不存在两个完全相同的原始字符串
/// - 通过 [`KeywordSet::insert`] 加入的关键词，其规范形式在集合内唯一
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordSet {
    items: Vec<String>,
}

impl KeywordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由列表构造；重复的原始字符串只保留首次出现。
    pub fn from_vec(items: Vec<String>) -> Self {
        let mut set = Self::new();
        for item in items {
            if !set.items.contains(&item) {
                set.items.push(item);
            }
        }
        set
    }

    /// 按规范形式判断是否存在。
    pub fn contains(&self, keyword: &str) -> bool {
        self.position(keyword).is_some()
    }

    fn position(&self, keyword: &str) -> Option<usize> {
        let clean = normalize(keyword);
        self.items.iter().position(|item| normalize(item) == clean)
    }

    /// 插入关键词；规范形式已存在时返回 `false` 且不修改集合。
    pub fn insert(&mut self, keyword: impl Into<String>) -> bool {
        let keyword = keyword.into();
        if self.contains(&keyword) {
            return false;
        }
        self.items.push(keyword);
        true
    }

    /// 移除规范形式相同的关键词，返回被移除的原始文本。
    pub fn remove(&mut self, keyword: &str) -> Option<String> {
        let idx = self.position(keyword)?;
        Some(self.items.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<String> {
        self.items
    }
}

/// 正/负两个独立集合。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordLists {
    #[serde(default)]
    pub positive: KeywordSet,
    #[serde(default)]
    pub negative: KeywordSet,
}

impl KeywordLists {
    /// 选择目标集合。
    pub fn target_mut(&mut self, negative: bool) -> &mut KeywordSet {
        if negative {
            &mut self.negative
        } else {
            &mut self.positive
        }
    }
}
