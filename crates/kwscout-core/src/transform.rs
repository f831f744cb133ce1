//! 界面侧的本地列表变换（大小写、正则过滤、垃圾词清理、去重、导入合并、匹配类型转换）。
//!
//! 这些函数只作用于内存中的列表，不涉及存储；调用方变换完成后再通过
//! `saveKeywords` 整体写回。
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use regex::{RegexBuilder, RegexSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keyword::{apply_match_type, normalize, KeywordSet, MatchType};

/// 变换错误。
///
/// 说明：
/// - 属于“永久性错误”：只阻止当前操作，不影响其他功能
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("正则表达式无效: {pattern}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// 大小写转换方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseMode {
    Lower,
    Upper,
    /// 每个单词首字母大写。
    Title,
}

impl std::str::FromStr for CaseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lower" => Ok(CaseMode::Lower),
            "upper" => Ok(CaseMode::Upper),
            "title" => Ok(CaseMode::Title),
            other => Err(format!("未知大小写模式: {other}")),
        }
    }
}

/// 正则过滤方式：保留匹配项或删除匹配项。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Keep,
    Drop,
}

/// 先整体转小写，再把每个单词的首字符转大写；`_` 与字母数字同属单词字符。
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        let word_char = ch.is_alphanumeric() || ch == '_';
        if word_char && at_word_start {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        at_word_start = !word_char;
    }
    out
}

/// 对列表中每个关键词做大小写转换。
pub fn fold_case(list: &[String], mode: CaseMode) -> Vec<String> {
    list.iter()
        .map(|kw| match mode {
            CaseMode::Lower => kw.to_lowercase(),
            CaseMode::Upper => kw.to_uppercase(),
            CaseMode::Title => title_case(kw),
        })
        .collect()
}

/// 按正则过滤列表（不区分大小写）。
///
/// 异常处理：
/// - `pattern` 不是合法正则时返回 [`TransformError::InvalidRegex`]，列表不变
pub fn filter_regex(
    list: &[String],
    pattern: &str,
    mode: FilterMode,
) -> Result<Vec<String>, TransformError> {
    let re = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| TransformError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
    Ok(list
        .iter()
        .filter(|kw| re.is_match(kw) == (mode == FilterMode::Keep))
        .cloned()
        .collect())
}

/// 垃圾关键词规则（作用于规范形式，任一命中即视为垃圾）：
/// - 纯数字
/// - 过短（1~2 个字符）或过长（100 个字符及以上）
/// - 含字母数字、`_`、空白、`-` 以外的字符
/// - 含测试类词语（test/example/sample/demo）
/// - 整体只是一个停用词（a/an/the/and/...）
const JUNK_PATTERNS: &[&str] = &[
    r"^\d+$",
    r"^.{1,2}$",
    r"^.{100,}$",
    r"[^\w\s\-]",
    r"(?i)\b(test|example|sample|demo)\b",
    r"(?i)^(a|an|the|and|or|but|in|on|at|to|for|of|with|by)$",
];

/// 删除垃圾关键词，保留其余项的原始文本与顺序。
///
/// 返回值：
/// - 清理后的列表；被删除的数量为输入与输出长度之差
///
/// 异常处理：
/// - 规则集编译失败时返回 [`TransformError::InvalidRegex`]
pub fn remove_junk(list: &[String]) -> Result<Vec<String>, TransformError> {
    let rules = RegexSet::new(JUNK_PATTERNS).map_err(|source| TransformError::InvalidRegex {
        pattern: JUNK_PATTERNS.join(" | "),
        source,
    })?;
    Ok(list
        .iter()
        .filter(|kw| !rules.is_match(&normalize(kw)))
        .cloned()
        .collect())
}

/// 把导入的关键词并入现有列表：修剪空白、跳过空行与规范形式已存在的项。
///
/// 返回值：
/// - `(合并后的列表, 新增数量)`；现有列表的顺序保持不变，新项追加在末尾
pub fn merge_import(existing: &[String], incoming: &[String]) -> (Vec<String>, usize) {
    let mut set = KeywordSet::from_vec(existing.to_vec());
    let before = set.len();
    for keyword in trim_empty(incoming) {
        set.insert(keyword);
    }
    let added = set.len() - before;
    (set.into_vec(), added)
}

/// 按规范形式去重，保留首次出现的原始文本。
pub fn dedupe(list: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    list.iter()
        .filter(|kw| seen.insert(normalize(kw)))
        .cloned()
        .collect()
}

/// 批量转换匹配类型。
pub fn convert_match_type(list: &[String], match_type: MatchType) -> Vec<String> {
    list.iter()
        .map(|kw| apply_match_type(kw, match_type))
        .collect()
}

/// 去掉空白项并修剪首尾空白。
pub fn trim_empty(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|kw| kw.trim())
        .filter(|kw| !kw.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fold_case_modes() {
        let input = list(&["Red SHOES", "blue-jeans"]);
        assert_eq!(fold_case(&input, CaseMode::Lower), list(&["red shoes", "blue-jeans"]));
        assert_eq!(fold_case(&input, CaseMode::Upper), list(&["RED SHOES", "BLUE-JEANS"]));
        assert_eq!(fold_case(&input, CaseMode::Title), list(&["Red Shoes", "Blue-Jeans"]));
    }

    #[test]
    fn title_case_keeps_underscore_inside_word() {
        let input = list(&["foo_bar baz", "hELLO wORLD", "[3d printer]"]);
        assert_eq!(
            fold_case(&input, CaseMode::Title),
            list(&["Foo_bar Baz", "Hello World", "[3d Printer]"])
        );
    }

    #[test]
    fn filter_regex_keep_and_drop() {
        let input = list(&["cheap shoes", "shoes", "free boots"]);
        assert_eq!(
            filter_regex(&input, "^(cheap|free)", FilterMode::Keep).unwrap(),
            list(&["cheap shoes", "free boots"])
        );
        assert_eq!(
            filter_regex(&input, "^(cheap|free)", FilterMode::Drop).unwrap(),
            list(&["shoes"])
        );
    }

    #[test]
    fn filter_regex_ignores_case() {
        let input = list(&["Shoes", "boots"]);
        assert_eq!(filter_regex(&input, "shoes", FilterMode::Drop).unwrap(), list(&["boots"]));
        assert_eq!(filter_regex(&input, "BOOTS", FilterMode::Keep).unwrap(), list(&["boots"]));
    }

    #[test]
    fn filter_regex_rejects_invalid_pattern() {
        let err = filter_regex(&list(&["a"]), "(unclosed", FilterMode::Keep).unwrap_err();
        assert!(matches!(err, TransformError::InvalidRegex { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn remove_junk_drops_each_rule() {
        let input = list(&[
            "running shoes",
            "12345",
            "ab",
            "[ab]",
            &"x".repeat(100),
            "shoes!",
            "test shoes",
            "Demo",
            "The",
            "trail-running shoes",
            "\"the best shoes\"",
            "contest shoes",
        ]);
        assert_eq!(
            remove_junk(&input).unwrap(),
            list(&[
                "running shoes",
                "trail-running shoes",
                "\"the best shoes\"",
                "contest shoes",
            ])
        );
    }

    #[test]
    fn merge_import_appends_only_new_clean_forms() {
        let existing = list(&["[shoes]", "boots"]);
        let incoming = list(&["  hats ", "", "shoes", "\"boots\"", "hats", "socks"]);
        let (merged, added) = merge_import(&existing, &incoming);
        assert_eq!(merged, list(&["[shoes]", "boots", "hats", "socks"]));
        assert_eq!(added, 2);
    }

    #[test]
    fn dedupe_uses_clean_form() {
        let input = list(&["shoes", "[shoes]", "boots", "\"shoes\"", "Boots"]);
        assert_eq!(dedupe(&input), list(&["shoes", "boots", "Boots"]));
    }

    #[test]
    fn dedupe_treats_negative_prefix_as_text() {
        let input = list(&["shoes", "-shoes", "[shoes]"]);
        assert_eq!(dedupe(&input), list(&["shoes", "-shoes"]));
    }

    #[test]
    fn convert_match_type_is_idempotent() {
        let once = convert_match_type(&list(&["a", "[b]", "\"c\""]), MatchType::Exact);
        assert_eq!(once, list(&["[a]", "[b]", "[c]"]));
        assert_eq!(convert_match_type(&once, MatchType::Exact), once);
    }

    #[test]
    fn trim_empty_drops_blank_lines() {
        assert_eq!(trim_empty(&list(&[" a ", "", "  ", "b"])), list(&["a", "b"]));
    }
}
