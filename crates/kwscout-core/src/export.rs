//! 关键词导出（CSV / 纯文本 / JSON）。
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// 导出格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Csv,
    Text,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Text => "txt",
            ExportFormat::Json => "json",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Text => "text/plain",
            ExportFormat::Json => "application/json",
        }
    }

    /// 建议的文件名：`keywords_<YYYY-MM-DD>.<ext>`。
    pub fn file_name(self, now: OffsetDateTime) -> String {
        format!("keywords_{}.{}", now.date(), self.extension())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "text" | "txt" => Ok(ExportFormat::Text),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("未知导出格式: {other}")),
        }
    }
}

/// JSON 导出文档结构。
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonExport {
    pub exported_at: String,
    pub keyword_count: usize,
    pub keywords: Vec<String>,
}

fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// 按格式渲染导出内容。
///
/// 格式约定：
/// - CSV：首行 `Keyword`，每行一个带双引号的关键词，行间 `\n`，末尾无换行
/// - Text：按行拼接
/// - JSON：`{ exported_at, keyword_count, keywords }`（格式化输出）
///
/// 异常处理：
/// - 仅 JSON 序列化可能失败（实际不会发生），以 `serde_json::Error` 返回
pub fn render(
    keywords: &[String],
    format: ExportFormat,
    now: OffsetDateTime,
) -> Result<String, serde_json::Error> {
    match format {
        ExportFormat::Csv => {
            let mut lines = Vec::with_capacity(keywords.len() + 1);
            lines.push("Keyword".to_string());
            lines.extend(keywords.iter().map(|kw| csv_quote(kw)));
            Ok(lines.join("\n"))
        }
        ExportFormat::Text => Ok(keywords.join("\n")),
        ExportFormat::Json => {
            let doc = JsonExport {
                exported_at: now.format(&Rfc3339).unwrap_or_else(|_| now.to_string()),
                keyword_count: keywords.len(),
                keywords: keywords.to_vec(),
            };
            serde_json::to_string_pretty(&doc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample() -> Vec<String> {
        vec!["a".to_string(), "b,c".to_string()]
    }

    #[test]
    fn csv_quotes_every_row() {
        let out = render(&sample(), ExportFormat::Csv, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(out, "Keyword\n\"a\"\n\"b,c\"");
    }

    #[test]
    fn csv_escapes_inner_quotes() {
        let out = render(&["say \"hi\"".to_string()], ExportFormat::Csv, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(out, "Keyword\n\"say \"\"hi\"\"\"");
    }

    #[test]
    fn text_is_newline_joined() {
        let out = render(&sample(), ExportFormat::Text, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(out, "a\nb,c");
    }

    #[test]
    fn json_reports_count_and_timestamp() {
        let now = datetime!(2026-10-17 08:30:00 UTC);
        let out = render(&sample(), ExportFormat::Json, now).unwrap();
        let doc: JsonExport = serde_json::from_str(&out).unwrap();
        assert_eq!(doc.keyword_count, 2);
        assert_eq!(doc.keywords, sample());
        assert_eq!(doc.exported_at, "2026-10-17T08:30:00Z");
    }

    #[test]
    fn file_name_uses_date_and_extension() {
        let now = datetime!(2026-10-17 23:59:00 UTC);
        assert_eq!(ExportFormat::Json.file_name(now), "keywords_2026-10-17.json");
        assert_eq!("txt".parse::<ExportFormat>(), Ok(ExportFormat::Text));
    }
}
