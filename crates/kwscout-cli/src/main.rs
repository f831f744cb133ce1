//! 关键词采集命令行界面（kwscout）。
//!
//! 职责：
//! - 作为界面向协调器发送命令：列表查看、添加/移除、保存、导出、检测、高亮、设置
//! - 在本地完成列表变换（大小写、正则过滤、垃圾词清理、去重、匹配类型），再整体保存
//! - 从文件合并导入关键词
//! - 订阅状态变更（watch），或以文本文件模拟一个页面代理（page）
//!
//! 连接约定：
//! - 每条命令独立建立短连接；协调器暂不可达时按指数退避重试，耗尽后给出提示并以非零码退出
//! - 多步操作（读后写、检测后添加等）先做一次健康检查，协调器不可达时不会执行任何一步
//!
//! 作者：KwScout 项目组
//! 创建时间：2026-10-17
//! 修改时间：2026-10-17

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use kwscout_core::client::{watch_events, TcpTransport};
use kwscout_core::export::ExportFormat;
use kwscout_core::ipc::{Command, ErrorKind, Reply, Response, TabId};
use kwscout_core::keyword::{MatchType, ParsedKeyword};
use kwscout_core::page::{PageSession, TextSourcePage};
use kwscout_core::paths;
use kwscout_core::retry::{ClientError, Messenger, RetryPolicy, Transport};
use kwscout_core::state::{KeywordMetadata, KeywordSource, StoredSettings};
use kwscout_core::transform::{self, CaseMode, FilterMode};
use tracing::{debug, info};

/// 命令行参数。
///
/// 说明：
/// - `--addr` 协调器地址（默认读取 `KWSCOUT_IPC_ADDR`，否则 `127.0.0.1:47615`）
/// - `--json` 以原始 JSON 输出响应，便于脚本处理
#[derive(Debug, Parser)]
#[command(name = "kwscout", version)]
struct Cli {
    #[arg(long, global = true)]
    addr: Option<String>,

    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// 最大尝试次数（含首次）。
    #[arg(long, global = true, default_value_t = 3)]
    attempts: u32,

    #[command(subcommand)]
    command: Commands,
}

/// 支持的子命令。
#[derive(Debug, Subcommand)]
enum Commands {
    /// 健康检查。
    Ping,
    /// 查看正向与否定关键词列表。
    List,
    /// 添加关键词（以 `-` 开头或带 `--negative` 时加入否定列表）。
    Add {
        #[arg(allow_hyphen_values = true)]
        keyword: String,
        #[arg(long, default_value_t = false)]
        negative: bool,
        #[arg(long, default_value = "manual")]
        source: KeywordSource,
        /// 按该匹配类型包裹；未给出时未带包裹的输入使用设置中的默认匹配类型。
        #[arg(long)]
        match_type: Option<MatchType>,
    },
    /// 移除关键词。
    Remove {
        #[arg(allow_hyphen_values = true)]
        keyword: String,
        #[arg(long, default_value_t = false)]
        negative: bool,
    },
    /// 用文件内容（每行一个）整体覆盖列表。
    Save {
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        negative: bool,
    },
    /// 从文件（每行一个）合并导入，跳过规范形式已存在的关键词。
    Import {
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        negative: bool,
    },
    /// 导出列表；未指定 `--out` 时输出到标准输出。
    Export {
        #[arg(long, default_value = "csv")]
        format: ExportFormat,
        #[arg(long, default_value_t = false)]
        negative: bool,
        /// 输出文件或目录（目录时使用建议文件名）。
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// 委托指定标签页检测候选关键词。
    Detect {
        #[arg(long)]
        tab: Option<TabId>,
        /// 将检测结果逐个加入正向列表。
        #[arg(long, default_value_t = false)]
        add: bool,
    },
    /// 广播高亮；未给出关键词时使用当前正向列表。
    Highlight {
        keywords: Vec<String>,
        #[arg(long, default_value_t = false)]
        off: bool,
    },
    /// 在本地变换列表后整体保存；未给出 `--case` 时使用设置中的大小写模式。
    Transform {
        #[arg(long)]
        case: Option<CaseMode>,
        /// 只保留匹配该正则的关键词。
        #[arg(long)]
        keep: Option<String>,
        /// 删除匹配该正则的关键词。
        #[arg(long)]
        drop: Option<String>,
        /// 删除垃圾关键词（纯数字、过短或过长、含特殊字符、测试词、停用词）。
        #[arg(long, default_value_t = false)]
        junk: bool,
        #[arg(long)]
        match_type: Option<MatchType>,
        #[arg(long, default_value_t = false)]
        dedupe: bool,
        #[arg(long, default_value_t = false)]
        negative: bool,
        /// 只打印结果，不保存。
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// 查看或修改设置。
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// 清空列表（默认两个列表都清空）。
    Clear {
        #[arg(long, default_value_t = false, conflicts_with = "positive")]
        negative: bool,
        #[arg(long, default_value_t = false)]
        positive: bool,
    },
    /// 持续打印状态变更事件。
    Watch,
    /// 以文本文件作为页面内容，登记为一个页面代理。
    Page {
        #[arg(long)]
        tab_id: TabId,
        #[arg(long, default_value = "https://ads.google.com/")]
        url: String,
        #[arg(long)]
        source: PathBuf,
        /// 登记后以页面身份添加的选中文本（可重复）。
        #[arg(long = "select")]
        selections: Vec<String>,
        #[arg(long, default_value = "broad")]
        match_type: MatchType,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    Show,
    Set {
        #[arg(long)]
        match_type: Option<MatchType>,
        #[arg(long)]
        case_mode: Option<CaseMode>,
        #[arg(long)]
        highlight: Option<bool>,
        #[arg(long)]
        color: Option<String>,
        /// 目标站点（可重复）；给出时整体替换。
        #[arg(long = "site")]
        sites: Vec<String>,
        #[arg(long)]
        api_model: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
    },
}

/// 程序入口：解析参数、执行子命令并映射退出码。
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<ClientError>() {
                Some(ClientError::Communication { attempts, .. }) => {
                    eprintln!("无法联系协调器（已尝试 {attempts} 次），请确认 kwscout-coordinator 正在运行");
                }
                _ => eprintln!("错误: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let addr = cli.addr.clone().unwrap_or_else(paths::default_ipc_addr);
    let policy = RetryPolicy {
        max_attempts: cli.attempts.max(1),
        jitter: true,
        ..RetryPolicy::default()
    };
    let ui = Ui {
        messenger: Messenger::new(TcpTransport::new(addr.clone()), policy.clone()),
        json: cli.json,
    };

    match cli.command {
        Commands::Ping => ui.send(Command::Ping).await,
        Commands::List => ui.send(Command::LoadKeywords).await,
        Commands::Add {
            keyword,
            negative,
            source,
            match_type,
        } => {
            ui.send(Command::AddKeyword {
                keyword,
                metadata: Some(KeywordMetadata {
                    source: Some(source),
                    ..KeywordMetadata::default()
                }),
                is_negative: negative.then_some(true),
                match_type,
            })
            .await
        }
        Commands::Remove { keyword, negative } => {
            ui.send(Command::RemoveKeyword {
                keyword,
                is_negative: negative.then_some(true),
            })
            .await
        }
        Commands::Save { file, negative } => {
            let keywords = read_lines(&file)?;
            ui.send(Command::SaveKeywords { keywords, negative }).await
        }
        Commands::Import { file, negative } => import(&ui, &read_lines(&file)?, negative).await,
        Commands::Export {
            format,
            negative,
            out,
        } => export(&ui, format, negative, out).await,
        Commands::Detect { tab, add } => detect(&ui, tab, add).await,
        Commands::Highlight { keywords, off } => highlight(&ui, keywords, !off).await,
        Commands::Transform {
            case,
            keep,
            drop,
            junk,
            match_type,
            dedupe,
            negative,
            dry_run,
        } => {
            let steps = TransformSteps {
                case,
                keep,
                drop,
                junk,
                match_type,
                dedupe,
            };
            transform_list(&ui, steps, negative, dry_run).await
        }
        Commands::Settings { action } => settings(&ui, action).await,
        Commands::Clear { negative, positive } => {
            let negative = match (negative, positive) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            ui.send(Command::ClearKeywords { negative }).await
        }
        Commands::Watch => watch(&addr, cli.json).await,
        Commands::Page {
            tab_id,
            url,
            source,
            selections,
            match_type,
        } => {
            let session = PageSession::connect(&addr, tab_id, &url, policy)
                .await
                .with_context(|| format!("连接协调器失败: {addr}"))?;
            println!("标签页 {tab_id} 已登记，按 Ctrl-C 退出");
            let agent = Arc::new(TextSourcePage::new(source));
            let commands = session.commands();
            let serving = tokio::spawn(session.run(agent.clone()));
            for selection in selections {
                let response = commands.add_selection(&selection, match_type, agent.as_ref()).await?;
                ui.report(&response);
            }
            serving.await.context("页面代理任务异常退出")??;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// 命令发送与输出。
struct Ui<T> {
    messenger: Messenger<T>,
    json: bool,
}

impl<T: Transport> Ui<T> {
    /// 多步操作开始前的健康检查。
    async fn begin(&self) -> Result<()> {
        let pong = self.messenger.ping().await?;
        debug!("健康检查通过: {:?}", pong.data);
        Ok(())
    }

    /// 发送命令、打印结果并返回退出码。
    async fn send(&self, command: Command) -> Result<ExitCode> {
        let response = self.messenger.call(command).await?;
        Ok(self.report(&response))
    }

    /// 发送命令并要求成功，返回应答数据。
    async fn expect(&self, command: Command) -> Result<Reply> {
        let response = self.messenger.call(command).await?;
        into_reply(response)
    }

    fn report(&self, response: &Response) -> ExitCode {
        if self.json {
            match serde_json::to_string_pretty(response) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("序列化响应失败: {e}"),
            }
        } else {
            if let Some(reply) = &response.data {
                print_reply(reply);
            }
            if let Some(error) = &response.error {
                if !non_fatal(response) {
                    eprintln!("失败（{:?}）: {}", error.kind, error.message);
                }
            }
        }
        if response.success || non_fatal(response) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// “已存在/不存在”不是故障：命令本身已被正确处理。
fn non_fatal(response: &Response) -> bool {
    matches!(response.error_kind(), Some(ErrorKind::Duplicate | ErrorKind::NotFound))
}

fn into_reply(response: Response) -> Result<Reply> {
    if !response.success {
        let message = response
            .error
            .map(|e| format!("{:?}: {}", e.kind, e.message))
            .unwrap_or_else(|| "未知错误".to_string());
        bail!("协调器返回失败: {message}");
    }
    response.data.ok_or_else(|| anyhow!("协调器响应缺少数据"))
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Pong { ready, state } => println!("pong（就绪: {ready}，状态: {state:?}）"),
        Reply::Detected { tab_id, keywords } => {
            println!("标签页 {tab_id} 检测到 {} 个关键词:", keywords.len());
            for kw in keywords {
                println!("  {kw}");
            }
        }
        Reply::Saved { negative, count } => println!("已保存 {count} 个{}关键词", list_name(*negative)),
        Reply::Keywords { positive, negative } => {
            println!("正向关键词（{}）:", positive.len());
            for kw in positive {
                println!("  {kw}");
            }
            println!("否定关键词（{}）:", negative.len());
            for kw in negative {
                println!("  -{kw}");
            }
        }
        Reply::Exported { content, .. } => println!("{content}"),
        Reply::Added {
            added: true,
            keyword,
            negative,
            ..
        } => println!("已添加{}关键词: {keyword}", list_name(*negative)),
        Reply::Added { keyword, negative, .. } => {
            println!("{}关键词已存在，未添加: {keyword}", list_name(*negative))
        }
        Reply::Removed {
            removed: true,
            keyword,
            negative,
            ..
        } => println!("已移除{}关键词: {keyword}", list_name(*negative)),
        Reply::Removed { keyword, negative, .. } => {
            println!("{}关键词不存在，未移除: {keyword}", list_name(*negative))
        }
        Reply::Highlight { suppressed: true, .. } => println!("高亮已在设置中关闭，未发送"),
        Reply::Highlight { delivered, failed, .. } => {
            println!("高亮已送达 {} 个页面", delivered.len());
            for f in failed {
                println!("  标签页 {} 未送达: {}", f.tab_id, f.error);
            }
        }
        Reply::Settings { settings } => match serde_json::to_string_pretty(&settings.redacted()) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("序列化设置失败: {e}"),
        },
        Reply::Cleared { positive, negative } => {
            println!("已清空（正向: {positive}，否定: {negative}）")
        }
    }
}

fn list_name(negative: bool) -> &'static str {
    if negative {
        "否定"
    } else {
        "正向"
    }
}

/// 读取文件中的非空行。
fn read_lines(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("读取文件失败: {}", path.display()))?;
    Ok(transform::trim_empty(&raw.lines().map(str::to_string).collect::<Vec<_>>()))
}

/// 合并导入：读取当前列表，追加新项后整体保存。
///
/// 说明：
/// - 否定列表导入时去掉各行的 `-` 前缀
/// - 没有新项时不写回
async fn import<T: Transport>(ui: &Ui<T>, incoming: &[String], negative: bool) -> Result<ExitCode> {
    ui.begin().await?;
    let Reply::Keywords {
        positive,
        negative: negatives,
    } = ui.expect(Command::LoadKeywords).await?
    else {
        bail!("协调器返回了意外的应答");
    };
    let existing = if negative { negatives } else { positive };
    let incoming: Vec<String> = if negative {
        incoming.iter().map(|kw| ParsedKeyword::body(kw).to_string()).collect()
    } else {
        incoming.to_vec()
    };
    let (keywords, added) = transform::merge_import(&existing, &incoming);
    if added == 0 {
        println!("没有新的{}关键词需要导入", list_name(negative));
        return Ok(ExitCode::SUCCESS);
    }
    ui.expect(Command::SaveKeywords { keywords, negative }).await?;
    println!("已导入 {added} 个新{}关键词", list_name(negative));
    Ok(ExitCode::SUCCESS)
}

async fn export<T: Transport>(ui: &Ui<T>, format: ExportFormat, negative: bool, out: Option<PathBuf>) -> Result<ExitCode> {
    let Some(out) = out else {
        return ui.send(Command::ExportKeywords { format, negative }).await;
    };
    ui.begin().await?;
    let reply = ui.expect(Command::ExportKeywords { format, negative }).await?;
    let Reply::Exported {
        file_name,
        keyword_count,
        content,
        ..
    } = reply
    else {
        bail!("协调器返回了意外的应答");
    };
    let target = if out.is_dir() { out.join(&file_name) } else { out };
    std::fs::write(&target, content).with_context(|| format!("写入导出文件失败: {}", target.display()))?;
    println!("已导出 {keyword_count} 个关键词到 {}", target.display());
    Ok(ExitCode::SUCCESS)
}

async fn detect<T: Transport>(ui: &Ui<T>, tab: Option<TabId>, add: bool) -> Result<ExitCode> {
    if !add {
        return ui.send(Command::DetectKeywords { tab_id: tab }).await;
    }
    ui.begin().await?;
    let reply = ui.expect(Command::DetectKeywords { tab_id: tab }).await?;
    let Reply::Detected { tab_id, keywords } = reply else {
        bail!("协调器返回了意外的应答");
    };
    let mut added = 0;
    for keyword in keywords {
        let response = ui
            .messenger
            .call(Command::AddKeyword {
                keyword: keyword.clone(),
                metadata: Some(KeywordMetadata {
                    source: Some(KeywordSource::Page),
                    context: [("tab_id".to_string(), serde_json::json!(tab_id))].into_iter().collect(),
                }),
                is_negative: Some(false),
                match_type: None,
            })
            .await?;
        if response.success {
            added += 1;
        } else if !non_fatal(&response) {
            ui.report(&response);
            return Ok(ExitCode::FAILURE);
        } else {
            debug!("跳过已存在的关键词: {keyword}");
        }
    }
    println!("从标签页 {tab_id} 加入 {added} 个新关键词");
    Ok(ExitCode::SUCCESS)
}

async fn highlight<T: Transport>(ui: &Ui<T>, keywords: Vec<String>, on: bool) -> Result<ExitCode> {
    let keywords = if keywords.is_empty() {
        ui.begin().await?;
        match ui.expect(Command::LoadKeywords).await? {
            Reply::Keywords { positive, .. } => positive,
            other => bail!("协调器返回了意外的应答: {other:?}"),
        }
    } else {
        keywords
    };
    ui.send(Command::BroadcastHighlight { keywords, on }).await
}

/// 本地变换步骤，按字段顺序依次应用。
struct TransformSteps {
    case: Option<CaseMode>,
    keep: Option<String>,
    drop: Option<String>,
    junk: bool,
    match_type: Option<MatchType>,
    dedupe: bool,
}

impl TransformSteps {
    fn apply(&self, list: &[String]) -> Result<Vec<String>> {
        let mut out = transform::trim_empty(list);
        if let Some(mode) = self.case {
            out = transform::fold_case(&out, mode);
        }
        if let Some(pattern) = &self.keep {
            out = transform::filter_regex(&out, pattern, FilterMode::Keep)?;
        }
        if let Some(pattern) = &self.drop {
            out = transform::filter_regex(&out, pattern, FilterMode::Drop)?;
        }
        if self.junk {
            out = transform::remove_junk(&out)?;
        }
        if let Some(match_type) = self.match_type {
            out = transform::convert_match_type(&out, match_type);
        }
        if self.dedupe {
            out = transform::dedupe(&out);
        }
        Ok(out)
    }
}

/// 读取列表与设置、在本地变换后整体保存。
///
/// 说明：
/// - 未指定大小写模式时使用设置中的 `case_mode`
async fn transform_list<T: Transport>(
    ui: &Ui<T>,
    steps: TransformSteps,
    negative: bool,
    dry_run: bool,
) -> Result<ExitCode> {
    let mut responses = ui
        .messenger
        .exchange(vec![Command::LoadKeywords, Command::LoadSettings])
        .await?
        .into_iter();
    let lists = responses.next().ok_or_else(|| anyhow!("协调器未返回列表"))?;
    let Reply::Keywords {
        positive,
        negative: negatives,
    } = into_reply(lists)?
    else {
        bail!("协调器返回了意外的应答");
    };
    let settings = responses.next().ok_or_else(|| anyhow!("协调器未返回设置"))?;
    let Reply::Settings { settings } = into_reply(settings)? else {
        bail!("协调器返回了意外的应答");
    };
    let steps = TransformSteps {
        case: steps.case.or(settings.case_mode),
        ..steps
    };
    let current = if negative { negatives } else { positive };
    let keywords = steps.apply(&current)?;
    info!("变换: {} -> {} 个关键词", current.len(), keywords.len());

    if dry_run {
        for kw in &keywords {
            println!("{kw}");
        }
        return Ok(ExitCode::SUCCESS);
    }
    ui.send(Command::SaveKeywords { keywords, negative }).await
}

async fn settings<T: Transport>(ui: &Ui<T>, action: SettingsAction) -> Result<ExitCode> {
    match action {
        SettingsAction::Show => ui.send(Command::LoadSettings).await,
        SettingsAction::Set {
            match_type,
            case_mode,
            highlight,
            color,
            sites,
            api_model,
            api_key,
        } => {
            ui.begin().await?;
            let Reply::Settings { settings } = ui.expect(Command::LoadSettings).await? else {
                bail!("协调器返回了意外的应答");
            };
            let mut next: StoredSettings = settings;
            if let Some(v) = match_type {
                next.default_match_type = v;
            }
            if case_mode.is_some() {
                next.case_mode = case_mode;
            }
            if let Some(v) = highlight {
                next.highlight_enabled = v;
            }
            if let Some(v) = color {
                next.highlight_color = v;
            }
            if !sites.is_empty() {
                next.target_sites = sites;
            }
            if api_model.is_some() {
                next.api_model = api_model;
            }
            if api_key.is_some() {
                next.api_key = api_key;
            }
            ui.send(Command::SaveSettings { settings: next }).await
        }
    }
}

async fn watch(addr: &str, json: bool) -> Result<ExitCode> {
    println!("正在订阅 {addr} 的状态变更，按 Ctrl-C 退出");
    watch_events(addr, |event| {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("序列化事件失败: {e}"),
            }
        } else {
            println!("{event:?}");
        }
        true
    })
    .await?;
    Ok(ExitCode::SUCCESS)
}
