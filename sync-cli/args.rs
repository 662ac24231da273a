use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Report sheet sync（报表同步）
///
/// Tunnel to the analytics API, fetch learner and problem reports, write them to the spreadsheet.
/// 经 SSH 隧道抓取学员与题目报表，并写入表格。未指定子命令时执行 `run`。
#[derive(Debug, Parser)]
#[command(author, version, bin_name = "report-sheet-sync")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Config path / 配置路径（默认 $REPORT_SYNC_CONFIG_PATH 或 config/report-sync.yaml）。
    #[arg(long = "config", short = 'c', global = true)]
    pub config_path: Option<PathBuf>,

    /// Print results as JSON / 以 JSON 输出结果。
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Tunnel, fetch both reports and write the spreadsheet / 完整同步。
    Run(RunCommand),

    /// Validate config and secrets without any network access / 仅校验配置与密钥。
    Check,

    /// Tunnel and fetch, save CSV files locally, skip the write / 只抓取并保存 CSV。
    Fetch(FetchCommand),
}

#[derive(Debug, Args, Default)]
pub struct RunCommand {
    /// Fetch and build the batch request but do not write / 构建批量请求但不写入。
    #[arg(long = "dry-run", default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct FetchCommand {
    /// Output directory / 输出目录。
    #[arg(long = "out-dir", short = 'o', value_name = "DIR")]
    pub out_dir: PathBuf,
}
