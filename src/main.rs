//! `adw-supervisor` コマンド
//!
//! - `run`: ワークフローを実行し、レポートを表示する
//! - `validate`: ワークフロー定義を検証し、実行順序を表示する
//! - `alerts`: 過去の実行ディレクトリからアラートと結果を読み込んで表示する

use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::error;

use adw_supervisor::config::workflow::Workflow;
use adw_supervisor::engine::{ExecutionReport, ExecutionStatus, RunStore, StepStatus, WorkflowExecutor};
use adw_supervisor::logging::{self, LogFormat};
use adw_supervisor::safety::{ApprovalGate, AutoApprove, AutoDeny, TerminalApprovalGate};
use adw_supervisor::watchdog::AlertLog;

#[derive(Parser)]
#[command(name = "adw-supervisor", version, about = "監視付きエージェントワークフロー実行エンジン")]
struct Cli {
    /// 端末へのログ形式
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// ログファイルの出力先（日次ローテーション）
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// ワークフローを実行する
    Run {
        /// ワークフロー定義ファイル（TOML）
        workflow: PathBuf,

        /// 変数を上書きする（KEY=VALUE、VALUE は JSON として解釈できればその値）
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// 実行記録の保存先
        #[arg(long, default_value = ".adw/runs")]
        run_dir: PathBuf,

        /// エージェントの作業ディレクトリ
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// 実行ID（未指定なら UUID）
        #[arg(long)]
        run_id: Option<String>,

        /// 安全チェックの一時停止をすべて自動承認する
        #[arg(long)]
        auto_approve: bool,

        /// 並列度（ワークフロー定義の max_parallel を上書き）
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// ワークフロー定義を検証する
    Validate {
        /// ワークフロー定義ファイル（TOML）
        workflow: PathBuf,
    },
    /// 実行ディレクトリのアラートと結果を表示する
    Alerts {
        /// 実行ディレクトリ（`<run-dir>/<run-id>`）
        run: PathBuf,
    },
}

fn parse_var(input: &str) -> Result<(String, Value), String> {
    let (key, raw) = input
        .split_once('=')
        .ok_or_else(|| format!("KEY=VALUE 形式で指定してください: {input}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("変数名が空です: {input}"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = logging::init(cli.log_format, cli.log_dir.as_deref());

    let outcome = match cli.command {
        Command::Run {
            workflow,
            vars,
            run_dir,
            workdir,
            run_id,
            auto_approve,
            parallel,
        } => {
            cmd_run(RunArgs {
                workflow,
                vars,
                run_dir,
                workdir,
                run_id,
                auto_approve,
                parallel,
            })
            .await
        }
        Command::Validate { workflow } => cmd_validate(&workflow),
        Command::Alerts { run } => cmd_alerts(&run).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "コマンドが失敗しました");
            eprintln!("エラー: {e}");
            ExitCode::FAILURE
        }
    }
}

struct RunArgs {
    workflow: PathBuf,
    vars: Vec<(String, Value)>,
    run_dir: PathBuf,
    workdir: Option<PathBuf>,
    run_id: Option<String>,
    auto_approve: bool,
    parallel: Option<usize>,
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode, Box<dyn Error>> {
    let workflow = Workflow::from_file(&args.workflow)?;

    let gate: Arc<dyn ApprovalGate> = if args.auto_approve {
        Arc::new(AutoApprove)
    } else if std::io::stdin().is_terminal() {
        Arc::new(TerminalApprovalGate::new())
    } else {
        Arc::new(AutoDeny)
    };

    let mut executor = WorkflowExecutor::new(workflow)
        .with_approval_gate(gate)
        .with_run_dir(&args.run_dir);
    for (name, value) in args.vars {
        executor = executor.with_variable(name, value);
    }
    if let Some(workdir) = args.workdir {
        executor = executor.with_workdir(workdir);
    }
    if let Some(run_id) = args.run_id {
        executor = executor.with_run_id(run_id);
    }
    if let Some(parallel) = args.parallel {
        executor = executor.with_max_parallel(parallel);
    }

    let report = executor.execute().await?;
    print_report(&report, &args.run_dir);

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &ExecutionReport, run_dir: &Path) {
    let status = match report.status {
        ExecutionStatus::Success => "成功".to_string(),
        ExecutionStatus::PartialSuccess { completed, total } => format!("部分成功 ({completed}/{total})"),
        ExecutionStatus::Failed => "失敗".to_string(),
    };
    println!("ワークフロー: {} [{}]", report.workflow_name, report.run_id);
    println!(
        "ステータス: {status}（完了 {}/{}、{:.1}秒）",
        report.completed_steps(),
        report.steps.len(),
        report.total_duration().as_secs_f64()
    );
    println!(
        "ステップ: 成功 {} / 失敗 {} / スキップ {} / 全 {}",
        report.stats.succeeded, report.stats.failed, report.stats.skipped, report.stats.total
    );
    for step in &report.steps {
        let mark = match step.status {
            StepStatus::Success => "ok".to_string(),
            StepStatus::Retried { attempts } => format!("ok (retry {attempts})"),
            StepStatus::Failed => "NG".to_string(),
        };
        println!("  {:<20} {:<14} {:>7}ms", step.step_id, mark, step.duration_ms);
        if let Some(error) = &step.error {
            println!("    {error}");
        }
    }
    for skipped in &report.skipped {
        println!("  {:<20} skip           {}", skipped.step_id, skipped.reason);
    }
    for alert in &report.alerts {
        println!("  [alert] {} {}: {}", alert.step_id, alert.unit, alert.message);
    }
    println!("推定トークン数: {}", report.total_tokens_used);
    println!("実行記録: {}", run_dir.join(&report.run_id).display());
}

fn cmd_validate(path: &Path) -> Result<ExitCode, Box<dyn Error>> {
    let workflow = Workflow::from_file(path)?;
    println!("ワークフロー '{}' は有効です（{} ステップ）", workflow.name(), workflow.steps().len());
    for (index, wave) in workflow.graph().waves().iter().enumerate() {
        println!("  wave {}: {}", index + 1, wave.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_alerts(run: &Path) -> Result<ExitCode, Box<dyn Error>> {
    let alerts = AlertLog::in_dir(run).load().await?;
    let results = RunStore::open(run).load_results().await?;

    if alerts.is_empty() {
        println!("アラートはありません");
    }
    for alert in &alerts {
        println!(
            "{} {:<16} {:?} {:.1}/{:.1}{} pid={} {}",
            alert.timestamp.to_rfc3339(),
            alert.step_id,
            alert.kind,
            alert.value,
            alert.limit,
            alert.unit,
            alert.pid,
            alert.message
        );
    }

    println!("記録済みの結果: {} 件", results.len());
    for result in &results {
        let state = if result.is_success() { "ok" } else { "NG" };
        println!("  {:<20} {state}", result.step_id);
    }
    Ok(ExitCode::SUCCESS)
}
