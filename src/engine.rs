//! ワークフロー実行エンジン
//!
//! # 責務
//!
//! - ワークフローの各ステップを条件判定・実行・安全チェック・記録の順に処理
//! - ステップ間のデータ受け渡し（`${steps.ID.output}` / 出力先 `variable`）
//! - リトライ（指数バックオフ）とタイムアウト（タイムアウト時はプロセスも停止）
//! - 実行記録の逐次永続化と最終レポートの作成
//!
//! # モジュール構成
//!
//! - [`executor`][]: ワークフロー実行エンジン本体
//! - [`step_executor`][]: 1ステップの実行（参照解決・ティア選択・リトライ・タイムアウト）
//! - [`context`][]: 実行コンテキスト（実行中に共有される唯一の可変状態）
//! - [`result`][]: 実行結果とレポート
//! - [`store`][]: 実行ディレクトリへの永続化
//!
//! # 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use adw_supervisor::config::workflow::Workflow;
//! use adw_supervisor::engine::WorkflowExecutor;
//! use adw_supervisor::safety::TerminalApprovalGate;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = Workflow::from_file("workflows/example.toml")?;
//!     let report = WorkflowExecutor::new(workflow)
//!         .with_approval_gate(Arc::new(TerminalApprovalGate::new()))
//!         .with_run_dir(".adw/runs")
//!         .with_variable("feature", serde_json::json!("パスワードリセット"))
//!         .execute()
//!         .await?;
//!
//!     println!("Workflow: {}", report.workflow_name);
//!     println!("Status: {:?}", report.status);
//!     println!("Total tokens: {}", report.total_tokens_used);
//!
//!     for step in &report.steps {
//!         println!("  Step {}: {:?}", step.step_id, step.status);
//!     }
//!     for skipped in &report.skipped {
//!         println!("  Skipped {}: {}", skipped.step_id, skipped.reason);
//!     }
//!     Ok(())
//! }
//! ```

pub mod result;
pub mod context;
pub mod store;
pub mod step_executor;
pub mod executor;

// 公開APIの再エクスポート
pub use result::{
    ExecutionError, ExecutionReport, ExecutionStats, ExecutionStatus, SkippedStepRecord, StepResult, StepStatus,
};
pub use context::ExecutionContext;
pub use store::RunStore;
pub use step_executor::{backoff_delay, StepExecutor, StepOutcome};
pub use executor::WorkflowExecutor;
