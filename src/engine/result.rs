//! 実行結果の型定義
//!
//! # 責務
//!
//! - ステップ実行結果 [`StepResult`]（1ステップにつき1度だけ生成され、以後変更されない）
//! - スキップ記録 [`SkippedStepRecord`]
//! - 実行レポート [`ExecutionReport`] と集計ステータス [`ExecutionStatus`]
//! - 実行前に返されるエラー [`ExecutionError`]
//!
//! # 使用例
//!
//! ```rust,no_run
//! use adw_supervisor::engine::result::{ExecutionReport, ExecutionStatus};
//!
//! fn handle_report(report: &ExecutionReport) {
//!     match report.status {
//!         ExecutionStatus::Success => println!("成功: {}", report.workflow_name),
//!         ExecutionStatus::PartialSuccess { completed, total } => {
//!             println!("部分成功: {completed}/{total}");
//!         }
//!         ExecutionStatus::Failed => println!("失敗: {:?}", report.errors),
//!     }
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::step::ModelTier;
use crate::error::{ConfigError, PersistenceError};
use crate::expression::ConditionEvaluation;
use crate::provider::TokenUsage;
use crate::watchdog::ResourceAlert;

/// ステップ実行ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    /// 成功（リトライなし）
    Success,

    /// リトライ後に成功
    Retried {
        /// リトライ回数
        attempts: u32,
    },

    /// 失敗
    Failed,
}

/// ステップ実行結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,

    pub status: StepStatus,

    /// エージェントの生出力（失敗時は空）
    pub output: String,

    /// 構造化データとして解釈できた出力
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_output: Option<Value>,

    /// 実行時間（ミリ秒）
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 消費したリトライ回数
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<ModelTier>,

    /// 推定トークン数（プロバイダーが使用量を返した場合はその合計）
    pub token_estimate: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<String>, output: String, parsed_output: Option<Value>, duration: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Success,
            output,
            parsed_output,
            duration_ms: duration_ms(duration),
            error: None,
            retry_count: 0,
            model_tier: None,
            token_estimate: 0,
            token_usage: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: String::new(),
            parsed_output: None,
            duration_ms: duration_ms(duration),
            error: Some(error.into()),
            retry_count: 0,
            model_tier: None,
            token_estimate: 0,
            token_usage: None,
            finished_at: Utc::now(),
        }
    }

    /// 消費したリトライ回数を設定する（成功時はステータスも `Retried` になる）
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        if retry_count > 0 && self.is_success() {
            self.status = StepStatus::Retried { attempts: retry_count };
        }
        self
    }

    pub fn with_model_tier(mut self, tier: ModelTier) -> Self {
        self.model_tier = Some(tier);
        self
    }

    pub fn with_tokens(mut self, estimate: usize, usage: Option<TokenUsage>) -> Self {
        self.token_estimate = usage.map_or(estimate, |u| u.total() as usize);
        self.token_usage = usage;
        self
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.status, StepStatus::Failed)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// 参照解決に使う出力値（構造化できなければ生テキスト）
    pub fn output_value(&self) -> Value {
        self.parsed_output
            .clone()
            .unwrap_or_else(|| Value::String(self.output.clone()))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// スキップされたステップの記録
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedStepRecord {
    pub step_id: String,
    pub reason: String,
    /// 条件評価の詳細（監査用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionEvaluation>,
    pub skipped_at: DateTime<Utc>,
}

impl SkippedStepRecord {
    pub fn new(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            reason: reason.into(),
            condition: None,
            skipped_at: Utc::now(),
        }
    }

    pub fn with_condition(mut self, evaluation: ConditionEvaluation) -> Self {
        self.condition = Some(evaluation);
        self
    }
}

/// ワークフロー実行ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    /// 失敗したステップが無い
    Success,

    /// 一部のステップのみ成功
    PartialSuccess {
        /// 成功したステップ数
        completed: usize,
        /// 総ステップ数
        total: usize,
    },

    /// ワークフロー失敗
    Failed,
}

impl ExecutionStatus {
    /// 集計値からステータスを決める
    ///
    /// 中断（`aborted`）は失敗1件として扱います。
    pub fn from_counts(succeeded: usize, failed: usize, total: usize, aborted: bool) -> Self {
        if failed == 0 && !aborted {
            ExecutionStatus::Success
        } else if succeeded == 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::PartialSuccess {
                completed: succeeded,
                total,
            }
        }
    }
}

/// ステップ数の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// ワークフローの総ステップ数
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// ワークフロー実行レポート
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub success: bool,
    /// ステップ失敗・条件エラー・永続化エラーのメッセージ
    pub errors: Vec<String>,
    pub stats: ExecutionStats,
    /// 宣言順のステップ結果
    pub steps: Vec<StepResult>,
    pub skipped: Vec<SkippedStepRecord>,
    pub alerts: Vec<ResourceAlert>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_tokens_used: usize,
}

impl ExecutionReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Success)
    }

    /// 成功したステップ数
    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|step| step.is_success()).count()
    }

    pub fn total_duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// 実行エラー
///
/// ステップ内の失敗はすべて [`StepResult`] に変換されるため、
/// ここに現れるのは実行開始前の構造的なエラーと実行記録の初期化失敗だけです。
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// 設定エラー
    #[error("設定エラー: {0}")]
    Config(#[from] ConfigError),

    /// 実行記録の初期化に失敗
    #[error("実行記録の初期化に失敗しました: {0}")]
    Persistence(#[from] PersistenceError),
}
