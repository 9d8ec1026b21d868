//! 実行コンテキスト
//!
//! # 責務
//!
//! - 1回の実行（`run_id`）で共有される唯一の可変状態
//! - 変数マップ、ステップ結果（追記のみ）、スキップ記録、リソースアラート、安全チェック記録の保持
//! - 参照解決元 [`ReferenceScope`] としての振る舞い
//!
//! 書き込みはエンジンの単一タスクからのみ行われます。並列実行時も、
//! 並行に走るのはエージェントの実行部分だけで、結果の記録は宣言順に直列化されます。
//!
//! # 使用例
//!
//! ```rust
//! use std::time::Duration;
//! use adw_supervisor::engine::{ExecutionContext, StepResult};
//! use adw_supervisor::expression::resolve_prompt;
//!
//! let mut ctx = ExecutionContext::new("run-1", "example");
//! ctx.record_result(StepResult::succeeded("plan", "3 files".to_string(), None, Duration::from_secs(1)));
//!
//! let prompt = resolve_prompt(&ctx, "plan: ${steps.plan.output}").unwrap();
//! assert_eq!(prompt, "plan: 3 files");
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::expression::{ConditionEvaluation, ReferenceScope, StepLookup};
use crate::safety::SafetyReview;
use crate::watchdog::ResourceAlert;
use super::result::{SkippedStepRecord, StepResult};

/// 実行コンテキスト
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    run_id: String,
    workflow_name: String,
    variables: BTreeMap<String, Value>,
    results: Vec<StepResult>,
    skipped: Vec<SkippedStepRecord>,
    alerts: Vec<ResourceAlert>,
    conditions: Vec<ConditionEvaluation>,
    safety_reviews: Vec<SafetyReview>,
    current_step: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    success: Option<bool>,
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            variables: BTreeMap::new(),
            results: Vec::new(),
            skipped: Vec::new(),
            alerts: Vec::new(),
            conditions: Vec::new(),
            safety_reviews: Vec::new(),
            current_step: None,
            started_at: Utc::now(),
            finished_at: None,
            success: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    /// 変数を設定する（同名の変数は上書き）
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// 実行中のステップを設定する
    pub fn start_step(&mut self, step_id: &str) {
        self.current_step = Some(step_id.to_string());
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// ステップ結果を追記する
    ///
    /// 同じステップの結果が既にある場合は記録せず `false` を返します。
    pub fn record_result(&mut self, result: StepResult) -> bool {
        if self.result(&result.step_id).is_some() || self.is_skipped(&result.step_id) {
            warn!(step_id = %result.step_id, "ステップ結果は既に記録されています");
            return false;
        }
        if self.current_step.as_deref() == Some(result.step_id.as_str()) {
            self.current_step = None;
        }
        self.results.push(result);
        true
    }

    /// スキップを記録する
    pub fn record_skip(&mut self, record: SkippedStepRecord) -> bool {
        if self.result(&record.step_id).is_some() || self.is_skipped(&record.step_id) {
            warn!(step_id = %record.step_id, "ステップは既に記録されています");
            return false;
        }
        if self.current_step.as_deref() == Some(record.step_id.as_str()) {
            self.current_step = None;
        }
        self.skipped.push(record);
        true
    }

    pub fn record_alert(&mut self, alert: ResourceAlert) {
        self.alerts.push(alert);
    }

    pub fn record_condition(&mut self, evaluation: ConditionEvaluation) {
        self.conditions.push(evaluation);
    }

    pub fn record_safety(&mut self, review: SafetyReview) {
        self.safety_reviews.push(review);
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn skipped(&self) -> &[SkippedStepRecord] {
        &self.skipped
    }

    pub fn is_skipped(&self, step_id: &str) -> bool {
        self.skipped.iter().any(|s| s.step_id == step_id)
    }

    pub fn alerts(&self) -> &[ResourceAlert] {
        &self.alerts
    }

    pub fn conditions(&self) -> &[ConditionEvaluation] {
        &self.conditions
    }

    pub fn safety_reviews(&self) -> &[SafetyReview] {
        &self.safety_reviews
    }

    pub fn total_tokens(&self) -> usize {
        self.results.iter().map(|r| r.token_estimate).sum()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn success(&self) -> Option<bool> {
        self.success
    }

    /// 実行を終了する
    pub fn finish(&mut self, success: bool) {
        self.current_step = None;
        self.finished_at = Some(Utc::now());
        self.success = Some(success);
    }
}

impl ReferenceScope for ExecutionContext {
    fn lookup_step(&self, step_id: &str) -> StepLookup {
        if self.is_skipped(step_id) {
            return StepLookup::Skipped;
        }
        match self.result(step_id) {
            None => StepLookup::NotExecuted,
            Some(result) if result.is_success() => StepLookup::Succeeded(result.output_value()),
            Some(_) => StepLookup::Failed,
        }
    }

    fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}
