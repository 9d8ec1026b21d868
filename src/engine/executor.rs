//! ワークフロー実行エンジン
//!
//! # 責務
//!
//! このモジュールは、ワークフローの実行を制御する `WorkflowExecutor` を提供します。
//!
//! # 実行フロー（ステップごと）
//!
//! ```text
//! Pending → 条件判定 → { Skipped | Running } → { Succeeded | Failed }
//! ```
//!
//! 1. `when` 条件を評価（偽ならスキップを記録、エラーなら `fail_fast` で中断／スキップ扱い）
//! 2. [`StepExecutor`] で実行（参照解決・ティア選択・監視付き起動・リトライ・タイムアウト）
//! 3. 成功した出力を安全ポリシーでスキャン（`block` は失敗、`pause` は承認待ち、`warn` はログのみ）
//! 4. 出力先（変数・ファイル）へ反映し、結果をコンテキストに追記
//! 5. 結果とコンテキストを実行ディレクトリへ逐次書き出す
//!
//! 最後に集計ステータスを決め、[`ExecutionReport`] を返します。
//!
//! # スケジューリング
//!
//! `max_parallel = 1`（既定）では宣言順に1ステップずつ実行します。
//! `max_parallel > 1` では依存関係グラフの波（wave）ごとに、エージェント実行だけを並行させます。
//! 条件判定・参照解決・結果の記録はエンジンの単一タスクが宣言順に行います。
//!
//! # 使用例
//!
//! ```rust,no_run
//! use adw_supervisor::config::workflow::Workflow;
//! use adw_supervisor::engine::WorkflowExecutor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = Workflow::from_file("workflows/example.toml")?;
//!     let report = WorkflowExecutor::new(workflow)
//!         .with_run_dir(".adw/runs")
//!         .execute()
//!         .await?;
//!
//!     println!("{:?}: {}/{}", report.status, report.stats.succeeded, report.stats.total);
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::step::{OutputSpec, WorkflowStep};
use crate::config::workflow::Workflow;
use crate::error::PersistenceError;
use crate::expression::condition;
use crate::provider::{CliProviderFactory, ProviderFactory};
use crate::safety::{self, ApprovalGate, AutoDeny, PatternSafetyPolicy, SafetyOutcome, SafetyPolicy};
use super::context::ExecutionContext;
use super::result::{
    ExecutionError, ExecutionReport, ExecutionStats, ExecutionStatus, SkippedStepRecord, StepResult, StepStatus,
};
use super::step_executor::{PreparedStep, StepExecutor, StepOutcome};
use super::store::{write_destination, RunStore};

/// 条件判定の結果
enum Gate {
    Run,
    Skip,
    Abort,
}

/// 1回の実行中に変化する状態（エンジンのタスクだけが触る）
struct RunState {
    context: ExecutionContext,
    store: Option<RunStore>,
    errors: Vec<String>,
    aborted: bool,
}

impl RunState {
    fn persistence_failed(&mut self, what: &str, e: PersistenceError) {
        error!(error = %e, "{what}の書き込みに失敗しました");
        self.errors.push(format!("{what}の書き込みに失敗しました: {e}"));
    }

    async fn snapshot(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.write_context(&self.context).await {
            self.persistence_failed("コンテキスト", e);
        }
    }
}

/// ワークフロー実行エンジン
pub struct WorkflowExecutor {
    workflow: Workflow,
    factory: Arc<dyn ProviderFactory>,
    gate: Arc<dyn ApprovalGate>,
    run_dir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    run_id: Option<String>,
    variables: BTreeMap<String, Value>,
    max_parallel: Option<usize>,
}

impl WorkflowExecutor {
    /// CLIプロバイダーと自動拒否ゲートで初期化する
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            factory: Arc::new(CliProviderFactory::default()),
            gate: Arc::new(AutoDeny),
            run_dir: None,
            workdir: None,
            run_id: None,
            variables: BTreeMap::new(),
            max_parallel: None,
        }
    }

    pub fn with_provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// `pause` 違反時の承認ゲート
    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.gate = gate;
        self
    }

    /// 実行記録の保存先（未指定なら保存しない）
    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(dir.into());
        self
    }

    /// エージェントの作業ディレクトリ（`file` / `files` 出力の基準にもなる）
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// ワークフロー定義の変数を上書き・追加する
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// 並列度を上書きする
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// ワークフローを実行する
    ///
    /// ステップの失敗はレポートに記録されます。`Err` になるのは安全ルールの
    /// コンパイル失敗と実行ディレクトリの作成失敗だけです。
    #[instrument(skip_all, fields(workflow = %self.workflow.name()))]
    pub async fn execute(&self) -> Result<ExecutionReport, ExecutionError> {
        let rules = PatternSafetyPolicy::new(self.workflow.safety_rules())?;
        debug!(rules = ?rules.rule_ids().collect::<Vec<_>>(), "安全ルールを読み込みました");
        let policy: Arc<dyn SafetyPolicy> = Arc::new(rules);
        let run_id = self.run_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let store = match &self.run_dir {
            Some(dir) => Some(RunStore::create(dir, &run_id).await?),
            None => None,
        };

        let mut context = ExecutionContext::new(&run_id, self.workflow.name());
        for (name, value) in self.workflow.variables().iter().chain(&self.variables) {
            context.set_variable(name.clone(), value.clone());
        }

        let mut step_executor = StepExecutor::new(self.factory.clone(), self.workflow.settings().clone());
        if let Some(workdir) = &self.workdir {
            step_executor = step_executor.with_workdir(workdir);
        }
        if let Some(store) = &store {
            step_executor = step_executor.with_alert_log(store.alert_log());
        }

        let mut run = RunState {
            context,
            store,
            errors: Vec::new(),
            aborted: false,
        };
        run.snapshot().await;

        let max_parallel = self.max_parallel.unwrap_or(self.workflow.settings().max_parallel).max(1);
        info!(run_id = %run_id, steps = self.workflow.steps().len(), max_parallel, "ワークフローを開始します");

        if max_parallel == 1 {
            self.run_sequential(&step_executor, &policy, &mut run).await;
        } else {
            self.run_waves(&step_executor, &policy, max_parallel, &mut run).await;
        }

        Ok(self.finish(run).await)
    }

    /// 宣言順に1ステップずつ実行する
    async fn run_sequential(&self, executor: &StepExecutor, policy: &Arc<dyn SafetyPolicy>, run: &mut RunState) {
        for step in self.workflow.steps() {
            if run.aborted {
                break;
            }
            match self.check_condition(step, run).await {
                Gate::Run => {}
                Gate::Skip => continue,
                Gate::Abort => break,
            }
            let outcome = executor.execute(step, &run.context).await;
            self.complete_step(step, outcome, policy, run).await;
        }
    }

    /// 依存関係の波ごとに、エージェント実行を並行させる
    async fn run_waves(
        &self,
        executor: &StepExecutor,
        policy: &Arc<dyn SafetyPolicy>,
        max_parallel: usize,
        run: &mut RunState,
    ) {
        for wave in self.workflow.graph().waves() {
            if run.aborted {
                break;
            }
            let members: HashSet<&str> = wave.iter().map(String::as_str).collect();

            // 条件判定と準備は単一タスクで宣言順に行う
            let mut slots: Vec<(&WorkflowStep, Option<StepOutcome>)> = Vec::new();
            let mut jobs: Vec<PreparedStep> = Vec::new();
            for step in self.workflow.steps().iter().filter(|s| members.contains(s.id())) {
                match self.check_condition(step, run).await {
                    Gate::Run => {}
                    Gate::Skip => continue,
                    Gate::Abort => break,
                }
                match executor.prepare(step, &run.context) {
                    Ok(prepared) => {
                        jobs.push(prepared);
                        slots.push((step, None));
                    }
                    Err(outcome) => slots.push((step, Some(*outcome))),
                }
            }

            if run.aborted {
                break;
            }

            info!(steps = jobs.len(), "並行実行を開始します");
            let finished: Vec<StepOutcome> = stream::iter(jobs)
                .map(|prepared| executor.run(prepared))
                .buffered(max_parallel)
                .collect()
                .await;

            // 記録は宣言順に直列化する
            let mut finished = finished.into_iter();
            for (step, early) in slots {
                let Some(outcome) = early.or_else(|| finished.next()) else {
                    continue;
                };
                self.complete_step(step, outcome, policy, run).await;
            }
        }
    }

    /// `when` 条件を評価し、スキップや中断を記録する
    async fn check_condition(&self, step: &WorkflowStep, run: &mut RunState) -> Gate {
        run.context.start_step(step.id());
        let Some(when) = step.when() else {
            return Gate::Run;
        };

        let evaluation = condition::evaluate(when, &run.context);
        run.context.record_condition(evaluation.clone());

        let reason = match &evaluation.error {
            Some(message) => {
                warn!(step_id = step.id(), condition = when, error = %message, "条件式の評価に失敗しました");
                run.errors.push(format!("{}: 条件式の評価に失敗しました: {message}", step.id()));
                if self.workflow.settings().fail_fast {
                    run.aborted = true;
                    return Gate::Abort;
                }
                format!("条件式の評価に失敗しました: {message}")
            }
            None if evaluation.evaluated => return Gate::Run,
            None => format!("条件が偽です: {when}"),
        };

        info!(step_id = step.id(), reason = %reason, "ステップをスキップします");
        let record = SkippedStepRecord::new(step.id(), reason).with_condition(evaluation);
        if let Some(store) = &run.store
            && let Err(e) = store.append_skip(&record).await
        {
            run.persistence_failed("スキップ記録", e);
        }
        run.context.record_skip(record);
        run.snapshot().await;
        Gate::Skip
    }

    /// 安全チェック・出力の反映・記録を行う
    async fn complete_step(
        &self,
        step: &WorkflowStep,
        outcome: StepOutcome,
        policy: &Arc<dyn SafetyPolicy>,
        run: &mut RunState,
    ) {
        let StepOutcome {
            mut result,
            alerts,
            audit,
        } = outcome;

        // 監視側が alerts.jsonl に書き出し済みなので、ここではコンテキストにだけ記録する
        for alert in alerts {
            run.context.record_alert(alert);
        }

        if result.is_success() {
            let policy = match step.safety() {
                Some(policy_override) => policy.merge_policy(policy_override),
                None => policy.clone(),
            };
            let review = safety::review(policy.as_ref(), self.gate.as_ref(), step.id(), &result.output).await;
            let outcome = review.outcome;
            run.context.record_safety(review);

            if !outcome.permits_output() {
                let message = match outcome {
                    SafetyOutcome::Blocked => "安全ルールによりブロックされました",
                    _ => "安全チェックで出力が承認されませんでした",
                };
                result.status = StepStatus::Failed;
                result.error = Some(message.to_string());
                result.output.clear();
                result.parsed_output = None;
            }
        }

        if result.is_success() {
            if let Err(e) = self.deliver(step, &result, &mut run.context).await {
                warn!(step_id = step.id(), error = %e, "出力先への書き出しに失敗しました");
                result.status = StepStatus::Failed;
                result.error = Some(e.to_string());
            } else if let (Some(store), Some(audit)) = (&run.store, &audit)
                && let Err(e) = store.write_output(&result, audit).await
            {
                run.persistence_failed("ステップ出力", e);
            }
        }

        if let Some(message) = &result.error {
            run.errors.push(format!("{}: {message}", step.id()));
            if self.workflow.settings().fail_fast {
                warn!(step_id = step.id(), "fail_fast のため実行を中断します");
                run.aborted = true;
            }
        }

        if let Some(store) = &run.store
            && let Err(e) = store.append_result(&result).await
        {
            run.persistence_failed("ステップ結果", e);
        }
        run.context.record_result(result);
        run.snapshot().await;
    }

    /// 出力先指定に従って出力を反映する
    async fn deliver(
        &self,
        step: &WorkflowStep,
        result: &StepResult,
        context: &mut ExecutionContext,
    ) -> Result<(), PersistenceError> {
        match step.output() {
            None => Ok(()),
            Some(OutputSpec::Variable { name }) => {
                context.set_variable(name.clone(), result.output_value());
                Ok(())
            }
            Some(spec) => {
                let base = self.workdir.as_deref().unwrap_or(Path::new("."));
                let written = write_destination(spec, result, base).await?;
                info!(step_id = step.id(), files = written.len(), "出力を書き出しました");
                Ok(())
            }
        }
    }

    /// 集計してレポートを作る
    async fn finish(&self, mut run: RunState) -> ExecutionReport {
        let results = run.context.results();
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        let stats = ExecutionStats {
            total: self.workflow.steps().len(),
            succeeded,
            failed,
            skipped: run.context.skipped().len(),
        };
        let status = ExecutionStatus::from_counts(succeeded, failed, stats.total, run.aborted);
        let success = matches!(status, ExecutionStatus::Success);

        run.context.finish(success);
        run.snapshot().await;

        let report = ExecutionReport {
            run_id: run.context.run_id().to_string(),
            workflow_name: self.workflow.name().to_string(),
            status,
            success,
            errors: run.errors.clone(),
            stats,
            steps: run.context.results().to_vec(),
            skipped: run.context.skipped().to_vec(),
            alerts: run.context.alerts().to_vec(),
            started_at: run.context.started_at(),
            finished_at: run.context.finished_at().unwrap_or_else(Utc::now),
            total_tokens_used: run.context.total_tokens(),
        };

        if let Some(store) = &run.store
            && let Err(e) = store.write_report(&report).await
        {
            error!(error = %e, "レポートの書き込みに失敗しました");
        }

        info!(
            run_id = %report.run_id,
            status = ?report.status,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "ワークフローが終了しました"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::step::Provider;
    use crate::error::ProviderError;
    use crate::provider::{AgentRequest, ProviderClient, ProviderResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// プロンプトをそのまま返し、呼び出しを記録するクライアント
    #[derive(Default)]
    struct EchoClient {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProviderClient for EchoClient {
        async fn execute(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if request.prompt.contains("FAIL") {
                return Err(ProviderError::NonZeroExit {
                    code: Some(2),
                    stderr: "requested failure".to_string(),
                });
            }
            Ok(ProviderResponse {
                content: request.prompt.clone(),
                ..Default::default()
            })
        }
    }

    struct Factory(Arc<EchoClient>);

    impl ProviderFactory for Factory {
        fn create(&self, _provider: Provider) -> Result<Arc<dyn ProviderClient>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    fn executor(toml: &str) -> (WorkflowExecutor, Arc<EchoClient>) {
        let client = Arc::new(EchoClient::default());
        let workflow = Workflow::from_toml(toml).unwrap();
        let executor = WorkflowExecutor::new(workflow).with_provider_factory(Arc::new(Factory(client.clone())));
        (executor, client)
    }

    #[tokio::test]
    async fn test_outputs_flow_into_later_prompts() {
        let (executor, client) = executor(
            r#"
[workflow]
name = "chain"
default_retries = 0

[variables]
feature = "login"

[[steps]]
id = "plan"
prompt = "plan ${variables.feature}"
output = { type = "variable", name = "plan_text" }

[[steps]]
id = "build"
prompt = "build from ${steps.plan.output} / ${variables.plan_text}"
"#,
        );

        let report = executor.execute().await.unwrap();
        assert!(report.success);
        assert_eq!(report.stats.succeeded, 2);
        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts[1], "build from plan login / plan login");
    }

    #[tokio::test]
    async fn test_condition_error_is_skip_without_fail_fast() {
        let (executor, _) = executor(
            r#"
[workflow]
name = "cond"
default_retries = 0

[[steps]]
id = "a"
prompt = "x"

[[steps]]
id = "b"
prompt = "y"
when = "${steps.a.output ==}"

[[steps]]
id = "c"
prompt = "z"
"#,
        );

        let report = executor.execute().await.unwrap();
        assert_eq!(report.stats.skipped, 1);
        assert_eq!(report.stats.succeeded, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.skipped[0].reason.contains("条件式"));
        // 失敗ステップは無いので成功扱い
        assert_eq!(report.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_condition_error_aborts_with_fail_fast() {
        let (executor, client) = executor(
            r#"
[workflow]
name = "cond"
fail_fast = true
default_retries = 0

[[steps]]
id = "a"
prompt = "x"

[[steps]]
id = "b"
prompt = "y"
when = "${unknown.thing}"

[[steps]]
id = "c"
prompt = "z"
"#,
        );

        let report = executor.execute().await.unwrap();
        assert_eq!(
            report.status,
            ExecutionStatus::PartialSuccess { completed: 1, total: 3 }
        );
        assert!(!report.success);
        assert_eq!(client.prompts.lock().unwrap().len(), 1);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_failure() {
        let (executor, client) = executor(
            r#"
[workflow]
name = "ff"
fail_fast = true
default_retries = 0

[[steps]]
id = "a"
prompt = "FAIL please"

[[steps]]
id = "b"
prompt = "never"
"#,
        );

        let report = executor.execute().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(client.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_safety_block_fails_step_and_hides_output() {
        let (executor, _) = executor(
            r#"
[workflow]
name = "safe"
default_retries = 0

[[safety.rules]]
id = "secret"
pattern = "sk-[a-z0-9]{8}"
severity = "block"

[[steps]]
id = "leak"
prompt = "token sk-abcdef12"
output = { type = "variable", name = "leaked" }

[[steps]]
id = "allowed"
prompt = "token sk-abcdef12"

[steps.safety]
disable = ["secret"]
"#,
        );

        let report = executor.execute().await.unwrap();
        let leak = &report.steps[0];
        assert!(!leak.is_success());
        assert!(leak.output.is_empty());
        assert!(report.steps[1].is_success());
        assert_eq!(report.status, ExecutionStatus::PartialSuccess { completed: 1, total: 2 });
    }

    #[tokio::test]
    async fn test_parallel_waves_record_in_declaration_order() {
        let (executor, client) = executor(
            r#"
[workflow]
name = "dag"
max_parallel = 4
default_retries = 0

[[steps]]
id = "a"
prompt = "A"

[[steps]]
id = "b"
prompt = "B"

[[steps]]
id = "c"
prompt = "C ${steps.a.output} ${steps.b.output}"
"#,
        );

        let report = executor.execute().await.unwrap();
        assert!(report.success);
        let order: Vec<&str> = report.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(client.prompts.lock().unwrap().contains(&"C A B".to_string()));
    }

    #[tokio::test]
    async fn test_variable_readers_match_sequential_run() {
        const WORKFLOW: &str = r#"
[workflow]
name = "vars"
default_retries = 0

[[steps]]
id = "plan"
prompt = "plan"
output = { type = "variable", name = "plan_text" }

[[steps]]
id = "lint"
prompt = "lint"

[[steps]]
id = "build"
prompt = "build ${variables.plan_text}"
"#;

        let mut reports = Vec::new();
        for parallel in [1, 4] {
            let (executor, _) = executor(WORKFLOW);
            reports.push(executor.with_max_parallel(parallel).execute().await.unwrap());
        }
        let [sequential, parallel] = &reports[..] else {
            unreachable!();
        };

        assert!(sequential.success, "{:?}", sequential.errors);
        assert_eq!(parallel.success, sequential.success);
        assert_eq!(parallel.errors, sequential.errors);
        let summary = |report: &ExecutionReport| -> Vec<(String, String)> {
            report.steps.iter().map(|s| (s.step_id.clone(), s.output.clone())).collect()
        };
        assert_eq!(summary(parallel), summary(sequential));
        assert_eq!(parallel.steps[2].output, "build plan");
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_output_out_of_run_store() {
        let runs = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(
            r#"
[workflow]
name = "deliver"
default_retries = 0

[[steps]]
id = "gen"
prompt = "{\"a.rs\": \"ok\", \"z/../../evil\": \"x\"}"
output = { type = "files", dir = "gen" }
"#,
        );

        let report = executor
            .with_run_dir(runs.path())
            .with_run_id("run-1")
            .with_workdir(workdir.path())
            .execute()
            .await
            .unwrap();

        let step = &report.steps[0];
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.is_some());
        let outputs = runs.path().join("run-1").join("outputs");
        assert!(!outputs.join("gen.json").exists());
        assert!(!outputs.join("gen.meta.json").exists());
        assert!(!workdir.path().join("gen/a.rs").exists());
    }

    #[tokio::test]
    async fn test_run_dir_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _) = executor(
            r#"
[workflow]
name = "persist"
default_retries = 0

[[steps]]
id = "a"
prompt = "{\"k\": 1}"

[[steps]]
id = "b"
prompt = "never"
when = "${false}"
"#,
        );

        let report = executor
            .with_run_dir(dir.path())
            .with_run_id("run-42")
            .with_variable("extra", json!(true))
            .execute()
            .await
            .unwrap();
        assert_eq!(report.run_id, "run-42");

        let run = dir.path().join("run-42");
        for file in ["results.jsonl", "skipped.jsonl", "context.json", "report.json", "outputs/a.json", "outputs/a.meta.json"] {
            assert!(run.join(file).exists(), "{file} が作成されていません");
        }
        let loaded = RunStore::open(&run).load_results().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].parsed_output, Some(json!({"k": 1})));
    }
}
