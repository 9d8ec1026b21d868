//! ステップ実行
//!
//! # 責務
//!
//! - プロンプト中の参照を解決（失敗したらプロセスを起動せずに失敗結果）
//! - コンテキスト上限の確認とモデルティアの選択
//! - ツールプロファイルによるリソース上限・タイムアウトの調整
//! - リトライ（指数バックオフ）とタイムアウトで包んだエージェント実行
//!
//! 失敗はすべて [`StepResult`] に変換され、この境界の外には伝播しません。
//!
//! # 準備と実行の分離
//!
//! [`StepExecutor::prepare`] はコンテキストを読むだけの同期処理、
//! [`StepExecutor::run`] はコンテキストに触れない非同期処理です。
//! エンジンは準備を単一タスクで行い、実行だけを並行させます。

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::step::{ModelTier, Provider, WorkflowStep};
use crate::config::workflow::WorkflowSettings;
use crate::detector::{estimate_tokens, ContextOverflowWatchdog, ContextStatus};
use crate::error::ProviderError;
use crate::expression::resolve_prompt;
use crate::provider::model_tier::{resolve_model, select_tier};
use crate::provider::{AgentRequest, ProcessStats, ProviderFactory, ProviderResponse};
use crate::watchdog::profile::TunedLimits;
use crate::watchdog::{AlertLog, ResourceAlert, ToolProfile, WatchdogConfig};
use super::context::ExecutionContext;
use super::result::StepResult;

/// バックオフの初期値（ミリ秒）
const BACKOFF_BASE_MS: u64 = 1_000;

/// バックオフの上限（ミリ秒）
const BACKOFF_MAX_MS: u64 = 10_000;

/// `attempt` 回目の失敗後に待つ時間: `min(1000 × 2^(attempt-1), 10000)` ミリ秒
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(1 << exponent).min(BACKOFF_MAX_MS))
}

/// 実行準備の済んだステップ
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub step: WorkflowStep,
    /// 解決済みのプロンプト
    pub prompt: String,
    pub model_tier: ModelTier,
    pub watchdog: WatchdogConfig,
    pub tuned: Option<TunedLimits>,
    /// 倍率適用後のタイムアウト
    pub timeout: Duration,
    pub retries: u32,
}

/// 出力に添える監査メタデータ（`<step>.meta.json`）
#[derive(Debug, Clone, Serialize)]
pub struct StepAudit {
    pub step_id: String,
    pub provider: Provider,
    pub agent: String,
    pub model_tier: ModelTier,
    pub model: String,
    pub timeout_secs: u64,
    pub attempts: u32,
    /// 適用したリソース上限
    pub limits: WatchdogConfig,
    /// ツールプロファイルから導出した値
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<TunedLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_kind: Option<&'static str>,
    pub recorded_at: DateTime<Utc>,
}

/// ステップ実行の帰結
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    /// 試行中に発生したリソースアラート
    pub alerts: Vec<ResourceAlert>,
    /// 成功時の監査メタデータ
    pub audit: Option<StepAudit>,
}

impl StepOutcome {
    fn failed(result: StepResult) -> Self {
        Self {
            result,
            alerts: Vec::new(),
            audit: None,
        }
    }
}

/// タイムアウトで Future が破棄されても残る試行状態
#[derive(Debug, Default)]
struct AttemptState {
    attempts: u32,
    alerts: Vec<ResourceAlert>,
}

/// ステップ実行器
#[derive(Clone)]
pub struct StepExecutor {
    factory: Arc<dyn ProviderFactory>,
    settings: WorkflowSettings,
    workdir: Option<PathBuf>,
    alert_log: Option<AlertLog>,
}

impl StepExecutor {
    pub fn new(factory: Arc<dyn ProviderFactory>, settings: WorkflowSettings) -> Self {
        Self {
            factory,
            settings,
            workdir: None,
            alert_log: None,
        }
    }

    /// エージェントの作業ディレクトリ
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// リソースアラートの書き出し先
    pub fn with_alert_log(mut self, log: AlertLog) -> Self {
        self.alert_log = Some(log);
        self
    }

    /// ステップを準備して実行する
    pub async fn execute(&self, step: &WorkflowStep, context: &ExecutionContext) -> StepOutcome {
        match self.prepare(step, context) {
            Ok(prepared) => self.run(prepared).await,
            Err(outcome) => *outcome,
        }
    }

    /// 参照解決・ティア選択・上限の決定
    ///
    /// 参照解決やコンテキスト上限で失敗した場合は、実行せずに失敗結果を返します。
    pub fn prepare(&self, step: &WorkflowStep, context: &ExecutionContext) -> Result<PreparedStep, Box<StepOutcome>> {
        let prompt = resolve_prompt(context, step.prompt()).map_err(|e| {
            warn!(step_id = step.id(), reference = e.reference(), error = %e, "参照の解決に失敗しました");
            Box::new(StepOutcome::failed(StepResult::failed(step.id(), e.to_string(), Duration::ZERO)))
        })?;

        if let Some(max_tokens) = self.settings.context_max_tokens {
            let check = ContextOverflowWatchdog::new(max_tokens).check(&prompt);
            match check.status {
                ContextStatus::Overflow => {
                    warn!(step_id = step.id(), tokens = check.estimated_tokens, max_tokens, "コンテキスト上限を超えています");
                    let message = format!(
                        "プロンプトがコンテキスト上限を超えています（推定 {} / 上限 {} トークン）",
                        check.estimated_tokens, max_tokens
                    );
                    return Err(Box::new(StepOutcome::failed(
                        StepResult::failed(step.id(), message, Duration::ZERO).with_tokens(check.estimated_tokens, None),
                    )));
                }
                ContextStatus::NearLimit => {
                    warn!(step_id = step.id(), ratio = check.ratio(), "コンテキスト上限に近づいています");
                }
                ContextStatus::Within => {}
            }
        }

        let model_tier = select_tier(step.model_tier(), step.agent(), &prompt);
        let resources = self.settings.resources_for(step);
        let watchdog = WatchdogConfig::resolve(&resources, step.tool());
        let tuned = step.tool().map(ToolProfile::tune);
        let multiplier = tuned.as_ref().map_or(1.0, |t| t.timeout_multiplier);
        let timeout = self.settings.timeout_for(step).mul_f64(multiplier);

        debug!(
            step_id = step.id(),
            %model_tier,
            timeout_secs = timeout.as_secs(),
            memory_limit_mb = watchdog.memory_limit_mb,
            "ステップの準備ができました"
        );

        Ok(PreparedStep {
            step: step.clone(),
            prompt,
            model_tier,
            watchdog,
            tuned,
            timeout,
            retries: self.settings.retries_for(step),
        })
    }

    /// リトライとタイムアウトで包んで実行する
    ///
    /// タイムアウト時は実行中の Future を破棄し、プロセスツリーも停止されます。
    #[instrument(skip_all, fields(step_id = %prepared.step.id()))]
    pub async fn run(&self, prepared: PreparedStep) -> StepOutcome {
        let started = Instant::now();
        let state = Mutex::new(AttemptState::default());

        let outcome = tokio::time::timeout(prepared.timeout, self.attempt_all(&prepared, &state)).await;
        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        let retry_count = state.attempts.saturating_sub(1);
        let step_id = prepared.step.id();

        let (result, audit) = match outcome {
            Ok(Ok(response)) => {
                let parsed = parse_output(&response.content);
                let estimate = estimate_tokens(&prepared.prompt) + estimate_tokens(&response.content);
                let audit = self.audit(&prepared, &response, state.attempts);
                info!(step_id, attempts = state.attempts, structured = parsed.is_some(), "ステップが成功しました");
                let result = StepResult::succeeded(step_id, response.content, parsed, started.elapsed())
                    .with_tokens(estimate, response.token_usage);
                (result, Some(audit))
            }
            Ok(Err(e)) => {
                warn!(step_id, attempts = state.attempts, error = %e, "ステップが失敗しました");
                (StepResult::failed(step_id, e.to_string(), started.elapsed()), None)
            }
            Err(_) => {
                let e = ProviderError::Timeout(format!(
                    "ステップ '{}' が {}秒以内に完了しませんでした",
                    step_id,
                    prepared.timeout.as_secs()
                ));
                warn!(step_id, attempts = state.attempts, "ステップがタイムアウトしました");
                (StepResult::failed(step_id, e.to_string(), started.elapsed()), None)
            }
        };

        StepOutcome {
            result: result.with_retries(retry_count).with_model_tier(prepared.model_tier),
            alerts: state.alerts,
            audit,
        }
    }

    /// 最大 `retries + 1` 回試行する
    ///
    /// リソース監視による停止はリトライしません。
    async fn attempt_all(&self, prepared: &PreparedStep, state: &Mutex<AttemptState>) -> Result<ProviderResponse, ProviderError> {
        let step_id = prepared.step.id();
        let mut attempt = 1;
        loop {
            state.lock().unwrap_or_else(PoisonError::into_inner).attempts = attempt;
            debug!(step_id, attempt, "エージェントを起動します");

            let error = match self.attempt(prepared).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if let ProviderError::ResourceLimit(alert) = &error {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .alerts
                    .push(alert.as_ref().clone());
                return Err(error);
            }
            if attempt > prepared.retries {
                return Err(error);
            }

            let delay = backoff_delay(attempt);
            warn!(step_id, attempt, delay_ms = delay.as_millis() as u64, error = %error, "リトライします");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, prepared: &PreparedStep) -> Result<ProviderResponse, ProviderError> {
        let client = self.factory.create(prepared.step.provider())?;
        let mut request = AgentRequest::new(prepared.step.id(), prepared.prompt.clone(), prepared.model_tier);
        request.agent = prepared.step.agent().to_string();
        request.workdir = self.workdir.clone();
        request.watchdog = prepared.watchdog.clone();
        request.alert_log = self.alert_log.clone();
        client.execute(&request).await
    }

    fn audit(&self, prepared: &PreparedStep, response: &ProviderResponse, attempts: u32) -> StepAudit {
        let provider = prepared.step.provider();
        let model = if response.model.is_empty() {
            resolve_model(&provider, &prepared.model_tier).to_string()
        } else {
            response.model.clone()
        };
        StepAudit {
            step_id: prepared.step.id().to_string(),
            provider,
            agent: prepared.step.agent().to_string(),
            model_tier: prepared.model_tier,
            model,
            timeout_secs: prepared.timeout.as_secs(),
            attempts,
            limits: prepared.watchdog.clone(),
            tool: prepared.tuned.clone(),
            process: response.process,
            output_kind: prepared.step.output().map(|o| o.kind()),
            recorded_at: Utc::now(),
        }
    }
}

/// 出力を構造化データとして解釈する
///
/// 全体が JSON ならそれを、そうでなければ最初の ```` ```json ```` ブロックを試します。
pub fn parse_output(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find("```json")? + "```json".len();
    let rest = &trimmed[start..];
    let end = rest.find("```")?;
    serde_json::from_str(rest[..end].trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::step::{OutputSpec, ResourceOverrides};
    use crate::error::ReferenceError;
    use crate::provider::ProviderClient;
    use crate::watchdog::{AlertKind, DeploymentScope};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 決められた回数だけ失敗してから成功するクライアント
    struct FlakyClient {
        failures: u32,
        calls: Arc<AtomicU32>,
        delay: Duration,
        prompts: Arc<Mutex<Vec<AgentRequest>>>,
    }

    #[async_trait]
    impl ProviderClient for FlakyClient {
        async fn execute(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.prompts.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            if call <= self.failures {
                return Err(ProviderError::NonZeroExit {
                    code: Some(1),
                    stderr: format!("failure {call}"),
                });
            }
            Ok(ProviderResponse {
                content: "{\"done\": true}".to_string(),
                model: "mock-model".to_string(),
                ..Default::default()
            })
        }
    }

    struct Factory(Arc<dyn ProviderClient>);

    impl ProviderFactory for Factory {
        fn create(&self, _provider: Provider) -> Result<Arc<dyn ProviderClient>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        executor: StepExecutor,
        calls: Arc<AtomicU32>,
        requests: Arc<Mutex<Vec<AgentRequest>>>,
    }

    fn fixture(failures: u32, delay: Duration, settings: WorkflowSettings) -> Fixture {
        let calls = Arc::new(AtomicU32::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let client = FlakyClient {
            failures,
            calls: calls.clone(),
            delay,
            prompts: requests.clone(),
        };
        Fixture {
            executor: StepExecutor::new(Arc::new(Factory(Arc::new(client))), settings),
            calls,
            requests,
        }
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(4), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(5), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(40), Duration::from_millis(10_000));
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output(" {\"a\": 1} \n"), Some(json!({"a": 1})));
        assert_eq!(
            parse_output("結果です:\n```json\n[1, 2]\n```\n以上"),
            Some(json!([1, 2]))
        );
        assert_eq!(parse_output("just text"), None);
        assert_eq!(parse_output(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let fx = fixture(2, Duration::ZERO, WorkflowSettings::default());
        let step = WorkflowStep::new("a", "do it").with_retries(2);
        let ctx = ExecutionContext::new("r", "w");

        let started = tokio::time::Instant::now();
        let outcome = fx.executor.execute(&step, &ctx).await;
        assert!(outcome.result.is_success());
        assert_eq!(outcome.result.retry_count, 2);
        assert_eq!(outcome.result.parsed_output, Some(json!({"done": true})));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
        // 1s + 2s のバックオフ
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(outcome.audit.unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_makes_exactly_retries_plus_one_attempts() {
        let fx = fixture(u32::MAX, Duration::ZERO, WorkflowSettings::default());
        let step = WorkflowStep::new("a", "do it").with_retries(3);
        let ctx = ExecutionContext::new("r", "w");

        let outcome = fx.executor.execute(&step, &ctx).await;
        assert!(!outcome.result.is_success());
        assert_eq!(fx.calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.result.retry_count, 3);
        assert!(outcome.result.error.unwrap().contains("failure 4"));
        assert!(outcome.audit.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_produces_failed_result() {
        let fx = fixture(0, Duration::from_secs(30), WorkflowSettings::default());
        let step = WorkflowStep::new("slow", "wait").with_timeout_secs(5);
        let ctx = ExecutionContext::new("r", "w");

        let outcome = fx.executor.execute(&step, &ctx).await;
        assert!(!outcome.result.is_success());
        assert!(outcome.result.error.unwrap().contains("5秒以内"));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_multiplier_from_tool_profile() {
        let fx = fixture(0, Duration::from_secs(8), WorkflowSettings::default());
        let step = WorkflowStep::new("svc", "deploy")
            .with_timeout_secs(5)
            .with_tool(ToolProfile {
                languages: vec!["python".to_string()],
                scope: DeploymentScope::CloudService,
            });
        let ctx = ExecutionContext::new("r", "w");

        let outcome = fx.executor.execute(&step, &ctx).await;
        assert!(outcome.result.is_success());
        let audit = outcome.audit.unwrap();
        assert_eq!(audit.timeout_secs, 10);
        assert!(audit.tool.is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_prompt_spawns_nothing() {
        let fx = fixture(0, Duration::ZERO, WorkflowSettings::default());
        let step = WorkflowStep::new("c", "use ${steps.b.output}");
        let mut ctx = ExecutionContext::new("r", "w");
        ctx.record_skip(crate::engine::SkippedStepRecord::new("b", "条件が偽"));

        let outcome = fx.executor.execute(&step, &ctx).await;
        assert!(!outcome.result.is_success());
        let expected = ReferenceError::SkippedStepReference {
            reference: "steps.b.output".to_string(),
            step_id: "b".to_string(),
        };
        assert_eq!(outcome.result.error.as_deref(), Some(expected.to_string().as_str()));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_context_overflow_refuses_to_spawn() {
        let settings = WorkflowSettings {
            context_max_tokens: Some(10),
            ..WorkflowSettings::default()
        };
        let fx = fixture(0, Duration::ZERO, settings);
        let step = WorkflowStep::new("big", "x".repeat(100));
        let ctx = ExecutionContext::new("r", "w");

        let outcome = fx.executor.execute(&step, &ctx).await;
        assert!(!outcome.result.is_success());
        assert_eq!(outcome.result.token_estimate, 25);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_carries_resolved_prompt_tier_and_limits() {
        let settings = WorkflowSettings {
            resources: ResourceOverrides {
                memory_limit_mb: Some(512),
                ..Default::default()
            },
            ..WorkflowSettings::default()
        };
        let fx = fixture(0, Duration::ZERO, settings);
        let step = WorkflowStep::new("impl", "implement ${variables.feature}")
            .with_agent("implement")
            .with_output(OutputSpec::Variable { name: "code".into() });
        let mut ctx = ExecutionContext::new("r", "w");
        ctx.set_variable("feature", json!("login"));

        let outcome = fx.executor.execute(&step, &ctx).await;
        assert!(outcome.result.is_success());
        assert_eq!(outcome.result.model_tier, Some(ModelTier::Medium));

        let requests = fx.requests.lock().unwrap();
        assert_eq!(requests[0].prompt, "implement login");
        assert_eq!(requests[0].agent, "implement");
        assert_eq!(requests[0].watchdog.memory_limit_mb, 512);
        assert_eq!(outcome.audit.unwrap().output_kind, Some("variable"));
    }

    #[tokio::test]
    async fn test_resource_kill_is_not_retried() {
        struct Killed(Arc<AtomicU32>);

        #[async_trait]
        impl ProviderClient for Killed {
            async fn execute(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::ResourceLimit(Box::new(ResourceAlert::new(
                    &request.step_id,
                    AlertKind::Memory,
                    300.0,
                    256.0,
                    "MB",
                    "memory limit exceeded",
                    7,
                ))))
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let executor = StepExecutor::new(
            Arc::new(Factory(Arc::new(Killed(calls.clone())))),
            WorkflowSettings::default(),
        );
        let step = WorkflowStep::new("hog", "eat memory").with_retries(3);
        let outcome = executor.execute(&step, &ExecutionContext::new("r", "w")).await;

        assert!(!outcome.result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.alerts[0].kind, AlertKind::Memory);
        assert!(outcome.result.error.unwrap().contains("memory limit exceeded"));
    }
}
