//! Workflow 定義の読み込みと管理を行うモジュール
//!
//! # 責務
//!
//! このモジュールは、Agent 駆動開発のワークフローを TOML 形式で定義し、
//! それを Rust の型として扱うための機能を提供します。
//!
//! ## 主な機能
//!
//! - **TOML パース**: `workflows/` ディレクトリ内の TOML ファイルを読み込み、
//!   [`Workflow`] 構造体に変換
//! - **構造検証**: ステップIDの一意性、出力先の必須項目、安全ルールの正規表現、
//!   ステップ間参照（前方参照・未知のステップ・循環）を実行前に検査
//! - **実行設定**: 既定のタイムアウト・リトライ・fail-fast・並列度・リソース上限
//!
//! ## 使用例
//!
//! ```toml
//! [workflow]
//! name = "feature-implementation"
//! description = "新機能の実装ワークフロー"
//! default_timeout_secs = 900
//! fail_fast = true
//!
//! [workflow.resources]
//! memory_limit_mb = 4096
//!
//! [variables]
//! target = "src/auth.rs"
//!
//! [[steps]]
//! id = "plan"
//! prompt = "${variables.target} の実装計画を作成してください"
//! model_tier = "heavy"
//!
//! [[steps]]
//! id = "implement"
//! agent = "implement"
//! prompt = "計画に基づいて実装してください: ${steps.plan.output}"
//! ```
//!
//! ## 関連モジュール
//!
//! - [`crate::config::step`]: 各ステップの定義
//! - [`crate::expression::dependency`]: 静的な依存関係検査
//! - [`crate::engine::executor`]: ワークフローの実行エンジン

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::expression::DependencyGraph;
use crate::safety::SafetyRuleConfig;
use super::dto::{SafetyDto, WorkflowDto, WorkflowMetadataDto};
use super::step::{validate_resources, validate_step_id, ResourceOverrides, WorkflowStep};

/// 既定のステップタイムアウト（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// 既定のリトライ回数
pub const DEFAULT_RETRIES: u32 = 1;

/// ワークフロー全体の実行設定
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSettings {
    /// ステップの既定タイムアウト（秒）
    pub default_timeout_secs: u64,
    /// ステップの既定リトライ回数
    pub default_retries: u32,
    /// ステップ失敗・条件エラーで実行を打ち切るか
    pub fail_fast: bool,
    /// 同時に実行するエージェント数（1 = 逐次実行）
    pub max_parallel: usize,
    /// プロンプトのトークン上限（超過するとエージェントを起動しない）
    pub context_max_tokens: Option<usize>,
    /// 既定のリソース上限
    pub resources: ResourceOverrides,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_retries: DEFAULT_RETRIES,
            fail_fast: false,
            max_parallel: 1,
            context_max_tokens: None,
            resources: ResourceOverrides::default(),
        }
    }
}

impl WorkflowSettings {
    /// ステップに適用するタイムアウト
    pub fn timeout_for(&self, step: &WorkflowStep) -> Duration {
        step.timeout()
            .unwrap_or(Duration::from_secs(self.default_timeout_secs))
    }

    /// ステップに適用するリトライ回数
    pub fn retries_for(&self, step: &WorkflowStep) -> u32 {
        step.retries().unwrap_or(self.default_retries)
    }

    /// ステップに適用するリソース上限（ステップ → ワークフロー の順）
    pub fn resources_for(&self, step: &WorkflowStep) -> ResourceOverrides {
        step.resources().or(&self.resources)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "default_timeout_secs は 1 以上である必要があります".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::Validation(
                "max_parallel は 1 以上である必要があります".to_string(),
            ));
        }
        if self.context_max_tokens == Some(0) {
            return Err(ConfigError::Validation(
                "context_max_tokens は 1 以上である必要があります".to_string(),
            ));
        }
        validate_resources(&self.resources, "ワークフロー")
    }
}

/// ワークフロー定義（ドメインモデル）
///
/// Agent 駆動開発のワークフロー全体を表す構造体です。
/// バリデーション済みの状態を保証し、実行開始後は読み取り専用です。
///
/// ## DTO との違い
///
/// - [`WorkflowDto`]: TOML デシリアライズ専用、バリデーション前の生データ
/// - [`Workflow`]: バリデーション済み、ドメインロジックを持つ
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    description: Option<String>,
    version: Option<String>,
    settings: WorkflowSettings,
    variables: BTreeMap<String, Value>,
    safety_rules: Vec<SafetyRuleConfig>,
    steps: Vec<WorkflowStep>,
    graph: DependencyGraph,
}

impl Workflow {
    /// ステップ列からワークフローを組み立てる
    ///
    /// TOML と同じ構造検証（ID重複・参照・循環）を行います。
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::Validation("ワークフロー名が空です".to_string()));
        }
        let graph = validate_steps(&steps)?;
        Ok(Self {
            name,
            description: None,
            version: None,
            settings: WorkflowSettings::default(),
            variables: BTreeMap::new(),
            safety_rules: Vec::new(),
            steps,
            graph,
        })
    }

    /// 実行設定を差し替える
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    /// 初期変数を追加する
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// 安全ルールを差し替える
    pub fn with_safety_rules(mut self, rules: Vec<SafetyRuleConfig>) -> Result<Self, ConfigError> {
        validate_rules(&rules)?;
        self.safety_rules = rules;
        Ok(self)
    }

    /// TOML ファイルからワークフローを読み込む
    ///
    /// # 処理フロー
    ///
    /// 1. ファイル読み込み
    /// 2. TOML デシリアライズ → [`WorkflowDto`]
    /// 3. バリデーション & 変換 → [`Workflow`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// TOML 文字列からワークフローを読み込む
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let dto: WorkflowDto = toml::from_str(toml)?;
        Self::try_from(dto)
    }

    /// ワークフローを TOML 文字列に変換
    pub fn to_string(&self) -> Result<String, ConfigError> {
        let dto = WorkflowDto::from(self.clone());
        Ok(toml::to_string(&dto)?)
    }

    /// ワークフローを TOML ファイルに保存
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = self.to_string()?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// 初期変数
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn safety_rules(&self) -> &[SafetyRuleConfig] {
        &self.safety_rules
    }

    /// 宣言順のステップ
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    /// IDでステップを検索
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id() == id)
    }

    /// 検証済みの依存関係グラフ
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}

/// DTO からドメインモデルへの変換（読み込み方向）
///
/// # 処理フロー
///
/// 1. メタデータ・実行設定のバリデーション
/// 2. ステップの変換（`WorkflowStepDto` → `WorkflowStep`）
/// 3. ID重複・参照・循環の検査
/// 4. 安全ルールの正規表現コンパイル確認
impl TryFrom<WorkflowDto> for Workflow {
    type Error = ConfigError;

    fn try_from(dto: WorkflowDto) -> Result<Self, Self::Error> {
        let meta = dto.workflow;
        if meta.name.trim().is_empty() {
            return Err(ConfigError::Validation("ワークフロー名が空です".to_string()));
        }

        let defaults = WorkflowSettings::default();
        let settings = WorkflowSettings {
            default_timeout_secs: meta.default_timeout_secs.unwrap_or(defaults.default_timeout_secs),
            default_retries: meta.default_retries.unwrap_or(defaults.default_retries),
            fail_fast: meta.fail_fast,
            max_parallel: meta.max_parallel.unwrap_or(defaults.max_parallel),
            context_max_tokens: meta.context_max_tokens,
            resources: meta.resources,
        };
        settings.validate()?;

        let steps = dto
            .steps
            .into_iter()
            .map(WorkflowStep::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let graph = validate_steps(&steps)?;

        let safety_rules = dto.safety.map(|safety| safety.rules).unwrap_or_default();
        validate_rules(&safety_rules)?;

        Ok(Self {
            name: meta.name,
            description: meta.description,
            version: meta.version,
            settings,
            variables: dto.variables,
            safety_rules,
            steps,
            graph,
        })
    }
}

/// ドメインモデルから DTO への変換（書き込み方向）
///
/// バリデーション済みのドメインモデルから DTO を生成するため、
/// この変換は失敗しません（`From` トレイトを使用）。
impl From<Workflow> for WorkflowDto {
    fn from(workflow: Workflow) -> Self {
        let settings = workflow.settings;
        Self {
            workflow: WorkflowMetadataDto {
                name: workflow.name,
                description: workflow.description,
                version: workflow.version,
                default_timeout_secs: Some(settings.default_timeout_secs),
                default_retries: Some(settings.default_retries),
                fail_fast: settings.fail_fast,
                max_parallel: Some(settings.max_parallel),
                context_max_tokens: settings.context_max_tokens,
                resources: settings.resources,
            },
            variables: workflow.variables,
            safety: (!workflow.safety_rules.is_empty()).then(|| SafetyDto {
                rules: workflow.safety_rules,
            }),
            steps: workflow.steps.into_iter().map(Into::into).collect(),
        }
    }
}

fn validate_steps(steps: &[WorkflowStep]) -> Result<DependencyGraph, ConfigError> {
    if steps.is_empty() {
        return Err(ConfigError::Validation(
            "ワークフローには少なくとも1つのステップが必要です".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for step in steps {
        validate_step_id(step.id())?;
        if !seen.insert(step.id()) {
            return Err(ConfigError::DuplicateStepId(step.id().to_string()));
        }
    }
    DependencyGraph::build(steps)
}

fn validate_rules(rules: &[SafetyRuleConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "安全ルールID '{}' が重複しています",
                rule.id
            )));
        }
        Regex::new(&rule.pattern).map_err(|source| ConfigError::InvalidPattern {
            rule: rule.id.clone(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
[workflow]
name = "sample"
fail_fast = true
max_parallel = 2

[workflow.resources]
memory_limit_mb = 1024

[variables]
target = "src/lib.rs"
limits = { lines = 200 }

[[safety.rules]]
id = "aws-key"
pattern = "AKIA[0-9A-Z]{16}"
severity = "block"

[[steps]]
id = "plan"
prompt = "plan ${variables.target}"
output = { type = "variable", name = "plan" }

[[steps]]
id = "implement"
agent = "implement"
prompt = "do ${steps.plan.output}"
when = "${steps.plan.output.length > 0}"
timeout_secs = 30
retries = 3

[steps.resources]
memory_limit_mb = 256

[steps.tool]
languages = ["rust"]
scope = "embedded"
"#;

    #[test]
    fn test_parse_full_workflow() {
        let workflow = Workflow::from_toml(SAMPLE).unwrap();
        assert_eq!(workflow.name(), "sample");
        assert!(workflow.settings().fail_fast);
        assert_eq!(workflow.settings().max_parallel, 2);
        assert_eq!(workflow.variables()["limits"], json!({"lines": 200}));
        assert_eq!(workflow.safety_rules().len(), 1);

        let implement = workflow.step("implement").unwrap();
        assert_eq!(implement.agent(), "implement");
        assert_eq!(workflow.settings().timeout_for(implement), Duration::from_secs(30));
        assert_eq!(workflow.settings().retries_for(implement), 3);
        let resources = workflow.settings().resources_for(implement);
        assert_eq!(resources.memory_limit_mb, Some(256));
        assert_eq!(
            workflow.graph().dependencies("implement").collect::<Vec<_>>(),
            vec!["plan"]
        );
    }

    #[test]
    fn test_defaults() {
        let workflow = Workflow::from_toml(
            "[workflow]\nname = \"x\"\n[[steps]]\nid = \"a\"\nprompt = \"p\"\n",
        )
        .unwrap();
        let step = &workflow.steps()[0];
        assert_eq!(
            workflow.settings().timeout_for(step),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
        assert_eq!(workflow.settings().retries_for(step), DEFAULT_RETRIES);
        assert_eq!(workflow.settings().max_parallel, 1);
        assert!(!workflow.settings().fail_fast);
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let err = Workflow::new(
            "dup",
            vec![WorkflowStep::new("a", "x"), WorkflowStep::new("a", "y")],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn test_built_in_step_id_is_checked() {
        let err = Workflow::new("abs", vec![WorkflowStep::new("/tmp/x", "x")]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)), "{err:?}");
    }

    #[test]
    fn test_forward_reference_rejected_at_load() {
        let err = Workflow::new(
            "fwd",
            vec![
                WorkflowStep::new("a", "use ${steps.b.output}"),
                WorkflowStep::new("b", "x"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ForwardReference { .. }));
    }

    #[test]
    fn test_empty_steps_rejected() {
        assert!(Workflow::from_toml("[workflow]\nname = \"x\"\n").is_err());
    }

    #[test]
    fn test_invalid_safety_pattern_rejected() {
        let toml = r#"
[workflow]
name = "x"

[[safety.rules]]
id = "broken"
pattern = "(unclosed"
severity = "warn"

[[steps]]
id = "a"
prompt = "p"
"#;
        let err = Workflow::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { rule, .. } if rule == "broken"));
    }

    #[test]
    fn test_zero_parallel_rejected() {
        let workflow = Workflow::new("x", vec![WorkflowStep::new("a", "p")]).unwrap();
        let settings = WorkflowSettings {
            max_parallel: 0,
            ..Default::default()
        };
        assert!(workflow.with_settings(settings).is_err());
    }

    #[test]
    fn test_roundtrip_preserves_structure() {
        let original = Workflow::from_toml(SAMPLE).unwrap();
        let restored = Workflow::from_toml(&original.to_string().unwrap()).unwrap();
        assert_eq!(restored.steps(), original.steps());
        assert_eq!(restored.settings(), original.settings());
        assert_eq!(restored.variables(), original.variables());
        assert_eq!(restored.safety_rules(), original.safety_rules());
    }

    #[test]
    fn test_built_in_code_matches_toml_form() {
        use crate::config::step::{OutputSpec, Provider};
        use crate::safety::{PolicyOverride, Severity};

        let step = WorkflowStep::new("review", "review ${variables.target}")
            .with_provider(Provider::OpenAI)
            .with_output(OutputSpec::File {
                path: "review.md".into(),
            })
            .with_resources(ResourceOverrides {
                memory_limit_mb: Some(512),
                ..Default::default()
            })
            .with_safety(PolicyOverride {
                disable: vec!["aws-key".to_string()],
                ..Default::default()
            });
        let workflow = Workflow::new("built", vec![step])
            .unwrap()
            .with_variable("target", json!("src/lib.rs"))
            .with_safety_rules(vec![SafetyRuleConfig {
                id: "aws-key".to_string(),
                pattern: "AKIA[0-9A-Z]{16}".to_string(),
                severity: Severity::Block,
                description: None,
            }])
            .unwrap();

        let restored = Workflow::from_toml(&workflow.to_string().unwrap()).unwrap();
        assert_eq!(restored.steps(), workflow.steps());
        assert_eq!(restored.safety_rules(), workflow.safety_rules());
        assert_eq!(
            restored.settings().resources_for(&restored.steps()[0]).memory_limit_mb,
            Some(512)
        );
    }
}
