//! ワークフローステップの定義
//!
//! # 責務
//!
//! Workflowを構成するStepの定義体を提供するモジュール
//! アプリケーションに対して、[WorkflowStep] を提供する。
//!
//! ステップは1回のエージェント起動に対応し、以下を持ちます。
//!
//! - 一意な `id` とプロンプトテンプレート（`${steps.ID.output}` 等の参照を含む）
//! - エージェント種別タグ（モデルティアの自動選択に使用）
//! - 出力先（[`OutputSpec`]）と実行条件（`when`）
//! - タイムアウト・リトライ・リソース上限の上書き
//! - ツールプロファイルと安全ポリシーの上書き

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::safety::PolicyOverride;
use crate::watchdog::profile::ToolProfile;
use super::dto::{OutputDto, WorkflowStepDto};

/// 既定のエージェント種別
pub const DEFAULT_AGENT: &str = "general";

/// ワークフローステップ（ドメインモデル）
///
/// ワークフロー内の1つの処理単位を表します。
/// 各ステップは、特定のプロバイダーとモデルを使用してタスクを実行します。
///
/// ## DTO との違い
///
/// - [`WorkflowStepDto`](super::dto::WorkflowStepDto): TOML デシリアライズ専用
/// - [`WorkflowStep`]: バリデーション済み、ドメインロジックを持つ
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    id: String,
    prompt: String,
    agent: String,
    provider: Provider,
    model_tier: Option<ModelTier>,
    output: Option<OutputSpec>,
    when: Option<String>,
    timeout_secs: Option<u64>,
    retries: Option<u32>,
    resources: ResourceOverrides,
    tool: Option<ToolProfile>,
    safety: Option<PolicyOverride>,
}

impl WorkflowStep {
    /// 最小構成のステップを生成する（主にテスト・プログラムからの組み立て用）
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            agent: DEFAULT_AGENT.to_string(),
            provider: Provider::default(),
            model_tier: None,
            output: None,
            when: None,
            timeout_secs: None,
            retries: None,
            resources: ResourceOverrides::default(),
            tool: None,
            safety: None,
        }
    }

    pub fn with_when(mut self, condition: impl Into<String>) -> Self {
        self.when = Some(condition.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_model_tier(mut self, tier: ModelTier) -> Self {
        self.model_tier = Some(tier);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_resources(mut self, resources: ResourceOverrides) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_tool(mut self, tool: ToolProfile) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_safety(mut self, safety: PolicyOverride) -> Self {
        self.safety = Some(safety);
        self
    }

    /// ステップID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// プロンプトテンプレート
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// エージェント種別タグ
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// 明示されたモデルティア
    pub fn model_tier(&self) -> Option<ModelTier> {
        self.model_tier
    }

    pub fn output(&self) -> Option<&OutputSpec> {
        self.output.as_ref()
    }

    /// 実行条件
    pub fn when(&self) -> Option<&str> {
        self.when.as_deref()
    }

    /// ステップ固有のタイムアウト
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// ステップ固有のリトライ回数
    pub fn retries(&self) -> Option<u32> {
        self.retries
    }

    pub fn resources(&self) -> &ResourceOverrides {
        &self.resources
    }

    pub fn tool(&self) -> Option<&ToolProfile> {
        self.tool.as_ref()
    }

    pub fn safety(&self) -> Option<&PolicyOverride> {
        self.safety.as_ref()
    }
}

/// モデルのティア（Heavy/Medium/Light）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// 複雑な推論タスク用（例: Claude Opus, GPT-4o）
    Heavy,
    /// 一般的なタスク用（例: Claude Sonnet, GPT-4）
    Medium,
    /// 簡単なタスク用（例: Claude Haiku, GPT-3.5）
    Light,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Heavy => "heavy",
            ModelTier::Medium => "medium",
            ModelTier::Light => "light",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AI プロバイダー
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Anthropic (Claude Code)
    #[default]
    Anthropic,
    /// OpenAI (Codex)
    OpenAI,
}

/// ステップ出力の保存先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// 変数マップに `name` で格納
    Variable { name: String },
    /// 単一ファイルに書き出す
    File { path: PathBuf },
    /// `{ "相対パス": "内容" }` 形式の出力を複数ファイルとして書き出す
    Files { dir: PathBuf },
}

impl OutputSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            OutputSpec::Variable { .. } => "variable",
            OutputSpec::File { .. } => "file",
            OutputSpec::Files { .. } => "files",
        }
    }
}

/// リソース上限の上書き
///
/// ステップ単位の値 → ワークフロー全体の値 → 既定値 の順で解決されます。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_warn_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_high_resource_readings: Option<u32>,
}

impl ResourceOverrides {
    /// `self` の値を優先し、未設定の項目を `fallback` で補う
    pub fn or(&self, fallback: &ResourceOverrides) -> ResourceOverrides {
        ResourceOverrides {
            memory_limit_mb: self.memory_limit_mb.or(fallback.memory_limit_mb),
            cpu_warn_percent: self.cpu_warn_percent.or(fallback.cpu_warn_percent),
            check_interval_ms: self.check_interval_ms.or(fallback.check_interval_ms),
            max_high_resource_readings: self
                .max_high_resource_readings
                .or(fallback.max_high_resource_readings),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ResourceOverrides::default()
    }
}

/// ステップIDが英数字・`_`・`-` だけで構成されているか検査する
///
/// IDは実行ディレクトリ内のファイル名にも使われます。
pub(crate) fn validate_step_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() {
        return Err(ConfigError::Validation("ステップIDが空です".to_string()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ConfigError::Validation(format!(
            "ステップID '{id}' に使用できない文字が含まれています（英数字・_・- のみ）"
        )));
    }
    Ok(())
}

/// DTO からドメインモデルへの変換（読み込み方向）
///
/// バリデーションを実施し、不正なデータの場合は [`ConfigError::Validation`] を返します。
impl TryFrom<WorkflowStepDto> for WorkflowStep {
    type Error = ConfigError;

    fn try_from(dto: WorkflowStepDto) -> Result<Self, Self::Error> {
        let id = dto.id.trim().to_string();
        validate_step_id(&id)?;
        if dto.prompt.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "ステップ '{id}' のプロンプトが空です"
            )));
        }

        let output = dto
            .output
            .map(|output| output_from_dto(&id, output))
            .transpose()?;

        if let Some(when) = &dto.when
            && when.trim().is_empty()
        {
            return Err(ConfigError::Validation(format!(
                "ステップ '{id}' の when 条件が空です"
            )));
        }
        if dto.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(format!(
                "ステップ '{id}' の timeout_secs は 1 以上である必要があります"
            )));
        }
        let resources = dto.resources.unwrap_or_default();
        validate_resources(&resources, &format!("ステップ '{id}'"))?;

        Ok(Self {
            id,
            prompt: dto.prompt,
            agent: dto
                .agent
                .filter(|agent| !agent.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            provider: dto.provider.unwrap_or_default(),
            model_tier: dto.model_tier,
            output,
            when: dto.when,
            timeout_secs: dto.timeout_secs,
            retries: dto.retries,
            resources,
            tool: dto.tool,
            safety: dto.safety,
        })
    }
}

/// ドメインモデルから DTO への変換（書き込み方向）
///
/// バリデーション済みのドメインモデルから DTO を生成するため、
/// この変換は失敗しません（`From` トレイトを使用）。
impl From<WorkflowStep> for WorkflowStepDto {
    fn from(step: WorkflowStep) -> Self {
        Self {
            id: step.id,
            prompt: step.prompt,
            agent: Some(step.agent),
            provider: Some(step.provider),
            model_tier: step.model_tier,
            output: step.output.map(OutputDto::from),
            when: step.when,
            timeout_secs: step.timeout_secs,
            retries: step.retries,
            resources: (!step.resources.is_empty()).then_some(step.resources),
            tool: step.tool,
            safety: step.safety,
        }
    }
}

impl From<OutputSpec> for OutputDto {
    fn from(output: OutputSpec) -> Self {
        let kind = output.kind().to_string();
        match output {
            OutputSpec::Variable { name } => OutputDto {
                kind,
                name: Some(name),
                path: None,
                dir: None,
            },
            OutputSpec::File { path } => OutputDto {
                kind,
                name: None,
                path: Some(path),
                dir: None,
            },
            OutputSpec::Files { dir } => OutputDto {
                kind,
                name: None,
                path: None,
                dir: Some(dir),
            },
        }
    }
}

fn output_from_dto(step_id: &str, dto: OutputDto) -> Result<OutputSpec, ConfigError> {
    let missing = |field: &str| {
        ConfigError::Validation(format!(
            "ステップ '{step_id}' の {} 出力には {field} が必要です",
            dto.kind
        ))
    };
    match dto.kind.as_str() {
        "variable" => {
            let name = dto
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| missing("name"))?;
            Ok(OutputSpec::Variable { name })
        }
        "file" => {
            let path = dto.path.clone().ok_or_else(|| missing("path"))?;
            Ok(OutputSpec::File { path })
        }
        "files" => {
            let dir = dto.dir.clone().ok_or_else(|| missing("dir"))?;
            Ok(OutputSpec::Files { dir })
        }
        other => Err(ConfigError::Validation(format!(
            "ステップ '{step_id}' の出力種別 '{other}' は不明です（variable / file / files）"
        ))),
    }
}

/// リソース上限の値域チェック
pub(super) fn validate_resources(resources: &ResourceOverrides, owner: &str) -> Result<(), ConfigError> {
    if resources.memory_limit_mb == Some(0) {
        return Err(ConfigError::Validation(format!(
            "{owner} の memory_limit_mb は 1 以上である必要があります"
        )));
    }
    if let Some(cpu) = resources.cpu_warn_percent
        && !(cpu.is_finite() && cpu > 0.0)
    {
        return Err(ConfigError::Validation(format!(
            "{owner} の cpu_warn_percent は正の数である必要があります"
        )));
    }
    if resources.check_interval_ms == Some(0) {
        return Err(ConfigError::Validation(format!(
            "{owner} の check_interval_ms は 1 以上である必要があります"
        )));
    }
    if resources.max_high_resource_readings == Some(0) {
        return Err(ConfigError::Validation(format!(
            "{owner} の max_high_resource_readings は 1 以上である必要があります"
        )));
    }
    Ok(())
}
