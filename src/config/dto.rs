//! TOML デシリアライズ用の DTO (Data Transfer Object)
//!
//! # 責務
//!
//! このモジュールは、TOML ファイルからのデータ読み込み専用の構造体を提供します。
//! DTO はバリデーション前の「生データ」を表現し、ドメインモデルとは分離されています。
//!
//! ## 変換フロー
//!
//! ```text
//! TOML ファイル
//!   ↓ (デシリアライズ)
//! WorkflowDto
//!   ↓ (TryFrom でバリデーション)
//! Workflow (ドメインモデル)
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::safety::{PolicyOverride, SafetyRuleConfig};
use crate::watchdog::profile::ToolProfile;
use super::step::{ModelTier, Provider, ResourceOverrides};

/// ワークフロー DTO
///
/// TOML の `[workflow]` / `[variables]` / `[safety]` セクションと `[[steps]]` 配列を
/// デシリアライズ/シリアライズします。
///
/// **注**: この構造体は config モジュール内部の実装詳細です。
/// 外部からは [`Workflow`](super::workflow::Workflow) を使用してください。
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct WorkflowDto {
    /// ワークフローのメタデータ
    pub(super) workflow: WorkflowMetadataDto,
    /// 初期変数
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(super) variables: BTreeMap<String, Value>,
    /// 安全ルール
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) safety: Option<SafetyDto>,
    /// ステップの配列
    #[serde(default)]
    pub(super) steps: Vec<WorkflowStepDto>,
}

/// ワークフローメタデータ DTO
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct WorkflowMetadataDto {
    pub(super) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) default_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) default_retries: Option<u32>,
    #[serde(default)]
    pub(super) fail_fast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) context_max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "ResourceOverrides::is_empty")]
    pub(super) resources: ResourceOverrides,
}

/// `[safety]` セクション DTO
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SafetyDto {
    #[serde(default)]
    pub(super) rules: Vec<SafetyRuleConfig>,
}

/// ワークフローステップ DTO
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct WorkflowStepDto {
    pub(super) id: String,
    pub(super) prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) model_tier: Option<ModelTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) output: Option<OutputDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) resources: Option<ResourceOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) tool: Option<ToolProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) safety: Option<PolicyOverride>,
}

/// 出力先 DTO（`{ type = "variable", name = ".." }` 等）
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct OutputDto {
    #[serde(rename = "type")]
    pub(super) kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) dir: Option<PathBuf>,
}
