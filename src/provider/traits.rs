//! エージェントプロバイダーの共通インターフェース定義
//!
//! # 責務
//!
//! - エージェント起動の共通トレイト [`ProviderClient`] を定義
//! - 起動要求 [`AgentRequest`] とプロバイダー非依存のレスポンス型 [`ProviderResponse`] を提供
//! - プロバイダー生成の差し替え口 [`ProviderFactory`] を定義
//!
//! # 実装方式
//!
//! このモジュールは **CLIツール呼び出しベース** で設計されています。
//! - Anthropic: `claude` コマンド（Claude Code CLI）
//! - OpenAI: `codex` コマンド（Codex CLI）
//!
//! どちらも [`ProcessSupervisor`](super::process::ProcessSupervisor) を通じて
//! リソース監視下で起動されます。テストではモックの [`ProviderClient`] を
//! [`ProviderFactory`] 経由で注入します。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::step::{ModelTier, Provider};
use crate::error::ProviderError;
use crate::watchdog::{AlertLog, WatchdogConfig};

/// エージェント起動要求
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// 起動元のステップID（ログ・アラート用）
    pub step_id: String,
    /// 解決済みのプロンプト
    pub prompt: String,
    /// 使用するモデルティア
    pub model_tier: ModelTier,
    /// エージェント種別タグ
    pub agent: String,
    /// 作業ディレクトリ
    pub workdir: Option<PathBuf>,
    /// リソース監視設定
    pub watchdog: WatchdogConfig,
    /// アラートの書き出し先
    pub alert_log: Option<AlertLog>,
}

impl AgentRequest {
    pub fn new(step_id: impl Into<String>, prompt: impl Into<String>, model_tier: ModelTier) -> Self {
        Self {
            step_id: step_id.into(),
            prompt: prompt.into(),
            model_tier,
            agent: crate::config::step::DEFAULT_AGENT.to_string(),
            workdir: None,
            watchdog: WatchdogConfig::default(),
            alert_log: None,
        }
    }
}

/// エージェントプロバイダーの共通インターフェース
///
/// このトレイトを実装することで、任意のエージェントを
/// アプリケーションに統合できます。
///
/// # 実装要件
///
/// - `Send + Sync`: マルチスレッド環境で安全に使用可能
/// - 非同期実行対応（`async_trait`を使用）
/// - 返された Future が途中で破棄された場合、起動したプロセスを停止すること
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// エージェントにプロンプトを実行させ、レスポンスを取得する
    ///
    /// # エラー
    ///
    /// - [`ProviderError::CliNotFound`] - CLIツールが未インストール
    /// - [`ProviderError::AuthenticationError`] - 認証失敗（ログインが必要）
    /// - [`ProviderError::NonZeroExit`] - 異常終了
    /// - [`ProviderError::RateLimitExceeded`] - レート制限超過
    /// - [`ProviderError::ResourceLimit`] - リソース監視による強制終了
    /// - [`ProviderError::InvalidResponse`] - 不正なレスポンス
    async fn execute(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError>;
}

/// プロバイダークライアントの生成
pub trait ProviderFactory: Send + Sync {
    fn create(&self, provider: Provider) -> Result<Arc<dyn ProviderClient>, ProviderError>;
}

/// エージェントからのレスポンス
///
/// プロバイダー固有のレスポンス形式（CLI出力）を共通の型に変換したもの。
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// エージェントが生成したテキスト
    pub content: String,

    /// トークン使用量（CLIが報告した場合）
    pub token_usage: Option<TokenUsage>,

    /// 生成停止理由
    pub stop_reason: StopReason,

    /// 使用されたモデル名（例: "claude-sonnet-4-5", "gpt-4o"）
    pub model: String,

    /// 監視情報（実プロセスを起動した場合）
    pub process: Option<ProcessStats>,
}

/// 監視したプロセスの統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub peak_memory_mb: f64,
    pub tool_calls: usize,
}

/// トークン使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    /// 入力トークン数（プロンプト）
    pub input_tokens: u32,

    /// 出力トークン数（LLM生成テキスト）
    pub output_tokens: u32,
}

impl TokenUsage {
    /// 総トークン数を計算
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// 生成停止理由
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopReason {
    /// 自然な終了（LLMが完了を判断）
    EndTurn,

    /// 最大トークン数到達
    MaxTokens,

    /// 停止シーケンス検出
    StopSequence,

    /// コンテンツフィルター発動
    ContentFilter,

    /// 不明な理由
    #[default]
    Unknown,
}

impl StopReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "end_turn" | "success" => StopReason::EndTurn,
            "max_tokens" | "error_max_turns" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "content_filter" => StopReason::ContentFilter,
            _ => StopReason::Unknown,
        }
    }
}
