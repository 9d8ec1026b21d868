//! エージェントプロバイダー抽象化レイヤー（CLI版）
//!
//! # 責務
//!
//! - 複数のエージェントCLI（Claude Code, Codex）を統一的に扱うインターフェースを提供
//! - プロバイダーの種類に応じた適切なクライアントを生成するファクトリー機能
//! - モデルティアの選択と、ティアから実際のモデル名へのマッピング
//! - 起動したプロセスのリソース監視・ループ検出・中断時の停止
//!
//! # アーキテクチャ
//!
//! このモジュールは **CLIツール呼び出しベース** で設計されています。
//! APIキーの管理や認証はCLIツールに委譲し、コード内では扱いません。
//!
//! ## 使用するCLIツール
//!
//! - **Anthropic**: `claude` コマンド（Claude Code CLI）
//!   - インストール: `npm install -g @anthropic-ai/claude-code`
//! - **OpenAI**: `codex` コマンド（Codex CLI）
//!   - インストール: `npm install -g @openai/codex`
//!
//! # モジュール構成
//!
//! - `traits` - 共通インターフェース（[`ProviderClient`] / [`ProviderFactory`] 等）
//! - `model_tier` - モデルティアの選択とマッピング
//! - `process` - 監視付きのプロセス起動
//! - `anthropic` - Claude Code CLI クライアント
//! - `openai` - Codex CLI クライアント
//!
//! # 使用例
//!
//! ```rust,no_run
//! use adw_supervisor::provider::{CliProviderFactory, ProviderFactory, AgentRequest};
//! use adw_supervisor::config::step::{ModelTier, Provider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CliProviderFactory::default().create(Provider::Anthropic)?;
//!     let request = AgentRequest::new("hello", "Explain Rust ownership in one sentence.", ModelTier::Light);
//!     let response = client.execute(&request).await?;
//!     println!("Response: {}", response.content);
//!     Ok(())
//! }
//! ```

pub mod traits;
pub mod model_tier;
pub mod process;
pub mod anthropic;
pub mod openai;

use std::sync::Arc;

// 公開APIの再エクスポート
pub use process::ProcessSupervisor;
pub use traits::{
    AgentRequest, ProcessStats, ProviderClient, ProviderFactory, ProviderResponse, StopReason, TokenUsage,
};

use crate::config::step::Provider;
use crate::error::ProviderError;

/// CLIベースのクライアントを生成するファクトリー
///
/// # 認証について
///
/// APIキーは扱いません。認証は環境変数（`ANTHROPIC_API_KEY` / `OPENAI_API_KEY`）
/// またはCLIツールの事前ログインに委譲されます。
/// 認証エラーは実行時に [`ProviderError::AuthenticationError`] として返されます。
#[derive(Clone, Default)]
pub struct CliProviderFactory {
    supervisor: ProcessSupervisor,
}

impl CliProviderFactory {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }
}

impl ProviderFactory for CliProviderFactory {
    fn create(&self, provider: Provider) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        match provider {
            Provider::Anthropic => Ok(Arc::new(anthropic::AnthropicClient::new(self.supervisor.clone()))),
            Provider::OpenAI => Ok(Arc::new(openai::OpenAIClient::new(self.supervisor.clone()))),
        }
    }
}
