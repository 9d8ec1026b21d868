//! モデルティアの選択とマッピング
//!
//! # 責務
//!
//! - ステップごとのモデルティア選択（[`select_tier`]）
//! - [`ModelTier`] と [`Provider`] の組み合わせから、実際のモデル名を解決
//!
//! # 選択規則
//!
//! 1. ステップに `model_tier` が明示されていればそれを使う
//! 2. 既定は安価な `light`
//! 3. プロンプトの推定トークン数が [`PROMOTION_TOKEN_THRESHOLD`] を超えるか、
//!    エージェント種別が編集系（[`EDIT_AGENT_KINDS`]）なら `medium` に昇格
//!
//! # モデル名
//!
//! プロバイダーごとに `[heavy, medium, light]` の順で [`MODEL_TABLE`] に定義しています。
//!
//! ```rust
//! use adw_supervisor::provider::model_tier::{resolve_model, select_tier};
//! use adw_supervisor::config::step::{ModelTier, Provider};
//!
//! assert_eq!(select_tier(None, "general", "短いプロンプト"), ModelTier::Light);
//! assert_eq!(select_tier(None, "refactor", "短いプロンプト"), ModelTier::Medium);
//! assert_eq!(select_tier(Some(ModelTier::Heavy), "general", "x"), ModelTier::Heavy);
//! assert_eq!(resolve_model(&Provider::Anthropic, &ModelTier::Medium), "claude-sonnet-4-5");
//! ```

use crate::config::step::{ModelTier, Provider};
use crate::detector::estimate_tokens;

/// この推定トークン数を超えるプロンプトは `medium` に昇格
pub const PROMOTION_TOKEN_THRESHOLD: usize = 4_000;

/// ファイルを書き換える（編集系の）エージェント種別
pub const EDIT_AGENT_KINDS: &[&str] = &["edit", "implement", "refactor", "fix", "write"];

/// プロバイダー → `[heavy, medium, light]` のモデル名
pub const MODEL_TABLE: &[(Provider, [&str; 3])] = &[
    (Provider::Anthropic, ["claude-opus-4", "claude-sonnet-4-5", "claude-haiku"]),
    (Provider::OpenAI, ["o1", "gpt-4o", "gpt-4o-mini"]),
];

/// ステップに使うモデルティアを選ぶ
pub fn select_tier(explicit: Option<ModelTier>, agent: &str, prompt: &str) -> ModelTier {
    if let Some(tier) = explicit {
        return tier;
    }
    let agent = agent.trim().to_ascii_lowercase();
    if EDIT_AGENT_KINDS.contains(&agent.as_str()) || estimate_tokens(prompt) > PROMOTION_TOKEN_THRESHOLD {
        ModelTier::Medium
    } else {
        ModelTier::Light
    }
}

/// モデルティアとプロバイダーから実際のモデル名を解決する
pub fn resolve_model(provider: &Provider, tier: &ModelTier) -> &'static str {
    let column = match tier {
        ModelTier::Heavy => 0,
        ModelTier::Medium => 1,
        ModelTier::Light => 2,
    };
    MODEL_TABLE
        .iter()
        .find(|(p, _)| p == provider)
        .map_or("", |(_, names)| names[column])
}
