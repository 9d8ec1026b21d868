//! ワークフロー定義（TOML）
//!
//! - [`dto`][]: TOML 構造そのままの生データ（モジュール内部専用）
//! - [`step`][]: ステップのドメインモデル
//! - [`workflow`][]: ワークフローのドメインモデルと構造検証

mod dto;
pub mod step;
pub mod workflow;

pub use step::{ModelTier, OutputSpec, Provider, ResourceOverrides, WorkflowStep};
pub use workflow::{Workflow, WorkflowSettings};
