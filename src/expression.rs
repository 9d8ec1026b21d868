//! 参照式と条件式
//!
//! # 責務
//!
//! - プロンプト中の `${steps.ID.FIELD.PATH}` / `${variables.NAME.PATH}` 参照の解析と解決
//! - `when` 条件式（比較・論理演算・メソッド呼び出し）の評価
//! - 実行前の静的な依存関係検査（前方参照・循環の拒否）
//!
//! # モジュール構成
//!
//! - [`reference`][]: 参照パターンの検出と解析
//! - [`resolver`][]: 実行コンテキストに対する参照の解決
//! - [`condition`][]: 条件式の字句解析・構文解析・評価
//! - [`dependency`][]: ステップ依存関係グラフ

pub mod reference;
pub mod resolver;
pub mod condition;
pub mod dependency;

// 公開APIの再エクスポート
pub use reference::{find_references, ReferenceRoot, VariableReference};
pub use resolver::{resolve_prompt, resolve_reference, stringify, ReferenceScope, StepLookup};
pub use condition::{evaluate, ConditionEvaluation};
pub use dependency::DependencyGraph;
