//! ADW Supervisor
//!
//! 宣言的に定義したマルチステップのエージェントワークフローを、
//! プロセスのリソース監視付きで安全に実行するエンジンです。
//!
//! # モジュール構成
//!
//! - [`config`][]: TOML ワークフロー定義の読み込みと検証
//! - [`expression`][]: `${...}` 参照の解決・`when` 条件式・依存関係グラフ
//! - [`watchdog`][]: エージェントプロセスのリソース監視と強制停止
//! - [`detector`][]: ループ検出とコンテキスト上限の監視
//! - [`provider`][]: エージェントCLI（Claude Code / Codex）の起動
//! - [`safety`][]: 出力の安全チェックと承認ゲート
//! - [`engine`][]: ステップ実行とワークフロー実行
//! - [`logging`][]: ログ出力の初期化
//! - [`error`][]: エラー型

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod expression;
pub mod logging;
pub mod provider;
pub mod safety;
pub mod watchdog;
