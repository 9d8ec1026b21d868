//! リソースウォッチドッグ
//!
//! # 責務
//!
//! 起動したエージェントプロセス（とその子孫）のメモリ・CPU・出力量を監視し、
//! 上限超過や暴走が確認された場合にプロセスツリーを強制終了します。
//!
//! # モジュール構成
//!
//! - [`metrics`][]: OSのプロセス計測とシグナル送信（`sysinfo`）
//! - [`profile`][]: ツールプロファイルによる上限の自動調整
//! - [`alert`][]: アラート型と JSONL ログ
//! - [`monitor`][]: 監視ループと判定ロジック

pub mod metrics;
pub mod profile;
pub mod alert;
pub mod monitor;

// 公開APIの再エクスポート
pub use alert::{AlertKind, AlertLog, ResourceAlert};
pub use metrics::{
    default_metrics_provider, default_process_controller, ProcessController, ProcessMetricsProvider,
    ProcessSample,
};
pub use monitor::{KillSwitch, OutputMeter, ResourceWatchdog, Verdict, WatchdogConfig, WatchdogReport};
pub use profile::{DeploymentScope, ToolProfile};
