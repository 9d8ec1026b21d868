//! リソースアラートと永続ログ
//!
//! アラートは発生順に追記され、1行1レコードの JSONL として実行ディレクトリに保存されます。
//! プロセスがクラッシュしても、それまでのアラートは [`AlertLog::load`] で再読み込みできます。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::PersistenceError;

/// アラート種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// メモリ上限超過またはメモリリーク
    Memory,
    /// CPU使用率の高止まり
    Cpu,
    /// 出力の暴走・ループ等による強制停止
    ProcessKilled,
}

/// リソースアラート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub step_id: String,
    pub kind: AlertKind,
    /// 観測値
    pub value: f64,
    /// 上限値
    pub limit: f64,
    /// 単位（`MB`, `%`, `bytes/s` 等）
    pub unit: String,
    pub message: String,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
}

impl ResourceAlert {
    pub fn new(
        step_id: impl Into<String>,
        kind: AlertKind,
        value: f64,
        limit: f64,
        unit: impl Into<String>,
        message: impl Into<String>,
        pid: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            value,
            limit,
            unit: unit.into(),
            message: message.into(),
            pid,
            timestamp: Utc::now(),
        }
    }
}

/// 追記専用のアラートログ（JSONL）
#[derive(Debug, Clone)]
pub struct AlertLog {
    path: PathBuf,
}

impl AlertLog {
    pub const FILE_NAME: &'static str = "alerts.jsonl";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 実行ディレクトリ直下の `alerts.jsonl`
    pub fn in_dir(run_dir: impl AsRef<Path>) -> Self {
        Self::new(run_dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// アラートを1行追記する
    pub async fn append(&self, alert: &ResourceAlert) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(alert)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 保存済みのアラートを読み込む
    ///
    /// ファイルが無ければ空、書き込み途中で壊れた行は読み飛ばします。
    pub async fn load(&self) -> Result<Vec<ResourceAlert>, PersistenceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut alerts = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(alert) => alerts.push(alert),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = number + 1,
                    error = %e,
                    "壊れたアラート行を読み飛ばしました"
                ),
            }
        }
        Ok(alerts)
    }
}
