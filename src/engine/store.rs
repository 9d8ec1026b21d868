//! 実行記録の永続化
//!
//! # 責務
//!
//! - 実行ごとのディレクトリ `<run-dir>/<run-id>/` の管理
//! - ステップ完了ごとの追記（`results.jsonl` / `skipped.jsonl`）とコンテキストのスナップショット
//! - ステップ出力と監査用メタデータ（`outputs/<step>.{json,txt}` / `<step>.meta.json`）
//! - 出力先指定（`file` / `files`）への書き出し
//! - 事後調査のための再読み込み
//!
//! # ディレクトリ構成
//!
//! ```text
//! <run-dir>/<run-id>/
//! ├── results.jsonl
//! ├── skipped.jsonl
//! ├── alerts.jsonl
//! ├── context.json
//! ├── report.json
//! └── outputs/
//!     ├── plan.json
//!     └── plan.meta.json
//! ```

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::step::OutputSpec;
use crate::error::PersistenceError;
use crate::watchdog::AlertLog;
use super::context::ExecutionContext;
use super::result::{ExecutionReport, SkippedStepRecord, StepResult};
use super::step_executor::StepAudit;

const RESULTS_FILE: &str = "results.jsonl";
const SKIPPED_FILE: &str = "skipped.jsonl";
const CONTEXT_FILE: &str = "context.json";
const REPORT_FILE: &str = "report.json";
const OUTPUTS_DIR: &str = "outputs";

/// 1回の実行の記録先
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    /// `<base>/<run_id>/` を作成して開く
    pub async fn create(base: impl AsRef<Path>, run_id: &str) -> Result<Self, PersistenceError> {
        let dir = base.as_ref().join(run_id);
        tokio::fs::create_dir_all(dir.join(OUTPUTS_DIR)).await?;
        debug!(dir = %dir.display(), "実行ディレクトリを作成しました");
        Ok(Self { dir })
    }

    /// 既存の実行ディレクトリを開く（読み込み用）
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn alert_log(&self) -> AlertLog {
        AlertLog::in_dir(&self.dir)
    }

    pub async fn append_result(&self, result: &StepResult) -> Result<(), PersistenceError> {
        append_line(&self.dir.join(RESULTS_FILE), result).await
    }

    pub async fn append_skip(&self, record: &SkippedStepRecord) -> Result<(), PersistenceError> {
        append_line(&self.dir.join(SKIPPED_FILE), record).await
    }

    /// コンテキストのスナップショットを書き出す（一時ファイル経由で置き換え）
    pub async fn write_context(&self, context: &ExecutionContext) -> Result<(), PersistenceError> {
        write_atomic(&self.dir.join(CONTEXT_FILE), &serde_json::to_vec_pretty(context)?).await
    }

    pub async fn write_report(&self, report: &ExecutionReport) -> Result<(), PersistenceError> {
        write_atomic(&self.dir.join(REPORT_FILE), report.to_json()?.as_bytes()).await
    }

    /// ステップ出力と監査メタデータを書き出す
    ///
    /// 構造化できた出力は `<step>.json`、それ以外は `<step>.txt` になります。
    pub async fn write_output(&self, result: &StepResult, audit: &StepAudit) -> Result<PathBuf, PersistenceError> {
        let outputs = self.dir.join(OUTPUTS_DIR);
        let path = match &result.parsed_output {
            Some(parsed) => {
                let path = outputs.join(format!("{}.json", result.step_id));
                tokio::fs::write(&path, serde_json::to_vec_pretty(parsed)?).await?;
                path
            }
            None => {
                let path = outputs.join(format!("{}.txt", result.step_id));
                tokio::fs::write(&path, result.output.as_bytes()).await?;
                path
            }
        };
        let meta = outputs.join(format!("{}.meta.json", result.step_id));
        tokio::fs::write(&meta, serde_json::to_vec_pretty(audit)?).await?;
        Ok(path)
    }

    /// 保存済みのステップ結果を読み込む
    ///
    /// ファイルが無ければ空、壊れた行は読み飛ばします。
    pub async fn load_results(&self) -> Result<Vec<StepResult>, PersistenceError> {
        let path = self.dir.join(RESULTS_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(result) => results.push(result),
                Err(e) => warn!(
                    path = %path.display(),
                    line = number + 1,
                    error = %e,
                    "壊れた結果行を読み飛ばしました"
                ),
            }
        }
        Ok(results)
    }
}

/// 出力先指定（`file` / `files`）に従って書き出す
///
/// 相対パスは `base` からの相対として扱います。`variable` は何もしません。
/// `files` の出力は `{ "相対パス": "内容" }` のオブジェクトである必要があります。
pub async fn write_destination(
    spec: &OutputSpec,
    result: &StepResult,
    base: &Path,
) -> Result<Vec<PathBuf>, PersistenceError> {
    match spec {
        OutputSpec::Variable { .. } => Ok(Vec::new()),
        OutputSpec::File { path } => {
            let target = base.join(path);
            write_file(&target, result.output.as_bytes()).await?;
            Ok(vec![target])
        }
        OutputSpec::Files { dir } => {
            let Some(Value::Object(files)) = &result.parsed_output else {
                return Err(PersistenceError::InvalidFilesOutput(result.step_id.clone()));
            };
            // 1件でも外を指していれば何も書き出さない
            if let Some(escaping) = files.keys().find(|relative| !is_contained(Path::new(relative.as_str()))) {
                return Err(PersistenceError::InvalidFilesOutput(escaping.clone()));
            }
            let root = base.join(dir);
            let mut written = Vec::with_capacity(files.len());
            for (relative, content) in files {
                let target = root.join(relative);
                let bytes = match content {
                    Value::String(text) => text.clone().into_bytes(),
                    other => serde_json::to_vec_pretty(other)?,
                };
                write_file(&target, &bytes).await?;
                written.push(target);
            }
            Ok(written)
        }
    }
}

/// 出力ディレクトリの外を指していないか
fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<(), PersistenceError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn result(step_id: &str, output: &str) -> StepResult {
        let parsed = serde_json::from_str(output).ok();
        StepResult::succeeded(step_id, output.to_string(), parsed, Duration::from_millis(3))
    }

    #[tokio::test]
    async fn test_results_round_trip_through_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::create(dir.path(), "run-1").await.unwrap();

        store.append_result(&result("a", "{\"ok\":true}")).await.unwrap();
        store.append_result(&StepResult::failed("b", "boom", Duration::ZERO)).await.unwrap();

        let loaded = RunStore::open(dir.path().join("run-1")).load_results().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].parsed_output, Some(json!({"ok": true})));
        assert!(!loaded[1].is_success());
    }

    #[tokio::test]
    async fn test_load_results_skips_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::create(dir.path(), "run-1").await.unwrap();
        store.append_result(&result("a", "x")).await.unwrap();
        tokio::fs::write(
            store.dir().join(RESULTS_FILE),
            format!(
                "{}\n{{\"step_id\":\"b\",\"sta",
                serde_json::to_string(&result("a", "x")).unwrap()
            ),
        )
        .await
        .unwrap();

        let loaded = store.load_results().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_context_snapshot_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::create(dir.path(), "run-1").await.unwrap();
        let mut ctx = ExecutionContext::new("run-1", "w");
        store.write_context(&ctx).await.unwrap();
        ctx.record_result(result("a", "x"));
        store.write_context(&ctx).await.unwrap();

        let snapshot: Value =
            serde_json::from_slice(&tokio::fs::read(store.dir().join(CONTEXT_FILE)).await.unwrap()).unwrap();
        assert_eq!(snapshot["results"].as_array().unwrap().len(), 1);
        assert!(!store.dir().join("context.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_destination_file_and_files() {
        let dir = tempfile::tempdir().unwrap();

        let file = OutputSpec::File {
            path: PathBuf::from("docs/review.md"),
        };
        let written = write_destination(&file, &result("r", "# Review"), dir.path()).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&written[0]).await.unwrap(), "# Review");

        let files = OutputSpec::Files {
            dir: PathBuf::from("gen"),
        };
        let output = result("g", "{\"src/a.rs\": \"fn a() {}\", \"b.json\": {\"k\": 1}}");
        let written = write_destination(&files, &output, dir.path()).await.unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("gen/src/a.rs")).await.unwrap(),
            "fn a() {}"
        );
    }

    #[tokio::test]
    async fn test_write_destination_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let files = OutputSpec::Files {
            dir: PathBuf::from("gen"),
        };
        let escaping = result("g", "{\"../evil.sh\": \"rm\"}");
        assert!(matches!(
            write_destination(&files, &escaping, dir.path()).await,
            Err(PersistenceError::InvalidFilesOutput(_))
        ));

        // 外を指すパスが後ろにあっても、手前のファイルは書き出されない
        let mixed = result("g", "{\"a.rs\": \"ok\", \"z/../../evil\": \"x\"}");
        match write_destination(&files, &mixed, dir.path()).await {
            Err(PersistenceError::InvalidFilesOutput(path)) => assert_eq!(path, "z/../../evil"),
            other => panic!("InvalidFilesOutput を期待しましたが {other:?} でした"),
        }
        assert!(!dir.path().join("gen/a.rs").exists());
        assert!(!dir.path().join("evil").exists());

        let not_object = result("g", "plain text");
        assert!(matches!(
            write_destination(&files, &not_object, dir.path()).await,
            Err(PersistenceError::InvalidFilesOutput(_))
        ));
    }
}
