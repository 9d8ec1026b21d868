//! 参照の解決とプロンプトへの埋め込み
//!
//! # 責務
//!
//! - [`VariableReference`] を実行コンテキストに対して解決（[`resolve_reference`]）
//! - プロンプト中の参照をすべて文字列化した値に置換（[`resolve_prompt`]）
//!
//! # 解決順序（`steps.S[.F[.P...]]`）
//!
//! 1. `S` がスキップ済み → [`ReferenceError::SkippedStepReference`]
//! 2. `S` の結果がまだ無い → [`ReferenceError::ForwardReference`]
//! 3. `S` が失敗している → [`ReferenceError::StepExecutionFailure`]
//! 4. `F` が `output` 以外で変数マップに無い → [`ReferenceError::VariableNotFound`]
//! 5. 残りのパスを辿る途中で null や欠落キーに当たる → [`ReferenceError::MissingProperty`]

use serde_json::Value;

use crate::error::ReferenceError;
use super::reference::{find_references, ReferenceRoot, VariableReference, DEFAULT_FIELD};

/// ステップ参照の検索結果
#[derive(Debug, Clone, PartialEq)]
pub enum StepLookup {
    /// 条件によりスキップされた
    Skipped,
    /// まだ結果が記録されていない
    NotExecuted,
    /// 実行されたが失敗した
    Failed,
    /// 成功した（出力値）
    Succeeded(Value),
}

/// 参照の解決元
///
/// [`ExecutionContext`](crate::engine::ExecutionContext) が実装します。
pub trait ReferenceScope {
    /// ステップIDから実行状態と出力を検索
    fn lookup_step(&self, step_id: &str) -> StepLookup;

    /// 変数マップから値を取得
    fn variable(&self, name: &str) -> Option<&Value>;
}

/// 参照を値に解決する
pub fn resolve_reference<S>(scope: &S, reference: &VariableReference) -> Result<Value, ReferenceError>
where
    S: ReferenceScope + ?Sized,
{
    let expression = reference.expression();

    match reference.root() {
        ReferenceRoot::Steps => {
            let step_id = reference.step_id().unwrap_or_default();
            let output = match scope.lookup_step(step_id) {
                StepLookup::Skipped => {
                    return Err(ReferenceError::SkippedStepReference {
                        reference: expression.to_string(),
                        step_id: step_id.to_string(),
                    });
                }
                StepLookup::NotExecuted => {
                    return Err(ReferenceError::ForwardReference {
                        reference: expression.to_string(),
                        step_id: step_id.to_string(),
                    });
                }
                StepLookup::Failed => {
                    return Err(ReferenceError::StepExecutionFailure {
                        reference: expression.to_string(),
                        step_id: step_id.to_string(),
                    });
                }
                StepLookup::Succeeded(output) => output,
            };

            let field = reference.field().unwrap_or(DEFAULT_FIELD);
            let base = if field == DEFAULT_FIELD {
                output
            } else {
                scope
                    .variable(field)
                    .cloned()
                    .ok_or_else(|| ReferenceError::VariableNotFound {
                        reference: expression.to_string(),
                        name: field.to_string(),
                    })?
            };
            traverse(base, reference.path(), expression)
        }
        ReferenceRoot::Variables => {
            let name = reference.field().unwrap_or_default();
            let base = scope
                .variable(name)
                .cloned()
                .ok_or_else(|| ReferenceError::VariableNotFound {
                    reference: expression.to_string(),
                    name: name.to_string(),
                })?;
            traverse(base, reference.path(), expression)
        }
    }
}

/// プロンプト中の参照をすべて解決して置換する
///
/// 最初に失敗した参照のエラーを返します。
pub fn resolve_prompt<S>(scope: &S, template: &str) -> Result<String, ReferenceError>
where
    S: ReferenceScope + ?Sized,
{
    let mut resolved = String::with_capacity(template.len());
    let mut cursor = 0;

    for found in find_references(template) {
        let reference = found.reference?;
        let value = resolve_reference(scope, &reference)?;
        resolved.push_str(&template[cursor..found.range.start]);
        resolved.push_str(&stringify(&value));
        cursor = found.range.end;
    }
    resolved.push_str(&template[cursor..]);

    Ok(resolved)
}

/// 値をプロンプト埋め込み用の文字列に変換
///
/// 文字列はそのまま、`null` は `null`、オブジェクト/配列は正規化された JSON テキストになります。
/// `serde_json` のオブジェクトはキー順が固定されるため、同じ値は常に同じテキストになります。
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// プロパティパスを辿る
pub fn traverse(value: Value, path: &[String], reference: &str) -> Result<Value, ReferenceError> {
    let mut current = value;
    for segment in path {
        let missing = || ReferenceError::MissingProperty {
            reference: reference.to_string(),
            property: segment.clone(),
        };
        current = match current {
            Value::Object(mut map) => map.remove(segment.as_str()).ok_or_else(missing)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().map_err(|_| missing())?;
                if index >= items.len() {
                    return Err(missing());
                }
                items.swap_remove(index)
            }
            _ => return Err(missing()),
        };
    }
    Ok(current)
}
