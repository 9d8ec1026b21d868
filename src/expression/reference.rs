//! `${steps.STEP_ID[.FIELD[.PATH...]]}` 参照パターンの解析
//!
//! # 責務
//!
//! - プロンプト文字列中の参照パターンの検出（[`find_references`]）
//! - 参照式をルートとパスセグメントに分解（[`VariableReference`]）
//!
//! [`VariableReference`] は解決のたびに再構築される一時的な値で、保存されません。
//!
//! # 構文
//!
//! ```text
//! ${steps.plan}                  -> steps / ["plan"]（フィールド省略時は output）
//! ${steps.plan.output.items[0]}  -> steps / ["plan", "output", "items", "0"]
//! ${variables.target.path}       -> variables / ["target", "path"]
//! ```
//!
//! ルートが `steps` / `variables` 以外の `${...}` はプロンプト中にそのまま残されます。

use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ReferenceError;

/// フィールド省略時に参照されるステップ出力フィールド
pub const DEFAULT_FIELD: &str = "output";

static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*((?:steps|variables)\b[^}]*?)\s*\}").expect("参照パターンの正規表現は有効")
});

/// 参照のルート識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceRoot {
    /// 実行済みステップの出力
    Steps,
    /// 変数マップ
    Variables,
}

impl ReferenceRoot {
    /// 識別子からルートを判定
    pub fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "steps" => Some(Self::Steps),
            "variables" => Some(Self::Variables),
            _ => None,
        }
    }

    /// ルートの識別子
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Steps => "steps",
            Self::Variables => "variables",
        }
    }
}

impl fmt::Display for ReferenceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解析済みの参照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableReference {
    expression: String,
    root: ReferenceRoot,
    segments: Vec<String>,
}

impl VariableReference {
    /// `${` と `}` を除いた参照式を解析する
    ///
    /// # 例
    ///
    /// ```rust
    /// use adw_supervisor::expression::reference::{ReferenceRoot, VariableReference};
    ///
    /// let reference = VariableReference::parse("steps.plan.output.items[0]").unwrap();
    /// assert_eq!(reference.root(), ReferenceRoot::Steps);
    /// assert_eq!(reference.step_id(), Some("plan"));
    /// assert_eq!(reference.field(), Some("output"));
    /// assert_eq!(reference.path(), ["items".to_string(), "0".to_string()]);
    /// ```
    pub fn parse(expression: &str) -> Result<Self, ReferenceError> {
        let expression = expression.trim();
        let invalid = |reason: &str| ReferenceError::InvalidReference {
            reference: expression.to_string(),
            reason: reason.to_string(),
        };

        let root_len = expression
            .find(['.', '['])
            .unwrap_or(expression.len());
        let root = ReferenceRoot::from_ident(&expression[..root_len])
            .ok_or_else(|| invalid("ルートは steps または variables である必要があります"))?;

        let segments = parse_segments(&expression[root_len..]).map_err(|reason| invalid(&reason))?;
        if segments.is_empty() {
            return Err(invalid(match root {
                ReferenceRoot::Steps => "ステップIDがありません",
                ReferenceRoot::Variables => "変数名がありません",
            }));
        }

        Ok(Self {
            expression: expression.to_string(),
            root,
            segments,
        })
    }

    /// ルートとセグメントから参照を組み立てる
    ///
    /// 条件式の評価器がプロパティチェーンを解決する際に使用します。
    pub fn from_parts(root: ReferenceRoot, segments: Vec<String>) -> Self {
        let mut expression = root.as_str().to_string();
        for segment in &segments {
            expression.push('.');
            expression.push_str(segment);
        }
        Self {
            expression,
            root,
            segments,
        }
    }

    /// 参照式（`${` と `}` を除いた部分）
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// ルート識別子
    pub fn root(&self) -> ReferenceRoot {
        self.root
    }

    /// ルート以降の全セグメント
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// 参照先のステップID（`steps` ルートのみ）
    pub fn step_id(&self) -> Option<&str> {
        match self.root {
            ReferenceRoot::Steps => self.segments.first().map(String::as_str),
            ReferenceRoot::Variables => None,
        }
    }

    /// 参照するフィールド名
    ///
    /// `steps` ルートでは2番目のセグメント（省略時は [`DEFAULT_FIELD`]）、
    /// `variables` ルートでは変数名を返します。
    pub fn field(&self) -> Option<&str> {
        match self.root {
            ReferenceRoot::Steps => Some(
                self.segments
                    .get(1)
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_FIELD),
            ),
            ReferenceRoot::Variables => self.segments.first().map(String::as_str),
        }
    }

    /// フィールド以降のプロパティパス
    pub fn path(&self) -> &[String] {
        let start = match self.root {
            ReferenceRoot::Steps => 2,
            ReferenceRoot::Variables => 1,
        };
        self.segments.get(start..).unwrap_or(&[])
    }
}

impl fmt::Display for VariableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// テキスト中で検出された参照
#[derive(Debug, Clone)]
pub struct ReferenceMatch {
    /// `${...}` 全体のバイト範囲
    pub range: Range<usize>,
    /// `${...}` 全体の文字列
    pub raw: String,
    /// 解析結果
    pub reference: Result<VariableReference, ReferenceError>,
}

/// テキスト中の `steps` / `variables` 参照をすべて検出する
pub fn find_references(text: &str) -> Vec<ReferenceMatch> {
    REFERENCE_PATTERN
        .captures_iter(text)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let inner = captures.get(1)?;
            Some(ReferenceMatch {
                range: whole.range(),
                raw: whole.as_str().to_string(),
                reference: VariableReference::parse(inner.as_str()),
            })
        })
        .collect()
}

/// ルート以降の `.a.b[0]['c']` 形式をセグメント列に分解
fn parse_segments(rest: &str) -> Result<Vec<String>, String> {
    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut segment = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    segment.push(next);
                    chars.next();
                }
                let segment = segment.trim();
                if segment.is_empty() {
                    return Err("空のセグメントがあります".to_string());
                }
                segments.push(segment.to_string());
            }
            '[' => {
                let mut segment = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    segment.push(next);
                }
                if !closed {
                    return Err("角括弧が閉じられていません".to_string());
                }
                let segment = segment.trim().trim_matches(['"', '\'']);
                if segment.is_empty() {
                    return Err("空のインデックスがあります".to_string());
                }
                segments.push(segment.to_string());
            }
            c if c.is_whitespace() => {}
            other => return Err(format!("予期しない文字 '{other}' があります")),
        }
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_field() {
        let reference = VariableReference::parse("steps.plan").unwrap();
        assert_eq!(reference.step_id(), Some("plan"));
        assert_eq!(reference.field(), Some(DEFAULT_FIELD));
        assert!(reference.path().is_empty());
    }

    #[test]
    fn test_parse_variables_root() {
        let reference = VariableReference::parse("variables.config.retries").unwrap();
        assert_eq!(reference.root(), ReferenceRoot::Variables);
        assert_eq!(reference.step_id(), None);
        assert_eq!(reference.field(), Some("config"));
        assert_eq!(reference.path(), ["retries".to_string()]);
    }

    #[test]
    fn test_parse_bracket_segments() {
        let reference = VariableReference::parse("steps.a.output['files'][2]").unwrap();
        assert_eq!(
            reference.segments(),
            ["a", "output", "files", "2"].map(String::from)
        );
    }

    #[test]
    fn test_parse_rejects_missing_step_id() {
        let err = VariableReference::parse("steps").unwrap_err();
        assert!(matches!(err, ReferenceError::InvalidReference { .. }));
        assert_eq!(err.reference(), "steps");
    }

    #[test]
    fn test_parse_rejects_empty_segment() {
        assert!(VariableReference::parse("steps..output").is_err());
        assert!(VariableReference::parse("steps.a[").is_err());
    }

    #[test]
    fn test_find_references_ignores_other_roots() {
        let text = "use ${steps.a.output} and ${variables.x} but not ${HOME} or ${stepsx}";
        let found = find_references(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].raw, "${steps.a.output}");
        assert_eq!(found[1].raw, "${variables.x}");
        assert_eq!(&text[found[0].range.clone()], "${steps.a.output}");
    }

    #[test]
    fn test_find_references_trims_whitespace() {
        let found = find_references("${ steps.a }");
        assert_eq!(found.len(), 1);
        let reference = found[0].reference.as_ref().unwrap();
        assert_eq!(reference.expression(), "steps.a");
    }

    #[test]
    fn test_from_parts_expression() {
        let reference =
            VariableReference::from_parts(ReferenceRoot::Steps, vec!["a".into(), "output".into()]);
        assert_eq!(reference.expression(), "steps.a.output");
        assert_eq!(reference.to_string(), "steps.a.output");
    }
}
