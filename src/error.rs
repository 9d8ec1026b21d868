//! エラー型の定義
//!
//! このモジュールは、ADW Supervisor 全体で使用されるエラー型を定義します。
//!
//! # エラー分類
//!
//! - [`ConfigError`]: ワークフロー定義の読み込み・構造検証エラー（実行前に拒否される）
//! - [`ReferenceError`]: `${...}` 参照の解決エラー（ステップ単位で失敗結果に変換される）
//! - [`ConditionError`]: `when` 条件式の構文・評価エラー（常に回復可能）
//! - [`ProviderError`]: エージェントプロセスの起動・実行エラー（リトライ対象）
//! - [`PersistenceError`]: 実行記録の永続化エラー

use thiserror::Error;

use crate::watchdog::ResourceAlert;

/// 設定関連のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    /// ファイルの読み込みに失敗
    #[error("設定ファイルの読み込みに失敗しました: {0}")]
    FileRead(#[from] std::io::Error),

    /// TOML のデシリアライズに失敗
    #[error("TOML のデシリアライズに失敗しました: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    /// TOML のシリアライズに失敗
    #[error("TOML のシリアライズに失敗しました: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// バリデーションエラー
    #[error("設定のバリデーションに失敗しました: {0}")]
    Validation(String),

    /// ステップIDの重複
    #[error("ステップID '{0}' が重複しています")]
    DuplicateStepId(String),

    /// 存在しないステップへの参照
    #[error("ステップ '{step_id}' が存在しないステップを参照しています: {reference}")]
    UnknownStepReference {
        /// 参照元のステップID
        step_id: String,
        /// 参照文字列
        reference: String,
    },

    /// 後続ステップ（または自分自身）への静的な前方参照
    #[error("ステップ '{step_id}' が後続のステップを参照しています: {reference}")]
    ForwardReference {
        /// 参照元のステップID
        step_id: String,
        /// 参照文字列
        reference: String,
    },

    /// 依存関係の循環
    #[error("ステップ間の依存関係が循環しています: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// 安全ルールの正規表現が不正
    #[error("安全ルール '{rule}' の正規表現が不正です: {source}")]
    InvalidPattern {
        /// ルールID
        rule: String,
        /// 正規表現のコンパイルエラー
        source: regex::Error,
    },
}

/// エージェントプロセス（CLIプロバイダー）関連のエラー
#[derive(Debug, Error)]
pub enum ProviderError {
    /// CLIツールが見つからない（コマンド名, NPMパッケージ名）
    #[error("CLIツール '{0}' が見つかりません。`npm install -g {1}` でインストールしてください")]
    CliNotFound(String, String),

    /// 認証エラー（詳細, コマンド名）
    #[error("認証に失敗しました: {0}（`{1}` でログインしてください）")]
    AuthenticationError(String, String),

    /// CLI実行エラー
    #[error("CLIの実行に失敗しました: {0}")]
    CliExecutionError(String),

    /// 非0の終了コード
    #[error("エージェントプロセスが異常終了しました (exit code: {code:?}): {stderr}")]
    NonZeroExit {
        /// 終了コード（シグナル終了時は None）
        code: Option<i32>,
        /// 標準エラー出力
        stderr: String,
    },

    /// レート制限超過
    #[error("レート制限を超えました")]
    RateLimitExceeded,

    /// タイムアウト
    #[error("タイムアウトしました: {0}")]
    Timeout(String),

    /// 不正なレスポンス
    #[error("不正なレスポンスです: {0}")]
    InvalidResponse(String),

    /// リソース監視による強制終了
    #[error("リソース監視によりプロセスが停止されました: {}", .0.message)]
    ResourceLimit(Box<ResourceAlert>),

    /// プロセス起動・入出力エラー
    #[error("プロセスの入出力に失敗しました: {0}")]
    Io(#[from] std::io::Error),

    /// 出力が UTF-8 ではない
    #[error("出力のデコードに失敗しました: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// `${...}` 参照の解決エラー
///
/// すべてのバリアントは診断用に元の参照文字列を保持します
/// （[`ReferenceError::reference`] で取得可能）。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// スキップされたステップの出力への参照
    #[error("スキップされたステップ '{step_id}' は参照できません: {reference}")]
    SkippedStepReference {
        /// 参照文字列
        reference: String,
        /// 参照先ステップID
        step_id: String,
    },

    /// まだ実行されていないステップへの参照
    #[error("未実行のステップ '{step_id}' を参照しています: {reference}")]
    ForwardReference {
        /// 参照文字列
        reference: String,
        /// 参照先ステップID
        step_id: String,
    },

    /// 失敗したステップへの参照
    #[error("失敗したステップ '{step_id}' を参照しています: {reference}")]
    StepExecutionFailure {
        /// 参照文字列
        reference: String,
        /// 参照先ステップID
        step_id: String,
    },

    /// 変数が存在しない
    #[error("変数 '{name}' が見つかりません: {reference}")]
    VariableNotFound {
        /// 参照文字列
        reference: String,
        /// 変数名
        name: String,
    },

    /// プロパティが存在しない、または null を経由したアクセス
    #[error("プロパティ '{property}' にアクセスできません: {reference}")]
    MissingProperty {
        /// 参照文字列
        reference: String,
        /// アクセスしようとしたプロパティ
        property: String,
    },

    /// 参照の構文が不正
    #[error("不正な参照です ({reason}): {reference}")]
    InvalidReference {
        /// 参照文字列
        reference: String,
        /// 理由
        reason: String,
    },
}

impl ReferenceError {
    /// エラーの原因となった参照文字列
    pub fn reference(&self) -> &str {
        match self {
            Self::SkippedStepReference { reference, .. }
            | Self::ForwardReference { reference, .. }
            | Self::StepExecutionFailure { reference, .. }
            | Self::VariableNotFound { reference, .. }
            | Self::MissingProperty { reference, .. }
            | Self::InvalidReference { reference, .. } => reference,
        }
    }
}

/// 条件式のエラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    /// `${...}` で囲まれていない
    #[error("条件式は ${{...}} で囲む必要があります: {0}")]
    MissingWrapper(String),

    /// 予期しないトークン
    #[error("位置 {position} に予期しないトークンがあります: {found}")]
    UnexpectedToken {
        /// 文字位置
        position: usize,
        /// 検出したトークン
        found: String,
    },

    /// 式が途中で終わっている
    #[error("条件式が途中で終わっています")]
    UnexpectedEnd,

    /// 文字列リテラルが閉じられていない
    #[error("位置 {0} の文字列リテラルが閉じられていません")]
    UnterminatedString(usize),

    /// 未知の識別子
    #[error("未知の識別子です: {0}（steps または variables を使用してください）")]
    UnknownIdentifier(String),

    /// 未知のメソッド
    #[error("未知のメソッドです: {0}")]
    UnknownMethod(String),

    /// メソッド引数の数が不正
    #[error("メソッド '{method}' の引数は {expected} 個必要ですが {found} 個です")]
    InvalidArguments {
        /// メソッド名
        method: String,
        /// 期待する引数の数
        expected: usize,
        /// 実際の引数の数
        found: usize,
    },

    /// 参照の解決に失敗
    #[error("参照の解決に失敗しました: {0}")]
    Reference(#[from] ReferenceError),
}

/// 実行記録の永続化エラー
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// ファイル入出力エラー
    #[error("実行記録の書き込みに失敗しました: {0}")]
    Io(#[from] std::io::Error),

    /// JSON のシリアライズ/デシリアライズエラー
    #[error("実行記録の JSON 変換に失敗しました: {0}")]
    Json(#[from] serde_json::Error),

    /// `files` 出力の形式が不正
    #[error("files 出力にはパスと内容のオブジェクトが必要です: {0}")]
    InvalidFilesOutput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_error_carries_reference() {
        let err = ReferenceError::SkippedStepReference {
            reference: "steps.b.output".to_string(),
            step_id: "b".to_string(),
        };
        assert_eq!(err.reference(), "steps.b.output");
        assert_eq!(
            err.to_string(),
            "スキップされたステップ 'b' は参照できません: steps.b.output"
        );
    }

    #[test]
    fn test_dependency_cycle_message() {
        let err = ConfigError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "ステップ間の依存関係が循環しています: a -> b -> a");
    }

    #[test]
    fn test_condition_error_from_reference() {
        let err = ConditionError::from(ReferenceError::VariableNotFound {
            reference: "variables.x".to_string(),
            name: "x".to_string(),
        });
        assert!(matches!(err, ConditionError::Reference(_)));
    }
}
