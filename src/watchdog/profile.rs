//! ツールプロファイルによるリソース上限の自動調整
//!
//! # 責務
//!
//! ステップが扱うツール（言語タグ + デプロイ範囲）から、
//! CPU警告閾値・メモリ上限・タイムアウト倍率を導出します。
//!
//! # 調整表
//!
//! | 言語 | CPU警告(%) | メモリ上限(MB) |
//! |------|-----------|---------------|
//! | python / javascript / typescript / ruby | 95 | 1536〜2048 |
//! | php | 90 | 1024 |
//! | java / kotlin / scala | 85 | 3072 |
//! | go / rust | 75 | 1024 |
//! | c / c++ | 70 | 768 |
//!
//! インタプリタ言語は CPU の余裕を大きく、コンパイル言語はメモリを小さく取ります。
//!
//! | デプロイ範囲 | タイムアウト倍率 |
//! |-------------|----------------|
//! | cloud_service | 2.0 |
//! | local_service | 1.0 |
//! | embedded | 0.6 |

use serde::{Deserialize, Serialize};

/// デプロイ範囲
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentScope {
    /// クラウドサービス（外部APIやビルドを伴い時間がかかる）
    CloudService,
    /// ローカルサービス
    #[default]
    LocalService,
    /// 組み込み（小さく速い）
    Embedded,
}

impl DeploymentScope {
    /// タイムアウトに掛ける倍率
    pub fn timeout_multiplier(&self) -> f64 {
        match self {
            DeploymentScope::CloudService => 2.0,
            DeploymentScope::LocalService => 1.0,
            DeploymentScope::Embedded => 0.6,
        }
    }
}

/// ステップが扱うツールのプロファイル
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolProfile {
    /// 言語タグ（例: `["python", "rust"]`）
    #[serde(default)]
    pub languages: Vec<String>,
    /// デプロイ範囲
    #[serde(default)]
    pub scope: DeploymentScope,
}

/// 言語ごとのリソース上限
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LanguageLimits {
    /// CPU警告閾値（%）
    pub cpu_warn_percent: f64,
    /// メモリ上限（MB）
    pub memory_limit_mb: u64,
}

/// 調整後の上限
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunedLimits {
    /// CPU警告閾値（言語が一致しない場合は None）
    pub cpu_warn_percent: Option<f64>,
    /// メモリ上限（言語が一致しない場合は None）
    pub memory_limit_mb: Option<u64>,
    /// タイムアウト倍率
    pub timeout_multiplier: f64,
    /// 調整表に一致した言語
    pub matched_languages: Vec<String>,
}

/// 言語タグから上限を引く
pub fn language_limits(language: &str) -> Option<LanguageLimits> {
    let (cpu_warn_percent, memory_limit_mb) = match language.trim().to_ascii_lowercase().as_str() {
        "python" | "py" => (95.0, 2048),
        "javascript" | "js" | "node" | "typescript" | "ts" => (95.0, 2048),
        "ruby" | "rb" => (95.0, 1536),
        "php" => (90.0, 1024),
        "java" | "kotlin" | "scala" => (85.0, 3072),
        "go" | "golang" => (75.0, 1024),
        "rust" | "rs" => (75.0, 1024),
        "c" | "cpp" | "c++" => (70.0, 768),
        _ => return None,
    };
    Some(LanguageLimits {
        cpu_warn_percent,
        memory_limit_mb,
    })
}

impl ToolProfile {
    /// プロファイルから上限を導出する
    ///
    /// 複数の言語が一致した場合は、それぞれの最大値を採用します。
    ///
    /// ```rust
    /// use adw_supervisor::watchdog::profile::{DeploymentScope, ToolProfile};
    ///
    /// let profile = ToolProfile {
    ///     languages: vec!["rust".into(), "python".into()],
    ///     scope: DeploymentScope::CloudService,
    /// };
    /// let tuned = profile.tune();
    /// assert_eq!(tuned.cpu_warn_percent, Some(95.0));
    /// assert_eq!(tuned.memory_limit_mb, Some(2048));
    /// assert_eq!(tuned.timeout_multiplier, 2.0);
    /// ```
    pub fn tune(&self) -> TunedLimits {
        let mut cpu_warn_percent: Option<f64> = None;
        let mut memory_limit_mb: Option<u64> = None;
        let mut matched_languages = Vec::new();

        for language in &self.languages {
            if let Some(limits) = language_limits(language) {
                cpu_warn_percent =
                    Some(cpu_warn_percent.map_or(limits.cpu_warn_percent, |c| c.max(limits.cpu_warn_percent)));
                memory_limit_mb =
                    Some(memory_limit_mb.map_or(limits.memory_limit_mb, |m| m.max(limits.memory_limit_mb)));
                matched_languages.push(language.clone());
            }
        }

        TunedLimits {
            cpu_warn_percent,
            memory_limit_mb,
            timeout_multiplier: self.scope.timeout_multiplier(),
            matched_languages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreted_languages_get_more_cpu_headroom() {
        let python = language_limits("Python").unwrap();
        let rust = language_limits("rust").unwrap();
        assert!(python.cpu_warn_percent > rust.cpu_warn_percent);
        assert!(rust.memory_limit_mb < python.memory_limit_mb);
    }

    #[test]
    fn test_unknown_language_is_not_tuned() {
        let profile = ToolProfile {
            languages: vec!["cobol".into()],
            scope: DeploymentScope::Embedded,
        };
        let tuned = profile.tune();
        assert_eq!(tuned.cpu_warn_percent, None);
        assert_eq!(tuned.memory_limit_mb, None);
        assert_eq!(tuned.timeout_multiplier, 0.6);
        assert!(tuned.matched_languages.is_empty());
    }

    #[test]
    fn test_scope_deserializes_snake_case() {
        let profile: ToolProfile =
            toml::from_str("languages = [\"go\"]\nscope = \"cloud_service\"").unwrap();
        assert_eq!(profile.scope, DeploymentScope::CloudService);
        assert_eq!(profile.tune().matched_languages, vec!["go".to_string()]);
    }
}
