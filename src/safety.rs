//! ステップ出力の安全性チェック
//!
//! # 責務
//!
//! - 出力のスキャン契約 [`SafetyPolicy`]（`scan` / `should_pause` / `merge_policy`）
//! - 正規表現ルールによる実装 [`PatternSafetyPolicy`]
//! - `pause` 違反時の承認ゲート [`ApprovalGate`]（自動承認・自動拒否・端末での対話）
//! - スキャンから最終判定までの流れ [`review`]
//!
//! # 重大度
//!
//! | 重大度 | 扱い |
//! |--------|------|
//! | `warn` | ログのみ、出力はそのまま採用 |
//! | `pause` | 承認ゲートで `allow` されるまで出力を変数に反映しない |
//! | `block` | ステップを失敗にする |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ConfigError;

/// `inspect` を選べる回数（超えたら拒否）
pub const MAX_INSPECTIONS: u32 = 3;

/// 抜粋として前後に含める文字数
const EXCERPT_CONTEXT: usize = 40;

/// 違反の重大度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Pause,
    Block,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warn => "warn",
            Severity::Pause => "pause",
            Severity::Block => "block",
        })
    }
}

/// `[[safety.rules]]` の1ルール
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRuleConfig {
    pub id: String,
    pub pattern: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// ステップ単位のポリシー上書き（`[steps.safety]`）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// 無効化するルールID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable: Vec<String>,
    /// ルールIDごとの重大度の変更
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub severity: BTreeMap<String, Severity>,
}

/// 検出された違反
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub severity: Severity,
    pub description: Option<String>,
    /// 一致箇所の前後（一致部分はマスク済み）
    pub excerpt: String,
    /// 一致箇所のバイト位置
    pub offset: usize,
}

/// スキャン結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub step_id: String,
    pub violations: Vec<Violation>,
}

impl ScanResult {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// 最も重い違反の重大度
    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    pub fn is_blocked(&self) -> bool {
        self.max_severity() == Some(Severity::Block)
    }
}

/// 安全ポリシー
pub trait SafetyPolicy: Send + Sync {
    /// 出力をスキャンする
    fn scan(&self, step_id: &str, output: &str) -> ScanResult;

    /// 人の承認が必要か
    fn should_pause(&self, result: &ScanResult) -> bool {
        result.max_severity() == Some(Severity::Pause)
    }

    /// ステップ単位の上書きを適用したポリシーを返す
    fn merge_policy(&self, policy_override: &PolicyOverride) -> Arc<dyn SafetyPolicy>;
}

#[derive(Debug, Clone)]
struct CompiledRule {
    config: SafetyRuleConfig,
    regex: Regex,
}

/// 正規表現ルールによる安全ポリシー
#[derive(Debug, Clone, Default)]
pub struct PatternSafetyPolicy {
    rules: Vec<CompiledRule>,
}

impl PatternSafetyPolicy {
    pub fn new(rules: &[SafetyRuleConfig]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|config| {
                let regex = Regex::new(&config.pattern).map_err(|source| ConfigError::InvalidPattern {
                    rule: config.id.clone(),
                    source,
                })?;
                Ok(CompiledRule {
                    config: config.clone(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules })
    }

    /// ルールが1つも無いポリシー
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.config.id.as_str())
    }
}

impl SafetyPolicy for PatternSafetyPolicy {
    fn scan(&self, step_id: &str, output: &str) -> ScanResult {
        let violations = self
            .rules
            .iter()
            .flat_map(|rule| {
                rule.regex.find_iter(output).map(move |found| Violation {
                    rule_id: rule.config.id.clone(),
                    severity: rule.config.severity,
                    description: rule.config.description.clone(),
                    excerpt: excerpt(output, found.start(), found.end()),
                    offset: found.start(),
                })
            })
            .collect();
        ScanResult {
            step_id: step_id.to_string(),
            violations,
        }
    }

    fn merge_policy(&self, policy_override: &PolicyOverride) -> Arc<dyn SafetyPolicy> {
        let rules = self
            .rules
            .iter()
            .filter(|rule| !policy_override.disable.contains(&rule.config.id))
            .map(|rule| {
                let mut rule = rule.clone();
                if let Some(severity) = policy_override.severity.get(&rule.config.id) {
                    rule.config.severity = *severity;
                }
                rule
            })
            .collect();
        Arc::new(PatternSafetyPolicy { rules })
    }
}

/// 一致箇所の前後を切り出し、一致部分をマスクする
fn excerpt(text: &str, start: usize, end: usize) -> String {
    let before_start = text[..start]
        .char_indices()
        .rev()
        .nth(EXCERPT_CONTEXT.saturating_sub(1))
        .map_or(0, |(index, _)| index);
    let after_end = text[end..]
        .char_indices()
        .nth(EXCERPT_CONTEXT)
        .map_or(text.len(), |(index, _)| end + index);

    format!(
        "{}{}{}",
        &text[before_start..start],
        mask(&text[start..end]),
        &text[end..after_end]
    )
}

fn mask(matched: &str) -> String {
    let visible: String = matched.chars().take(4).collect();
    let hidden = matched.chars().count().saturating_sub(4).max(3);
    format!("{visible}{}", "*".repeat(hidden))
}

/// 承認ゲートの回答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Allow,
    Deny,
    Inspect,
}

/// 承認ゲートへの問い合わせ
#[derive(Debug, Clone, Copy)]
pub struct ApprovalRequest<'a> {
    pub step_id: &'a str,
    pub scan: &'a ScanResult,
    pub output: &'a str,
    /// これまでに `inspect` した回数
    pub inspections: u32,
}

/// `pause` 違反時に人の判断を仰ぐゲート
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest<'_>) -> ApprovalDecision;

    /// `inspect` が選ばれたときに詳細を見せる
    async fn inspect(&self, _request: &ApprovalRequest<'_>) {}
}

/// 常に許可する
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn decide(&self, request: &ApprovalRequest<'_>) -> ApprovalDecision {
        info!(step_id = request.step_id, "安全チェックの一時停止を自動承認しました");
        ApprovalDecision::Allow
    }
}

/// 常に拒否する（非対話実行の既定）
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

#[async_trait]
impl ApprovalGate for AutoDeny {
    async fn decide(&self, request: &ApprovalRequest<'_>) -> ApprovalDecision {
        warn!(step_id = request.step_id, "承認者がいないため出力を拒否しました");
        ApprovalDecision::Deny
    }
}

/// 端末で対話的に承認を求める
///
/// 入力は1つのバッファ付きリーダーから読み続けるため、先に入力された回答も次の問い合わせで使われます。
#[derive(Debug)]
pub struct TerminalApprovalGate<R = Stdin, W = Stdout> {
    // 並列実行時に問い合わせが混ざらないようにする
    console: Mutex<Console<R, W>>,
}

#[derive(Debug)]
struct Console<R, W> {
    input: BufReader<R>,
    output: W,
}

impl<R, W: AsyncWrite + Unpin> Console<R, W> {
    async fn write(&mut self, text: &str) {
        if self.output.write_all(text.as_bytes()).await.is_ok() {
            let _ = self.output.flush().await;
        }
    }
}

impl TerminalApprovalGate {
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for TerminalApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> TerminalApprovalGate<R, W> {
    /// 任意の入出力で問い合わせるゲートを作る
    pub fn with_io(input: R, output: W) -> Self {
        Self {
            console: Mutex::new(Console {
                input: BufReader::new(input),
                output,
            }),
        }
    }
}

#[async_trait]
impl<R, W> ApprovalGate for TerminalApprovalGate<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn decide(&self, request: &ApprovalRequest<'_>) -> ApprovalDecision {
        let mut console = self.console.lock().await;

        let mut summary = format!(
            "\nステップ '{}' の出力に承認が必要な内容が含まれています:\n",
            request.step_id
        );
        for violation in &request.scan.violations {
            summary.push_str(&format!("  [{}] {}\n", violation.severity, violation.rule_id));
        }
        summary.push_str("allow / deny / inspect を入力してください > ");
        console.write(&summary).await;

        let mut line = String::new();
        match console.input.read_line(&mut line).await {
            Ok(0) | Err(_) => ApprovalDecision::Deny,
            Ok(_) => parse_decision(&line),
        }
    }

    async fn inspect(&self, request: &ApprovalRequest<'_>) {
        let mut console = self.console.lock().await;
        let mut detail = String::new();
        for violation in &request.scan.violations {
            detail.push_str(&format!(
                "--- {} ({}) @{}\n{}\n",
                violation.rule_id,
                violation.description.as_deref().unwrap_or("-"),
                violation.offset,
                violation.excerpt
            ));
        }
        console.write(&detail).await;
    }
}

/// 入力を回答に変換する（不明な入力は拒否）
pub fn parse_decision(input: &str) -> ApprovalDecision {
    match input.trim().to_ascii_lowercase().as_str() {
        "a" | "allow" | "y" | "yes" => ApprovalDecision::Allow,
        "i" | "inspect" => ApprovalDecision::Inspect,
        _ => ApprovalDecision::Deny,
    }
}

/// 安全チェックの最終判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyOutcome {
    /// 違反なし
    Clean,
    /// `warn` のみ
    Warned,
    /// `pause` を承認
    Approved,
    /// `pause` を拒否
    Denied,
    /// `block`
    Blocked,
}

impl SafetyOutcome {
    /// 出力を採用してよいか
    pub fn permits_output(&self) -> bool {
        matches!(self, SafetyOutcome::Clean | SafetyOutcome::Warned | SafetyOutcome::Approved)
    }
}

/// 安全チェックの記録（監査用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyReview {
    pub scan: ScanResult,
    pub outcome: SafetyOutcome,
}

/// 出力をスキャンし、必要なら承認ゲートに問い合わせて最終判定を返す
pub async fn review(
    policy: &dyn SafetyPolicy,
    gate: &dyn ApprovalGate,
    step_id: &str,
    output: &str,
) -> SafetyReview {
    let scan = policy.scan(step_id, output);

    let outcome = if scan.is_clean() {
        SafetyOutcome::Clean
    } else if scan.is_blocked() {
        warn!(step_id, violations = scan.violations.len(), "安全ルールによりブロックされました");
        SafetyOutcome::Blocked
    } else if policy.should_pause(&scan) {
        let mut inspections = 0;
        loop {
            let request = ApprovalRequest {
                step_id,
                scan: &scan,
                output,
                inspections,
            };
            match gate.decide(&request).await {
                ApprovalDecision::Allow => break SafetyOutcome::Approved,
                ApprovalDecision::Deny => break SafetyOutcome::Denied,
                ApprovalDecision::Inspect if inspections >= MAX_INSPECTIONS => {
                    warn!(step_id, "inspect の上限に達したため拒否しました");
                    break SafetyOutcome::Denied;
                }
                ApprovalDecision::Inspect => {
                    gate.inspect(&request).await;
                    inspections += 1;
                }
            }
        }
    } else {
        for violation in &scan.violations {
            warn!(step_id, rule = %violation.rule_id, "安全ルールの警告: {}", violation.excerpt);
        }
        SafetyOutcome::Warned
    };

    info!(step_id, ?outcome, "安全チェックが完了しました");
    SafetyReview { scan, outcome }
}
