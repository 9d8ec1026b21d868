//! コンテキストサイズの見積もり
//!
//! トークン数は `ceil(文字数 / 4)` の概算です。正確なトークナイザではありません。

use serde::Serialize;

/// 1トークンあたりの文字数（概算）
pub const CHARS_PER_TOKEN: usize = 4;
/// 上限に対してこの割合以上で警告
pub const NEAR_LIMIT_RATIO: f64 = 0.8;

/// テキストのトークン数を見積もる
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// 見積もりの判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Within,
    NearLimit,
    Overflow,
}

/// 見積もり結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContextCheck {
    pub estimated_tokens: usize,
    pub max_tokens: usize,
    pub status: ContextStatus,
}

impl ContextCheck {
    /// 上限に対する使用率（0.0〜）
    pub fn ratio(&self) -> f64 {
        self.estimated_tokens as f64 / self.max_tokens as f64
    }
}

/// トークン予算の監視
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOverflowWatchdog {
    max_tokens: usize,
}

impl ContextOverflowWatchdog {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn check(&self, text: &str) -> ContextCheck {
        let estimated_tokens = estimate_tokens(text);
        let status = if estimated_tokens > self.max_tokens {
            ContextStatus::Overflow
        } else if estimated_tokens as f64 >= self.max_tokens as f64 * NEAR_LIMIT_RATIO {
            ContextStatus::NearLimit
        } else {
            ContextStatus::Within
        };
        ContextCheck {
            estimated_tokens,
            max_tokens: self.max_tokens,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // 文字数で数える（バイト数ではない）
        assert_eq!(estimate_tokens("日本語です"), 2);
    }

    #[test]
    fn test_status_thresholds() {
        let watchdog = ContextOverflowWatchdog::new(10);
        assert_eq!(watchdog.check(&"a".repeat(28)).status, ContextStatus::Within);
        assert_eq!(watchdog.check(&"a".repeat(32)).status, ContextStatus::NearLimit);
        assert_eq!(watchdog.check(&"a".repeat(40)).status, ContextStatus::NearLimit);
        let overflow = watchdog.check(&"a".repeat(41));
        assert_eq!(overflow.status, ContextStatus::Overflow);
        assert_eq!(overflow.estimated_tokens, 11);
        assert!(overflow.ratio() > 1.0);
    }
}
