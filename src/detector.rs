//! 失敗パターンの検出器
//!
//! - [`loop_detector`][]: 同じツール呼び出しの繰り返し
//! - [`context_overflow`][]: プロンプトのトークン予算超過

pub mod loop_detector;
pub mod context_overflow;

pub use context_overflow::{estimate_tokens, ContextCheck, ContextOverflowWatchdog, ContextStatus};
pub use loop_detector::LoopDetector;
