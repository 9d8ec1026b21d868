//! 繰り返しツール呼び出しの検出
//!
//! エージェントが同じツールを同じ引数で呼び続ける状態（ループ）を、
//! 直近 N 回の呼び出しのスライディングウィンドウで検出します。
//!
//! ```rust
//! use adw_supervisor::detector::LoopDetector;
//! use serde_json::json;
//!
//! let mut detector = LoopDetector::new(3);
//! assert!(!detector.check_for_loop("Read", &json!({"path": "a.rs"})));
//! assert!(detector.check_for_loop("Read", &json!({"path": "a.rs"})));
//! assert!(!detector.check_for_loop("Edit", &json!({"path": "a.rs"})));
//! ```

use std::collections::VecDeque;

use serde_json::Value;

/// 既定のウィンドウサイズ
pub const DEFAULT_WINDOW: usize = 3;

/// ツール呼び出しのループ検出器
#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: usize,
    recent: VecDeque<String>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LoopDetector {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            recent: VecDeque::with_capacity(window),
        }
    }

    /// 呼び出しを記録し、同じ呼び出しがウィンドウ内に既にあれば `true`
    ///
    /// 引数は正規化した JSON テキストで比較するため、キーの順序は影響しません。
    pub fn check_for_loop(&mut self, tool: &str, args: &Value) -> bool {
        let key = format!("{tool}:{}", canonical(args));
        let repeated = self.recent.contains(&key);

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(key);
        repeated
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

/// オブジェクトのキーを整列した JSON テキスト
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(key, value)| format!("{}:{}", Value::String(key.clone()), canonical(value)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_three_identical_calls() {
        let mut detector = LoopDetector::new(3);
        let args = json!({"command": "cargo test"});
        assert!(!detector.check_for_loop("Bash", &args));
        assert!(detector.check_for_loop("Bash", &args));
        assert!(detector.check_for_loop("Bash", &args));
    }

    #[test]
    fn test_call_outside_window_is_not_a_loop() {
        let mut detector = LoopDetector::new(2);
        assert!(!detector.check_for_loop("Read", &json!("a")));
        assert!(!detector.check_for_loop("Read", &json!("b")));
        assert!(!detector.check_for_loop("Read", &json!("c")));
        assert!(!detector.check_for_loop("Read", &json!("a")));
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let mut detector = LoopDetector::default();
        assert!(!detector.check_for_loop("Edit", &json!({"a": 1, "b": [1, {"y": 2, "x": 1}]})));
        assert!(detector.check_for_loop("Edit", &json!({"b": [1, {"x": 1, "y": 2}], "a": 1})));
    }

    #[test]
    fn test_same_args_different_tool() {
        let mut detector = LoopDetector::default();
        assert!(!detector.check_for_loop("Read", &json!({"path": "x"})));
        assert!(!detector.check_for_loop("Write", &json!({"path": "x"})));
    }

    #[test]
    fn test_reset() {
        let mut detector = LoopDetector::default();
        detector.check_for_loop("Read", &json!(1));
        detector.reset();
        assert!(!detector.check_for_loop("Read", &json!(1)));
    }
}
