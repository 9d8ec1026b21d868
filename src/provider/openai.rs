//! OpenAI Codex CLI クライアント
//!
//! # CLIツール
//!
//! - **コマンド**: `codex exec --json --model <model> <prompt>`
//! - **インストール**: `npm install -g @openai/codex`
//! - **認証**: 環境変数 `OPENAI_API_KEY`、または `codex login`
//!
//! # CLI出力形式（JSONL）
//!
//! ```json
//! {"type":"turn.started","model":"gpt-4o"}
//! {"type":"item.started","item":{"type":"command_execution","command":"ls"}}
//! {"type":"item.completed","item":{"type":"agent_message","text":"完了しました"}}
//! {"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":20}}
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::step::Provider;
use crate::error::ProviderError;
use super::model_tier::resolve_model;
use super::process::{AgentInvocation, ProcessSupervisor, ToolCall};
use super::traits::{AgentRequest, ProviderClient, ProviderResponse, StopReason, TokenUsage};

/// Codex CLIのデフォルトコマンド名
const DEFAULT_COMMAND: &str = "codex";

/// Codex CLIのNPMパッケージ名（エラーメッセージ用）
const NPM_PACKAGE: &str = "@openai/codex";

/// ツール呼び出しとみなすアイテム種別
const TOOL_ITEM_TYPES: &[&str] = &["command_execution", "mcp_tool_call", "file_change", "web_search"];

/// OpenAI Codex CLI クライアント
pub struct OpenAIClient {
    command: String,
    supervisor: ProcessSupervisor,
}

impl OpenAIClient {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            supervisor,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    fn args(prompt: &str, model: &str) -> Vec<String> {
        vec![
            "exec".to_string(),
            "--json".to_string(),
            "--model".to_string(),
            model.to_string(),
            prompt.to_string(),
        ]
    }
}

impl Default for OpenAIClient {
    fn default() -> Self {
        Self::new(ProcessSupervisor::default())
    }
}

#[async_trait]
impl ProviderClient for OpenAIClient {
    async fn execute(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError> {
        let model = resolve_model(&Provider::OpenAI, &request.model_tier);
        debug!(step_id = %request.step_id, model, "Codex を実行します");

        let output = self
            .supervisor
            .run(AgentInvocation {
                step_id: &request.step_id,
                program: &self.command,
                package: NPM_PACKAGE,
                args: Self::args(&request.prompt, model),
                workdir: request.workdir.as_deref(),
                watchdog: &request.watchdog,
                alert_log: request.alert_log.as_ref(),
                extract_tool_calls,
            })
            .await?;

        let mut response = parse_jsonl_output(&output.stdout, model)?;
        response.process = Some(output.stats);
        Ok(response)
    }
}

/// JSONL 出力全体をレスポンスに変換する
///
/// 最後の `agent_message` を結果とします。
pub fn parse_jsonl_output(stdout: &str, requested_model: &str) -> Result<ProviderResponse, ProviderError> {
    let mut content = String::new();
    let mut model = String::new();
    let mut token_usage = None;
    let mut stop_reason = StopReason::Unknown;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: JsonLEvent = serde_json::from_str(line)
            .map_err(|e| ProviderError::InvalidResponse(format!("JSONL のパースに失敗しました: {e}: {line}")))?;

        match event.event_type.as_str() {
            "turn.started" | "thread.started" => {
                if let Some(m) = event.model {
                    model = m;
                }
            }
            "item.completed" => {
                if let Some(item) = event.item
                    && matches!(item.item_type.as_str(), "agent_message" | "text")
                    && let Some(text) = item.text
                {
                    content = text;
                }
            }
            "turn.completed" => {
                if let Some(usage) = event.usage {
                    token_usage = Some(TokenUsage {
                        input_tokens: usage.input_tokens.unwrap_or(0),
                        output_tokens: usage.output_tokens.unwrap_or(0),
                    });
                }
                stop_reason = event
                    .stop_reason
                    .as_deref()
                    .map(StopReason::parse)
                    .unwrap_or(StopReason::EndTurn);
            }
            "turn.failed" | "error" => {
                let message = event
                    .error
                    .and_then(|e| e.message)
                    .or(event.message)
                    .unwrap_or_else(|| "Codex がエラーを返しました".to_string());
                return Err(ProviderError::CliExecutionError(message));
            }
            _ => {}
        }
    }

    if content.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "Codex の出力に応答が含まれていません".to_string(),
        ));
    }

    Ok(ProviderResponse {
        content,
        token_usage,
        stop_reason,
        model: if model.is_empty() { requested_model.to_string() } else { model },
        process: None,
    })
}

/// `item.started` のツール系アイテムを取り出す
pub fn extract_tool_calls(line: &str) -> Vec<ToolCall> {
    let Ok(event) = serde_json::from_str::<JsonLEvent>(line) else {
        return Vec::new();
    };
    if event.event_type != "item.started" {
        return Vec::new();
    }
    match event.item {
        Some(item) if TOOL_ITEM_TYPES.contains(&item.item_type.as_str()) => {
            let args = item
                .command
                .map(Value::String)
                .unwrap_or_else(|| Value::Object(item.rest));
            vec![ToolCall {
                name: item.item_type,
                args,
            }]
        }
        _ => Vec::new(),
    }
}

/// JSONL イベント（全イベントタイプの共通構造）
#[derive(Debug, Deserialize)]
struct JsonLEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    item: Option<JsonLItem>,
    #[serde(default)]
    usage: Option<JsonLUsage>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<JsonLError>,
}

#[derive(Debug, Deserialize)]
struct JsonLItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct JsonLUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct JsonLError {
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_output_success() {
        let stdout = r#"{"type":"turn.started","model":"gpt-4o"}
{"type":"item.completed","item":{"type":"agent_message","text":"first"}}
{"type":"item.completed","item":{"type":"agent_message","text":"final"}}
{"type":"turn.completed","usage":{"input_tokens":5,"output_tokens":7}}"#;
        let response = parse_jsonl_output(stdout, "gpt-4o-mini").unwrap();
        assert_eq!(response.content, "final");
        assert_eq!(response.model, "gpt-4o");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.token_usage.unwrap().total(), 12);
    }

    #[test]
    fn test_parse_jsonl_output_max_tokens() {
        let stdout = r#"{"type":"item.completed","item":{"type":"agent_message","text":"partial"}}
{"type":"turn.completed","stop_reason":"max_tokens"}"#;
        let response = parse_jsonl_output(stdout, "o1").unwrap();
        assert_eq!(response.stop_reason, StopReason::MaxTokens);
        assert_eq!(response.model, "o1");
    }

    #[test]
    fn test_parse_jsonl_output_empty_content() {
        let stdout = r#"{"type":"turn.completed"}"#;
        assert!(matches!(
            parse_jsonl_output(stdout, "o1"),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_jsonl_output_invalid_json() {
        assert!(matches!(
            parse_jsonl_output("{broken", "o1"),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_turn_failed() {
        let stdout = r#"{"type":"turn.failed","error":{"message":"quota exceeded"}}"#;
        assert!(matches!(
            parse_jsonl_output(stdout, "o1"),
            Err(ProviderError::CliExecutionError(msg)) if msg == "quota exceeded"
        ));
    }

    #[test]
    fn test_extract_tool_calls() {
        let calls = extract_tool_calls(
            r#"{"type":"item.started","item":{"type":"command_execution","command":"cargo test"}}"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "command_execution");
        assert_eq!(calls[0].args, Value::String("cargo test".to_string()));

        let file_change = extract_tool_calls(
            r#"{"type":"item.started","item":{"type":"file_change","path":"a.rs"}}"#,
        );
        assert_eq!(file_change[0].args["path"], "a.rs");

        assert!(extract_tool_calls(r#"{"type":"item.completed","item":{"type":"agent_message","text":"x"}}"#).is_empty());
    }
}
