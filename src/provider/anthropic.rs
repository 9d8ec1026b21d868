//! Anthropic Claude Code CLI クライアント
//!
//! # 責務
//!
//! - Claude Code CLI (`claude` コマンド) を監視下で起動
//! - [`ProviderClient`] トレイトを実装し、統一インターフェースを提供
//! - `stream-json` 出力から最終結果・トークン使用量・ツール呼び出しを抽出
//!
//! # CLIツール
//!
//! - **コマンド**: `claude -p <prompt> --output-format stream-json --verbose --model <model>`
//! - **インストール**: `npm install -g @anthropic-ai/claude-code`
//! - **認証方法**:
//!   1. 環境変数 `ANTHROPIC_API_KEY` を設定
//!   2. `claude` を起動して `/login` コマンドを実行
//!
//! # CLI出力形式
//!
//! 1行1イベントの JSON:
//! ```json
//! {"type":"system","subtype":"init","model":"claude-sonnet-4-5"}
//! {"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"a.rs"}}]}}
//! {"type":"result","subtype":"success","result":"完了しました","usage":{"input_tokens":10,"output_tokens":20}}
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

/// デフォルトのCLIコマンド名
const DEFAULT_COMMAND: &str = "claude";

/// NPMパッケージ名（エラーメッセージ用）
const NPM_PACKAGE: &str = "@anthropic-ai/claude-code";

/// Anthropic Claude Code CLI クライアント
///
/// 認証は環境変数またはCLIツールの事前ログインに依存します。
pub struct AnthropicClient {
    /// 使用するCLIコマンド名（通常は "claude"）
    command: String,
    supervisor: ProcessSupervisor,
}

impl AnthropicClient {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            supervisor,
        }
    }

    /// カスタムコマンド名を指定する（テストやカスタムインストール用）
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    fn args(prompt: &str, model: &str) -> Vec<String> {
        vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            model.to_string(),
        ]
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new(ProcessSupervisor::default())
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    async fn execute(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError> {
        let model = resolve_model(&Provider::Anthropic, &request.model_tier);
        debug!(step_id = %request.step_id, model, "Claude Code を実行します");

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

        let mut response = parse_stream_output(&output.stdout, model)?;
        response.process = Some(output.stats);
        Ok(response)
    }
}

/// `stream-json` 出力全体をレスポンスに変換する
pub fn parse_stream_output(stdout: &str, requested_model: &str) -> Result<ProviderResponse, ProviderError> {
    let mut assistant_text = String::new();
    let mut result: Option<String> = None;
    let mut model = String::new();
    let mut token_usage = None;
    let mut stop_reason = StopReason::Unknown;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // JSON 以外の行（警告等）は読み飛ばす
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            continue;
        };

        match event.event_type.as_str() {
            "system" => {
                if let Some(m) = event.model {
                    model = m;
                }
            }
            "assistant" => {
                for block in event.message.map(|m| m.content).unwrap_or_default() {
                    if block.block_type == "text"
                        && let Some(text) = block.text
                    {
                        assistant_text.push_str(&text);
                    }
                }
            }
            "result" => {
                if event.is_error.unwrap_or(false) {
                    return Err(ProviderError::CliExecutionError(
                        event.result.unwrap_or_else(|| "Claude Code がエラーを返しました".to_string()),
                    ));
                }
                result = event.result;
                token_usage = event.usage.map(|usage| TokenUsage {
                    input_tokens: usage.input_tokens.unwrap_or(0),
                    output_tokens: usage.output_tokens.unwrap_or(0),
                });
                if let Some(subtype) = event.subtype {
                    stop_reason = StopReason::parse(&subtype);
                }
            }
            _ => {}
        }
    }

    let content = result.unwrap_or(assistant_text);
    if content.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "Claude Code の出力に結果が含まれていません".to_string(),
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

/// `assistant` イベント中の `tool_use` ブロックを取り出す
pub fn extract_tool_calls(line: &str) -> Vec<ToolCall> {
    let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
        return Vec::new();
    };
    if event.event_type != "assistant" {
        return Vec::new();
    }
    event
        .message
        .map(|m| m.content)
        .unwrap_or_default()
        .into_iter()
        .filter(|block| block.block_type == "tool_use")
        .filter_map(|block| {
            Some(ToolCall {
                name: block.name?,
                args: block.input.unwrap_or(Value::Null),
            })
        })
        .collect()
}

/// stream-json の1イベント
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}
