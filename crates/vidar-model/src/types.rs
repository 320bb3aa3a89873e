// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Conversation message ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history, in the Ollama chat wire
/// layout.  The `thinking` field is runtime-only bookkeeping: it is stripped
/// from every message before a request is sent (the chain-of-thought channel
/// must never re-enter the model's context).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    /// Set on `Role::Tool` messages: the name of the tool that produced
    /// this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            thinking: None,
            tool_calls: None,
            tool_name: Some(name.into()),
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            thinking: None,
            tool_calls: None,
            tool_name: None,
        }
    }

    /// Approximate token count used for context management (4 chars/token).
    pub fn approx_tokens(&self) -> u32 {
        let mut chars = self.content.len();
        if let Some(tcs) = &self.tool_calls {
            for tc in tcs {
                chars += tc.function.name.len();
                chars += tc.function.arguments.to_string().len();
            }
        }
        ((chars / 4).max(1)) as u32
    }
}

/// A structured tool call as carried on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub function: WireFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// Parsed JSON argument object.
    pub arguments: Value,
}

// ─── Request ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A tool definition in the Ollama function-calling schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolSpecFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpecFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".into(),
            function: ToolSpecFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: ChatOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    pub stream: bool,
}

// ─── Streamed chunks ─────────────────────────────────────────────────────────

/// The message fragment inside one streamed chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

/// One NDJSON chunk from the streaming chat endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
    /// Server-reported error.  "error parsing tool call" variants are
    /// recoverable; anything else aborts the stream.
    #[serde(default)]
    pub error: Option<String>,
}

impl ChatChunk {
    pub fn text(t: impl Into<String>) -> Self {
        Self {
            message: Some(ChunkMessage {
                content: Some(t.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn thinking(t: impl Into<String>) -> Self {
        Self {
            message: Some(ChunkMessage {
                thinking: Some(t.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            message: Some(ChunkMessage {
                tool_calls: Some(vec![WireToolCall {
                    function: WireFunction {
                        name: name.into(),
                        arguments,
                    },
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn done(prompt_eval: u32, eval: u32) -> Self {
        Self {
            done: true,
            done_reason: Some("stop".into()),
            prompt_eval_count: Some(prompt_eval),
            eval_count: Some(eval),
            ..Default::default()
        }
    }

    pub fn done_length(prompt_eval: u32, eval: u32) -> Self {
        Self {
            done: true,
            done_reason: Some("length".into()),
            prompt_eval_count: Some(prompt_eval),
            eval_count: Some(eval),
            ..Default::default()
        }
    }

    pub fn server_error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Default::default()
        }
    }
}

/// Response of a non-streaming chat call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub message: ChunkMessage,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
}

// ─── Model metadata ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

/// Response of the show-model endpoint — only the fields the capability
/// extraction needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShowModelResponse {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub model_info: Value,
    #[serde(default)]
    pub parameters: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
        let t = ChatMessage::tool("read_file", "out");
        assert_eq!(t.role, Role::Tool);
        assert_eq!(t.tool_name.as_deref(), Some("read_file"));
    }

    #[test]
    fn thinking_is_not_serialized_when_absent() {
        let m = ChatMessage::user("hi");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("thinking"));
        assert!(!json.contains("tool_calls"));
    }

    #[test]
    fn approx_tokens_divides_by_four() {
        let m = ChatMessage::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(ChatMessage::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_call_payload() {
        let mut m = ChatMessage::assistant("");
        m.tool_calls = Some(vec![WireToolCall {
            function: WireFunction {
                name: "aaaa".into(),
                arguments: json!({"k": "vvvv"}),
            },
        }]);
        assert!(m.approx_tokens() > 1);
    }

    #[test]
    fn chunk_parses_ollama_shape() {
        let raw = r#"{"message":{"content":"hi","thinking":null},"done":false}"#;
        let c: ChatChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(c.message.unwrap().content.as_deref(), Some("hi"));
        assert!(!c.done);
    }

    #[test]
    fn chunk_parses_final_counts() {
        let raw = r#"{"done":true,"done_reason":"length","prompt_eval_count":120,"eval_count":512}"#;
        let c: ChatChunk = serde_json::from_str(raw).unwrap();
        assert!(c.done);
        assert_eq!(c.done_reason.as_deref(), Some("length"));
        assert_eq!(c.prompt_eval_count, Some(120));
        assert_eq!(c.eval_count, Some(512));
    }

    #[test]
    fn chunk_parses_native_tool_call() {
        let raw = r#"{"message":{"tool_calls":[{"function":{"name":"search","arguments":{"query":"foo"}}}]}}"#;
        let c: ChatChunk = serde_json::from_str(raw).unwrap();
        let tcs = c.message.unwrap().tool_calls.unwrap();
        assert_eq!(tcs[0].function.name, "search");
        assert_eq!(tcs[0].function.arguments["query"], "foo");
    }

    #[test]
    fn request_omits_empty_optionals() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("x")],
            stream: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("tools"));
        assert!(!json.contains("keep_alive"));
        assert!(!json.contains("num_ctx"));
    }

    #[test]
    fn tool_spec_serializes_function_kind() {
        let spec = ToolSpec::function("grep", "search file contents", json!({"type": "object"}));
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "grep");
    }
}
