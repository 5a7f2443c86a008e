//! Anthropic Messages API wire types.
//!
//! Request shapes follow the [Anthropic API reference](https://docs.anthropic.com/en/api/messages).
//! The same block types serve three purposes: parsing the inbound client
//! request, rebuilding a native request inside the Anthropic driver, and
//! rendering the response content the client receives.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the Anthropic Messages API.
///
/// Unknown fields are tolerated; the handler forwards what it understands
/// and ignores the rest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    /// Model identifier. Clients prefix it with a provider name,
    /// e.g. `openai/gpt-4o-mini`.
    pub model: String,

    /// Maximum number of tokens to generate. Required by the API.
    pub max_tokens: u32,

    /// Conversation messages, alternating user and assistant roles.
    pub messages: Vec<InputMessage>,

    /// System prompt, either a bare string or an ordered list of text blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Tools available to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclaration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether the response is streamed as Server-Sent Events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Custom metadata attached to the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// System prompt as the API accepts it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Bare string form.
    Text(String),
    /// Ordered list of text blocks.
    Blocks(Vec<SystemBlock>),
}

/// A single system text block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

/// Request metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// An inbound message with role and content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputMessage {
    pub role: Role,

    /// Either a bare string or an array of content blocks.
    pub content: MessageContent,

    /// Message-level cache annotation. The wire format puts `cache_control`
    /// on blocks, but some clients attach it to the message; it is then
    /// inherited by the message's last block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

/// Message sender role.
///
/// `system` is not part of Anthropic's message roles, but clients
/// occasionally send it inside the messages array; the converter accepts it
/// and treats it as a system turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Message content container.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Bare string, shorthand for a single text block.
    Text(String),
    /// Array of typed content blocks.
    Blocks(Vec<ContentBlock>),
}

/// Content block in a message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    Image {
        source: MediaSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    Document {
        source: MediaSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    /// Chain-of-thought emitted by a reasoning model.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    /// Chain-of-thought the upstream withheld; `data` is an opaque payload.
    RedactedThinking {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },

    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
}

impl ContentBlock {
    /// The block's own cache annotation, if any.
    pub fn cache_control(&self) -> Option<&Value> {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. }
            | ContentBlock::Document { cache_control, .. }
            | ContentBlock::Thinking { cache_control, .. }
            | ContentBlock::RedactedThinking { cache_control, .. }
            | ContentBlock::ToolUse { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. } => cache_control.as_ref(),
        }
    }

    /// Replace the block's cache annotation.
    pub fn set_cache_control(&mut self, value: Option<Value>) {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. }
            | ContentBlock::Document { cache_control, .. }
            | ContentBlock::Thinking { cache_control, .. }
            | ContentBlock::RedactedThinking { cache_control, .. }
            | ContentBlock::ToolUse { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. } => *cache_control = value,
        }
    }
}

/// Source of an image or document block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// Tool result content: a bare string or a list of text/image blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

/// A block inside structured tool result content.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
    Image { source: MediaSource },
}

/// Tool declaration.
///
/// Built-in server tools (`computer_*`, `text_editor_*`, `bash_*`) carry a
/// `type` discriminator and are passed through verbatim; custom tools are
/// the plain `{name, description, input_schema}` shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolDeclaration {
    Custom(CustomTool),
    Builtin(Value),
}

/// A caller-defined tool with a JSON Schema input contract.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

/// Response body for a non-streaming completion, also the payload of the
/// `message_start` stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Unknown,
    /// Forward compatibility: any reason this build does not know yet.
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
            StopReason::ToolUse => write!(f, "tool_use"),
            StopReason::Unknown => write!(f, "unknown"),
            StopReason::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Token usage counters.
///
/// All fields are serialized even when zero; clients sum them across
/// `message_start` and `message_delta` events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
}

/// Error details as the Anthropic API reports them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Top-level error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    pub error: ErrorDetail,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response_type: "error".to_string(),
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// Streaming event types for Anthropic SSE responses.
///
/// Event flow for a typical response:
/// 1. `message_start` with empty content
/// 2. `content_block_start` / `content_block_delta`* / `content_block_stop`
///    per content block, indices strictly increasing
/// 3. `message_delta` with the stop reason and final usage
/// 4. `message_stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageResponse,
    },

    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },

    ContentBlockDelta {
        index: u32,
        delta: ContentDelta,
    },

    ContentBlockStop {
        index: u32,
    },

    MessageDelta {
        delta: MessageDeltaBody,
        usage: Usage,
    },

    MessageStop,

    /// Keep-alive; safe to ignore.
    Ping,

    Error {
        error: ErrorDetail,
    },
}

impl StreamEvent {
    /// The `event:` line written in front of this payload on the SSE stream.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Incremental update to an open content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    /// Emitted by Anthropic for `thinking` blocks; parsed on the driver
    /// side, never produced by the transcoder.
    ThinkingDelta { thinking: String },
    /// Cryptographic signature for a thinking block.
    SignatureDelta { signature: String },
}

/// Payload of a `message_delta` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_request_with_mixed_blocks() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "openai/gpt-4o",
            "max_tokens": 512,
            "system": [
                {"type": "text", "text": "Be terse."},
                {"type": "text", "text": "Answer in English."}
            ],
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Checking."},
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found"}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(request.model, "openai/gpt-4o");
        assert_eq!(request.messages.len(), 3);

        let Some(SystemPrompt::Blocks(blocks)) = &request.system else {
            unreachable!("expected system blocks");
        };
        assert_eq!(blocks.len(), 2);

        let MessageContent::Blocks(blocks) = &request.messages[1].content else {
            unreachable!("expected block content");
        };
        let ContentBlock::ToolUse { id, name, .. } = &blocks[1] else {
            unreachable!("expected tool_use");
        };
        assert_eq!(id, "toolu_1");
        assert_eq!(name, "search");
    }

    #[test]
    fn builtin_tools_parse_verbatim() {
        let tools: Vec<ToolDeclaration> = serde_json::from_value(json!([
            {"name": "search", "description": "find things", "input_schema": {"type": "object"}},
            {"type": "bash_20250124", "name": "bash"}
        ]))
        .unwrap();

        assert!(matches!(&tools[0], ToolDeclaration::Custom(t) if t.name == "search"));

        let ToolDeclaration::Builtin(raw) = &tools[1] else {
            unreachable!("expected builtin tool");
        };
        assert_eq!(raw["type"], "bash_20250124");
    }

    #[test]
    fn stream_event_serialization_shape() {
        let event = StreamEvent::ContentBlockDelta {
            index: 2,
            delta: ContentDelta::TextDelta {
                text: "Hi".to_string(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_block_delta");
        assert_eq!(json["index"], 2);
        assert_eq!(json["delta"]["type"], "text_delta");
        assert_eq!(json["delta"]["text"], "Hi");
        assert_eq!(event.event_name(), "content_block_delta");
    }

    #[test]
    fn unknown_stop_reason_survives_round_trip() {
        let reason: StopReason = serde_json::from_value(json!("pause_turn")).unwrap();
        assert_eq!(reason, StopReason::Other("pause_turn".to_string()));
        assert_eq!(serde_json::to_value(&reason).unwrap(), json!("pause_turn"));
    }

    #[test]
    fn usage_serializes_all_counters() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };

        assert_eq!(
            serde_json::to_value(usage).unwrap(),
            json!({
                "input_tokens": 10,
                "output_tokens": 5,
                "cache_creation_input_tokens": 0,
                "cache_read_input_tokens": 0
            })
        );
    }
}
