//! Translating the neutral event stream into Anthropic SSE events.
//!
//! The transcoder owns the block index for exactly one response: every
//! `*-start` opens a block at the current index, every `*-end` emits
//! `content_block_stop` and increments. The counter is monotone across the
//! whole response and dies with the transcoder. Text, reasoning and
//! tool-use blocks each consume one index.

use serde_json::{Map, Value};

use crate::{
    error::{DriverError, LlmError, LlmResult, classify},
    messages::{
        anthropic::{
            ContentBlock, ContentDelta, MessageDeltaBody, MessageResponse, Role, StopReason,
            StreamEvent, Usage,
        },
        neutral::{FinishReason, NeutralEvent, NeutralUsage, Part, PartKind},
    },
};

/// Stateful neutral-to-Anthropic stream translator. One instance per
/// response; the block index must never leak across responses.
pub struct StreamTranscoder {
    model: String,
    message_id: String,
    block_index: u32,
    open_block: Option<OpenBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    ToolUse,
}

impl StreamTranscoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: fresh_message_id(),
            block_index: 0,
            open_block: None,
        }
    }

    /// Translate one neutral event into zero or more wire events, in the
    /// exact order they must reach the client.
    pub fn transcode(&mut self, event: NeutralEvent) -> Vec<StreamEvent> {
        let mut out = Vec::with_capacity(2);

        match event {
            NeutralEvent::StepStart => {
                out.push(StreamEvent::MessageStart {
                    message: MessageResponse {
                        id: self.message_id.clone(),
                        response_type: "message".to_string(),
                        role: Role::Assistant,
                        content: Vec::new(),
                        model: self.model.clone(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: Usage::default(),
                    },
                });
            }

            NeutralEvent::TextStart => {
                self.open(OpenBlock::Text, &mut out);
            }
            NeutralEvent::TextDelta { text } => {
                self.ensure_open(OpenBlock::Text, &mut out);
                out.push(StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: ContentDelta::TextDelta { text },
                });
            }
            NeutralEvent::TextEnd => self.close(&mut out),

            NeutralEvent::ReasoningStart => {
                self.open(OpenBlock::Thinking, &mut out);
            }
            NeutralEvent::ReasoningDelta { text } => {
                self.ensure_open(OpenBlock::Thinking, &mut out);
                // Same delta carrier as text; the open block type
                // disambiguates on the client side.
                out.push(StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: ContentDelta::TextDelta { text },
                });
            }
            NeutralEvent::ReasoningEnd => self.close(&mut out),

            NeutralEvent::ToolInputStart { id, tool_name } => {
                self.close_if_open(&mut out);
                out.push(StreamEvent::ContentBlockStart {
                    index: self.block_index,
                    content_block: tool_use_block(id, tool_name, Value::Object(Map::new())),
                });
                self.open_block = Some(OpenBlock::ToolUse);
            }
            NeutralEvent::ToolInputDelta { json_fragment } => {
                out.push(StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: json_fragment,
                    },
                });
            }
            NeutralEvent::ToolInputEnd => self.close(&mut out),

            NeutralEvent::ToolCall {
                id,
                tool_name,
                input,
            } => {
                // One-shot: open the block with the complete input and stop
                // it immediately.
                self.close_if_open(&mut out);
                out.push(StreamEvent::ContentBlockStart {
                    index: self.block_index,
                    content_block: tool_use_block(id, tool_name, input),
                });
                out.push(StreamEvent::ContentBlockStop {
                    index: self.block_index,
                });
                self.block_index += 1;
            }

            NeutralEvent::StepFinish { reason, usage } => {
                self.close_if_open(&mut out);
                out.push(StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(map_finish_reason(&reason)),
                        stop_sequence: None,
                    },
                    usage: wire_usage(usage),
                });
            }

            NeutralEvent::Finish => {
                out.push(StreamEvent::MessageStop);
            }

            NeutralEvent::Error(error) => {
                // The HTTP status is immutable at this point; only the body
                // kind survives as an inline event.
                let (_, detail) = classify(&error);
                out.push(StreamEvent::Error { error: detail });
            }
        }

        out
    }

    fn open(&mut self, kind: OpenBlock, out: &mut Vec<StreamEvent>) {
        self.close_if_open(out);

        let content_block = match kind {
            OpenBlock::Text => ContentBlock::Text {
                text: String::new(),
                cache_control: None,
            },
            OpenBlock::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
                cache_control: None,
            },
            OpenBlock::ToolUse => unreachable!("tool blocks open through ToolInputStart"),
        };

        out.push(StreamEvent::ContentBlockStart {
            index: self.block_index,
            content_block,
        });
        self.open_block = Some(kind);
    }

    /// Drivers always announce starts, but a delta arriving first must not
    /// corrupt the index discipline.
    fn ensure_open(&mut self, kind: OpenBlock, out: &mut Vec<StreamEvent>) {
        if self.open_block != Some(kind) {
            self.open(kind, out);
        }
    }

    fn close(&mut self, out: &mut Vec<StreamEvent>) {
        out.push(StreamEvent::ContentBlockStop {
            index: self.block_index,
        });
        self.block_index += 1;
        self.open_block = None;
    }

    fn close_if_open(&mut self, out: &mut Vec<StreamEvent>) {
        if self.open_block.is_some() {
            self.close(out);
        }
    }
}

/// Collects a full neutral event stream into a single response body for
/// `stream: false` requests. The driver is still consumed event by event;
/// only the client-facing write is deferred.
pub struct ResponseCollector {
    parts: Vec<Part>,
    text_buffer: Option<String>,
    reasoning_buffer: Option<String>,
    tool_buffer: Option<ToolBuffer>,
    usage: NeutralUsage,
    finish_reason: FinishReason,
    error: Option<DriverError>,
}

struct ToolBuffer {
    id: String,
    tool_name: String,
    json: String,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            text_buffer: None,
            reasoning_buffer: None,
            tool_buffer: None,
            usage: NeutralUsage::default(),
            finish_reason: FinishReason::Stop,
            error: None,
        }
    }

    pub fn absorb(&mut self, event: NeutralEvent) {
        match event {
            NeutralEvent::StepStart | NeutralEvent::Finish => {}

            NeutralEvent::TextStart => self.text_buffer = Some(String::new()),
            NeutralEvent::TextDelta { text } => {
                self.text_buffer.get_or_insert_default().push_str(&text);
            }
            NeutralEvent::TextEnd => {
                if let Some(text) = self.text_buffer.take() {
                    self.parts.push(Part::text(text));
                }
            }

            NeutralEvent::ReasoningStart => self.reasoning_buffer = Some(String::new()),
            NeutralEvent::ReasoningDelta { text } => {
                self.reasoning_buffer
                    .get_or_insert_default()
                    .push_str(&text);
            }
            NeutralEvent::ReasoningEnd => {
                if let Some(text) = self.reasoning_buffer.take() {
                    self.parts.push(Part::new(PartKind::Reasoning { text }));
                }
            }

            NeutralEvent::ToolInputStart { id, tool_name } => {
                self.tool_buffer = Some(ToolBuffer {
                    id,
                    tool_name,
                    json: String::new(),
                });
            }
            NeutralEvent::ToolInputDelta { json_fragment } => {
                if let Some(buffer) = &mut self.tool_buffer {
                    buffer.json.push_str(&json_fragment);
                }
            }
            NeutralEvent::ToolInputEnd => {
                if let Some(buffer) = self.tool_buffer.take() {
                    self.parts.push(Part::new(PartKind::ToolCall {
                        call_id: buffer.id,
                        tool_name: buffer.tool_name,
                        input: parse_tool_input(&buffer.json),
                    }));
                }
            }

            NeutralEvent::ToolCall {
                id,
                tool_name,
                input,
            } => {
                self.parts.push(Part::new(PartKind::ToolCall {
                    call_id: id,
                    tool_name,
                    input,
                }));
            }

            NeutralEvent::StepFinish { reason, usage } => {
                self.finish_reason = reason;
                self.usage.input_tokens += usage.input_tokens;
                self.usage.output_tokens += usage.output_tokens;
                self.usage.cached_input_tokens += usage.cached_input_tokens;
            }

            NeutralEvent::Error(error) => {
                if self.error.is_none() {
                    self.error = Some(error);
                }
            }
        }
    }

    /// Assemble the buffered events into one response body.
    pub fn finish(mut self, model: &str, send_reasoning: bool) -> LlmResult<MessageResponse> {
        if let Some(error) = self.error.take() {
            return Err(error.mid_stream());
        }

        // Close anything a driver left dangling.
        if let Some(text) = self.text_buffer.take() {
            self.parts.push(Part::text(text));
        }
        if let Some(text) = self.reasoning_buffer.take() {
            self.parts.push(Part::new(PartKind::Reasoning { text }));
        }
        if let Some(buffer) = self.tool_buffer.take() {
            self.parts.push(Part::new(PartKind::ToolCall {
                call_id: buffer.id,
                tool_name: buffer.tool_name,
                input: parse_tool_input(&buffer.json),
            }));
        }

        let content = crate::messages::neutral::to_anthropic::render_assistant_content(
            &self.parts,
            crate::messages::neutral::to_anthropic::RenderOptions { send_reasoning },
        )?;

        Ok(MessageResponse {
            id: fresh_message_id(),
            response_type: "message".to_string(),
            role: Role::Assistant,
            content,
            model: model.to_string(),
            stop_reason: Some(map_finish_reason(&self.finish_reason)),
            stop_sequence: None,
            usage: wire_usage(self.usage),
        })
    }
}

impl Default for ResponseCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

fn tool_use_block(id: String, name: String, input: Value) -> ContentBlock {
    ContentBlock::ToolUse {
        id,
        name,
        input,
        cache_control: None,
    }
}

fn map_finish_reason(reason: &FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::Other(_) => StopReason::Unknown,
    }
}

/// Only Anthropic itself reports cache creation; every other backend at
/// most exposes read hits.
fn wire_usage(usage: NeutralUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: usage.cached_input_tokens,
    }
}

/// Accumulated tool-call fragments are parsed leniently: an empty buffer is
/// an empty object, invalid JSON is preserved as a string payload.
fn parse_tool_input(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(Map::new());
    }

    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}
