//! Anthropic Messages driver.
//!
//! The passthrough backend: the neutral prompt is rendered back into a
//! native Messages request so `anthropic/<model>` behaves exactly like the
//! foreign providers, hint handling and error mapping included. The
//! upstream is always asked to stream; the non-streaming client path
//! collects the events downstream.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use config::{ProviderConfig, ProviderType};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{DriverError, LlmError, LlmResult},
    messages::{
        anthropic::{
            ContentBlock, ContentDelta, CustomTool, ErrorResponse, MessagesRequest, Metadata,
            StopReason, StreamEvent, SystemPrompt, ToolDeclaration,
        },
        neutral::{
            FinishReason, NeutralEvent, NeutralTool, NeutralUsage,
            to_anthropic::{RenderOptions, render_conversation},
        },
    },
    provider::{Driver, EventStream, InvokeRequest, http_client},
};

const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) struct AnthropicDriver {
    name: String,
    api_key: SecretString,
    base_url: String,
}

impl AnthropicDriver {
    pub fn new(name: String, config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_ANTHROPIC_API_URL)
            .trim_end_matches('/')
            .to_string();

        Self {
            name,
            api_key: config.api_key.clone(),
            base_url,
        }
    }

    /// Rebuild a native Messages request. Returns the request plus the
    /// beta capabilities the rendered content requires.
    fn build_request(
        &self,
        request: &InvokeRequest,
    ) -> LlmResult<(MessagesRequest, Option<String>)> {
        let system = request.prompt.flattened_system()?;
        let rendered = render_conversation(
            &request.prompt,
            RenderOptions {
                send_reasoning: true,
            },
        )?;

        let tools: Vec<ToolDeclaration> = request
            .tools
            .iter()
            .map(|tool| match tool {
                NeutralTool::Function {
                    name,
                    description,
                    input_schema,
                } => ToolDeclaration::Custom(CustomTool {
                    name: name.clone(),
                    description: description.clone(),
                    input_schema: input_schema.clone(),
                    cache_control: None,
                }),
                NeutralTool::ProviderDefined(raw) => ToolDeclaration::Builtin(raw.clone()),
            })
            .collect();

        let betas = (!rendered.betas.is_empty())
            .then(|| rendered.betas.into_iter().collect::<Vec<_>>().join(","));

        let messages_request = MessagesRequest {
            model: request.model.clone(),
            max_tokens: request.max_output_tokens,
            messages: rendered.messages,
            system: system.map(SystemPrompt::Text),
            tools: (!tools.is_empty()).then_some(tools),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: (!request.stop_sequences.is_empty())
                .then(|| request.stop_sequences.clone()),
            stream: Some(true),
            metadata: request.user_id.clone().map(|user_id| Metadata {
                user_id: Some(user_id),
            }),
        };

        Ok((messages_request, betas))
    }
}

#[async_trait]
impl Driver for AnthropicDriver {
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<EventStream> {
        let (body, betas) = self.build_request(&request)?;

        let payload = sonic_rs::to_vec(&body)
            .map_err(|e| LlmError::Internal(format!("failed to serialize anthropic request: {e}")))?;

        let mut builder = http_client()
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");

        if let Some(betas) = betas {
            builder = builder.header("anthropic-beta", betas);
        }

        let response = builder.body(payload).send().await.map_err(|e| {
            DriverError::transport("anthropic", format!("failed to send request: {e}")).upstream()
        })?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("anthropic API error ({status}): {body}");
            return Err(parse_upstream_error(status.as_u16(), &body).upstream());
        }

        let state = StreamState {
            inner: response.bytes_stream().eventsource().boxed(),
            processor: SseProcessor::new(),
            queue: VecDeque::new(),
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    return Some((event, state));
                }

                match state.inner.next().await {
                    Some(Ok(event)) => state.queue.extend(state.processor.handle(&event.data)),
                    Some(Err(error)) => {
                        state.queue.extend(state.processor.fail(error.to_string()));
                    }
                    None => {
                        state.queue.extend(state.processor.end_of_stream());
                        if state.queue.is_empty() {
                            return None;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderType {
        ProviderType::Anthropic
    }
}

struct StreamState {
    inner: futures::stream::BoxStream<
        'static,
        Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>,
    >,
    processor: SseProcessor,
    queue: VecDeque<NeutralEvent>,
}

fn parse_upstream_error(status: u16, body: &str) -> DriverError {
    match sonic_rs::from_str::<ErrorResponse>(body) {
        Ok(parsed) => DriverError {
            provider: "anthropic".to_string(),
            code: Some(parsed.error.error_type.clone()),
            error_type: Some(parsed.error.error_type),
            message: parsed.error.message,
            status: Some(status),
            transport: false,
            raw: serde_json::from_str(body).ok(),
        },
        Err(_) => DriverError {
            provider: "anthropic".to_string(),
            code: None,
            error_type: None,
            message: if body.is_empty() {
                format!("upstream returned status {status}")
            } else {
                body.to_string()
            },
            status: Some(status),
            transport: false,
            raw: None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Translates Anthropic SSE events into neutral events, tracking which
/// block kind is open at each index so deltas dispatch correctly.
struct SseProcessor {
    open_blocks: HashMap<u32, BlockKind>,
    usage: NeutralUsage,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl SseProcessor {
    fn new() -> Self {
        Self {
            open_blocks: HashMap::new(),
            usage: NeutralUsage::default(),
            stop_reason: None,
            done: false,
        }
    }

    fn handle(&mut self, data: &str) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }

        let event = match sonic_rs::from_str::<StreamEvent>(data) {
            Ok(event) => event,
            Err(_) => {
                log::warn!("failed to parse anthropic stream event");
                return Vec::new();
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                self.usage.cached_input_tokens = message.usage.cache_read_input_tokens;
                vec![NeutralEvent::StepStart]
            }

            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text, .. } => {
                    self.open_blocks.insert(index, BlockKind::Text);
                    let mut out = vec![NeutralEvent::TextStart];
                    if !text.is_empty() {
                        out.push(NeutralEvent::TextDelta { text });
                    }
                    out
                }
                ContentBlock::Thinking { thinking, .. } => {
                    self.open_blocks.insert(index, BlockKind::Thinking);
                    let mut out = vec![NeutralEvent::ReasoningStart];
                    if !thinking.is_empty() {
                        out.push(NeutralEvent::ReasoningDelta { text: thinking });
                    }
                    out
                }
                ContentBlock::RedactedThinking { data, .. } => {
                    self.open_blocks.insert(index, BlockKind::Thinking);
                    vec![
                        NeutralEvent::ReasoningStart,
                        NeutralEvent::ReasoningDelta { text: data },
                    ]
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    self.open_blocks.insert(index, BlockKind::ToolUse);
                    vec![NeutralEvent::ToolInputStart { id, tool_name: name }]
                }
                other => {
                    log::warn!("unexpected content block in anthropic stream: {other:?}");
                    Vec::new()
                }
            },

            StreamEvent::ContentBlockDelta { index, delta } => {
                let kind = self.open_blocks.get(&index).copied();
                match delta {
                    ContentDelta::TextDelta { text } => match kind {
                        Some(BlockKind::Thinking) => vec![NeutralEvent::ReasoningDelta { text }],
                        _ => vec![NeutralEvent::TextDelta { text }],
                    },
                    ContentDelta::ThinkingDelta { thinking } => {
                        vec![NeutralEvent::ReasoningDelta { text: thinking }]
                    }
                    ContentDelta::InputJsonDelta { partial_json } => {
                        vec![NeutralEvent::ToolInputDelta {
                            json_fragment: partial_json,
                        }]
                    }
                    ContentDelta::SignatureDelta { .. } => Vec::new(),
                }
            }

            StreamEvent::ContentBlockStop { index } => {
                match self.open_blocks.remove(&index) {
                    Some(BlockKind::Text) => vec![NeutralEvent::TextEnd],
                    Some(BlockKind::Thinking) => vec![NeutralEvent::ReasoningEnd],
                    Some(BlockKind::ToolUse) => vec![NeutralEvent::ToolInputEnd],
                    None => Vec::new(),
                }
            }

            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                self.usage.output_tokens = usage.output_tokens;
                if usage.input_tokens > 0 {
                    self.usage.input_tokens = usage.input_tokens;
                }
                if usage.cache_read_input_tokens > 0 {
                    self.usage.cached_input_tokens = usage.cache_read_input_tokens;
                }
                Vec::new()
            }

            StreamEvent::MessageStop => {
                self.done = true;
                vec![
                    NeutralEvent::StepFinish {
                        reason: self.finish_reason(),
                        usage: self.usage,
                    },
                    NeutralEvent::Finish,
                ]
            }

            StreamEvent::Ping => Vec::new(),

            StreamEvent::Error { error } => {
                self.done = true;
                vec![NeutralEvent::Error(DriverError {
                    provider: "anthropic".to_string(),
                    code: Some(error.error_type.clone()),
                    error_type: Some(error.error_type),
                    message: error.message,
                    status: None,
                    transport: false,
                    raw: None,
                })]
            }
        }
    }

    fn fail(&mut self, message: String) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        vec![NeutralEvent::Error(DriverError::transport(
            "anthropic",
            message,
        ))]
    }

    /// The upstream closed without `message_stop`; settle with what we have.
    fn end_of_stream(&mut self) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        vec![
            NeutralEvent::StepFinish {
                reason: self.finish_reason(),
                usage: self.usage,
            },
            NeutralEvent::Finish,
        ]
    }

    fn finish_reason(&self) -> FinishReason {
        match &self.stop_reason {
            Some(StopReason::EndTurn) | Some(StopReason::StopSequence) | None => FinishReason::Stop,
            Some(StopReason::ToolUse) => FinishReason::ToolCalls,
            Some(StopReason::MaxTokens) => FinishReason::Length,
            Some(StopReason::Unknown) => FinishReason::Other("unknown".to_string()),
            Some(StopReason::Other(other)) => FinishReason::Other(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::neutral::{NeutralPrompt, Part, PartKind, Role, ToolOutput, Turn};
    use crate::provider::ProviderHints;
    use serde_json::json;

    fn driver() -> AnthropicDriver {
        AnthropicDriver::new(
            "anthropic".to_string(),
            &ProviderConfig {
                r#type: ProviderType::Anthropic,
                api_key: SecretString::from("test-key".to_string()),
                base_url: None,
            },
        )
    }

    fn invoke_request(prompt: NeutralPrompt) -> InvokeRequest {
        InvokeRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            prompt,
            tools: Vec::new(),
            max_output_tokens: 2048,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            user_id: Some("user-1".to_string()),
            hints: ProviderHints::default(),
        }
    }

    #[test]
    fn rebuilds_native_request_with_prefill_trim() {
        let prompt = NeutralPrompt {
            system: Some("Stay factual.".to_string()),
            turns: vec![
                Turn::new(Role::User, vec![Part::text("finish this")]),
                Turn::new(Role::Assistant, vec![Part::text("The answer is  ")]),
            ],
        };

        let (request, betas) = driver().build_request(&invoke_request(prompt)).unwrap();

        assert!(betas.is_none());
        assert!(matches!(
            &request.system,
            Some(SystemPrompt::Text(text)) if text == "Stay factual."
        ));
        assert_eq!(request.stream, Some(true));
        assert_eq!(
            request.metadata.as_ref().and_then(|m| m.user_id.as_deref()),
            Some("user-1")
        );

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json["messages"][1]["content"][0]["text"],
            "The answer is"
        );
    }

    #[test]
    fn tool_results_render_into_user_messages() {
        let prompt = NeutralPrompt {
            system: None,
            turns: vec![
                Turn::new(
                    Role::Assistant,
                    vec![Part::new(PartKind::ToolCall {
                        call_id: "toolu_1".to_string(),
                        tool_name: "bash".to_string(),
                        input: json!({"command": "ls"}),
                    })],
                ),
                Turn::new(
                    Role::Tool,
                    vec![Part::new(PartKind::ToolResult {
                        call_id: "toolu_1".to_string(),
                        tool_name: "bash".to_string(),
                        output: ToolOutput::Text("src tests".to_string()),
                    })],
                ),
            ],
        };

        let (request, _) = driver().build_request(&invoke_request(prompt)).unwrap();
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(
            json["messages"][1]["content"][0]["type"],
            "tool_result"
        );
        assert_eq!(
            json["messages"][1]["content"][0]["tool_use_id"],
            "toolu_1"
        );
    }

    #[test]
    fn sse_events_translate_to_neutral_stream() {
        let mut processor = SseProcessor::new();
        let mut events = Vec::new();

        for data in [
            r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude-sonnet-4-20250514","stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":25,"output_tokens":1,"cache_read_input_tokens":10}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"let me see"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"bash","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":\"ls\"}"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use","stop_sequence":null},"usage":{"output_tokens":30}}"#,
            r#"{"type":"message_stop"}"#,
        ] {
            events.extend(processor.handle(data));
        }

        assert!(matches!(events[0], NeutralEvent::StepStart));
        assert!(matches!(events[1], NeutralEvent::ReasoningStart));
        assert!(
            matches!(&events[2], NeutralEvent::ReasoningDelta { text } if text == "let me see")
        );
        assert!(matches!(events[3], NeutralEvent::ReasoningEnd));
        assert!(matches!(
            &events[4],
            NeutralEvent::ToolInputStart { id, tool_name } if id == "toolu_9" && tool_name == "bash"
        ));
        assert!(matches!(&events[5], NeutralEvent::ToolInputDelta { .. }));
        assert!(matches!(events[6], NeutralEvent::ToolInputEnd));

        let NeutralEvent::StepFinish { reason, usage } = &events[7] else {
            unreachable!("expected step-finish");
        };
        assert_eq!(*reason, FinishReason::ToolCalls);
        assert_eq!(usage.input_tokens, 25);
        assert_eq!(usage.output_tokens, 30);
        assert_eq!(usage.cached_input_tokens, 10);
        assert!(matches!(events[8], NeutralEvent::Finish));
    }

    #[test]
    fn upstream_error_event_keeps_its_type() {
        let mut processor = SseProcessor::new();

        let events = processor.handle(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );

        let [NeutralEvent::Error(error)] = events.as_slice() else {
            unreachable!("expected error event");
        };
        assert_eq!(error.provider, "anthropic");
        assert_eq!(error.code.as_deref(), Some("overloaded_error"));
    }

    #[test]
    fn upstream_error_body_parses_into_driver_error() {
        let error = parse_upstream_error(
            400,
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens required"}}"#,
        );

        assert_eq!(error.code.as_deref(), Some("invalid_request_error"));
        assert_eq!(error.message, "max_tokens required");
    }
}
