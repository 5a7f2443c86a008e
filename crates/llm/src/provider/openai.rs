//! OpenAI chat-completions driver.
//!
//! Also services the `xai` and `azure` kinds: both speak the OpenAI wire
//! protocol and differ only in endpoint shape and authentication. The
//! OpenAI-specific hints (reasoning effort, service tier, parallel tool
//! calls) are injected for the `openai` kind only.

use std::collections::VecDeque;

use async_trait::async_trait;
use config::{ProviderConfig, ProviderType};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{DriverError, LlmError, LlmResult},
    media,
    messages::neutral::{
        FileData, FinishReason, NeutralEvent, NeutralTool, NeutralUsage, Part, PartKind,
        ResultContent, Role, ToolOutput,
    },
    provider::{Driver, EventStream, InvokeRequest, http_client},
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_XAI_API_URL: &str = "https://api.x.ai/v1";
const AZURE_API_VERSION: &str = "2024-10-21";

/// Markers used when tool results carry media no OpenAI role accepts.
const IMAGE_OMITTED: &str = "[image content omitted]";
const DOCUMENT_OMITTED: &str = "[document content omitted]";

pub(crate) struct OpenAiDriver {
    name: String,
    kind: ProviderType,
    api_key: SecretString,
    url: String,
}

impl OpenAiDriver {
    pub fn new(name: String, config: &ProviderConfig) -> anyhow::Result<Self> {
        let url = match config.r#type {
            ProviderType::Openai => format!(
                "{}/chat/completions",
                base_or(config, DEFAULT_OPENAI_API_URL)
            ),
            ProviderType::Xai => {
                format!("{}/chat/completions", base_or(config, DEFAULT_XAI_API_URL))
            }
            ProviderType::Azure => {
                // base_url points at the deployment root; the api-version
                // query is appended unless the caller already supplied one.
                let base = config
                    .base_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("azure providers require base_url"))?
                    .trim_end_matches('/');

                if base.contains('?') {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/chat/completions?api-version={AZURE_API_VERSION}")
                }
            }
            other => anyhow::bail!("unsupported kind {other:?} for the OpenAI driver"),
        };

        Ok(Self {
            name,
            kind: config.r#type,
            api_key: config.api_key.clone(),
            url,
        })
    }

    fn kind_str(&self) -> &'static str {
        match self.kind {
            ProviderType::Xai => "xai",
            ProviderType::Azure => "azure",
            _ => "openai",
        }
    }

    fn build_request(&self, request: &InvokeRequest) -> LlmResult<ChatRequest> {
        let mut messages = Vec::with_capacity(request.prompt.turns.len() + 1);

        if let Some(system) = request.prompt.flattened_system()? {
            messages.push(ChatMessage::System { content: system });
        }

        for turn in request.prompt.conversation_turns() {
            push_turn_messages(turn.role, &turn.parts, &mut messages);
        }

        let tools: Vec<ToolSpec> = request
            .tools
            .iter()
            .filter_map(|tool| match tool {
                NeutralTool::Function {
                    name,
                    description,
                    input_schema,
                } => Some(ToolSpec {
                    tool_type: "function",
                    function: FunctionSpec {
                        name: name.clone(),
                        description: description.clone(),
                        parameters: input_schema.clone(),
                    },
                }),
                NeutralTool::ProviderDefined(raw) => {
                    log::warn!(
                        "skipping Anthropic built-in tool '{}' for {}",
                        raw.get("name").and_then(Value::as_str).unwrap_or("?"),
                        self.kind_str()
                    );
                    None
                }
            })
            .collect();

        let openai_hints = self.kind == ProviderType::Openai;
        let has_tools = !tools.is_empty();

        Ok(ChatRequest {
            model: request.model.clone(),
            messages,
            max_completion_tokens: request.max_output_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: (!request.stop_sequences.is_empty()).then(|| request.stop_sequences.clone()),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            tools: has_tools.then_some(tools),
            // Always true for OpenAI whenever the request carries tools;
            // the API rejects the field on tool-less requests.
            parallel_tool_calls: (openai_hints && has_tools).then_some(true),
            reasoning_effort: openai_hints
                .then_some(request.hints.reasoning_effort)
                .flatten()
                .map(|effort| effort.as_str()),
            service_tier: openai_hints
                .then_some(request.hints.service_tier)
                .flatten()
                .map(|tier| tier.as_str()),
            user: request.user_id.clone(),
        })
    }
}

fn base_or<'a>(config: &'a ProviderConfig, default: &'a str) -> &'a str {
    config
        .base_url
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
}

#[async_trait]
impl Driver for OpenAiDriver {
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<EventStream> {
        let provider = self.kind_str();
        let body = self.build_request(&request)?;

        let payload = sonic_rs::to_vec(&body).map_err(|e| {
            LlmError::Internal(format!("failed to serialize {provider} request: {e}"))
        })?;

        let mut builder = http_client()
            .post(&self.url)
            .header("Content-Type", "application/json");

        builder = match self.kind {
            ProviderType::Azure => builder.header("api-key", self.api_key.expose_secret()),
            _ => builder.header(
                AUTHORIZATION,
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
        };

        let response = builder.body(payload).send().await.map_err(|e| {
            DriverError::transport(provider, format!("failed to send request: {e}")).upstream()
        })?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("{provider} API error ({status}): {body}");
            return Err(parse_upstream_error(provider, status.as_u16(), &body).upstream());
        }

        let state = StreamState {
            inner: response.bytes_stream().eventsource().boxed(),
            processor: ChunkProcessor::new(provider),
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
        self.kind
    }
}

struct StreamState {
    inner: futures::stream::BoxStream<
        'static,
        Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>,
    >,
    processor: ChunkProcessor,
    queue: VecDeque<NeutralEvent>,
}

fn push_turn_messages(role: Role, parts: &[Part], messages: &mut Vec<ChatMessage>) {
    match role {
        Role::System => {
            // Leading system turns are folded into the system message by
            // flattened_system; anything else was rejected earlier.
        }
        Role::User => {
            let mut user_parts = Vec::with_capacity(parts.len());

            for part in parts {
                match &part.kind {
                    PartKind::Text { text } => user_parts.push(UserPart::Text {
                        text: text.clone(),
                    }),
                    PartKind::File(file) => {
                        if file.media_type.starts_with("image/") {
                            let url = match &file.data {
                                FileData::Bytes(bytes) => {
                                    media::to_data_url(&file.media_type, bytes)
                                }
                                FileData::Url(url) => url.clone(),
                            };
                            user_parts.push(UserPart::ImageUrl {
                                image_url: ImageUrl { url },
                            });
                        } else {
                            log::warn!(
                                "dropping '{}' file part: chat completions only accepts images",
                                file.media_type
                            );
                            user_parts.push(UserPart::Text {
                                text: DOCUMENT_OMITTED.to_string(),
                            });
                        }
                    }
                    // Reasoning has no user-side wire position.
                    PartKind::Reasoning { .. } => {}
                    PartKind::ToolCall { .. } | PartKind::ToolResult { .. } => {}
                }
            }

            if user_parts.is_empty() {
                return;
            }

            // A single text part collapses to the string form.
            let content = match <[_; 1]>::try_from(user_parts) {
                Ok([UserPart::Text { text }]) => UserContent::Text(text),
                Ok([part]) => UserContent::Parts(vec![part]),
                Err(parts) => UserContent::Parts(parts),
            };

            messages.push(ChatMessage::User { content });
        }
        Role::Assistant => {
            let mut text = String::new();
            let mut tool_calls = Vec::new();

            for part in parts {
                match &part.kind {
                    PartKind::Text { text: t } => text.push_str(t),
                    PartKind::ToolCall {
                        call_id,
                        tool_name,
                        input,
                    } => tool_calls.push(ToolCallSpec {
                        id: call_id.clone(),
                        call_type: "function",
                        function: FunctionCallSpec {
                            name: tool_name.clone(),
                            arguments: compact_json(input),
                        },
                    }),
                    // Chain-of-thought is not replayed to OpenAI.
                    PartKind::Reasoning { .. } => {}
                    PartKind::File { .. } | PartKind::ToolResult { .. } => {}
                }
            }

            if text.is_empty() && tool_calls.is_empty() {
                return;
            }

            messages.push(ChatMessage::Assistant {
                content: (!text.is_empty()).then_some(text),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            });
        }
        Role::Tool => {
            for part in parts {
                if let PartKind::ToolResult {
                    call_id, output, ..
                } = &part.kind
                {
                    messages.push(ChatMessage::Tool {
                        tool_call_id: call_id.clone(),
                        content: render_tool_output(output),
                    });
                }
            }
        }
    }
}

fn render_tool_output(output: &ToolOutput) -> String {
    match output {
        ToolOutput::Text(text) | ToolOutput::ErrorText(text) => text.clone(),
        ToolOutput::Json(value) | ToolOutput::ErrorJson(value) => compact_json(value),
        ToolOutput::Content(items) => items
            .iter()
            .map(|item| match item {
                ResultContent::Text { text } => text.clone(),
                ResultContent::Media { media_type, .. } => {
                    if media_type.starts_with("image/") {
                        IMAGE_OMITTED.to_string()
                    } else {
                        DOCUMENT_OMITTED.to_string()
                    }
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// Parse an upstream error body into a classifiable driver error.
///
/// OpenAI reports 5xx with `type: "server_error"` and a null `code`; the
/// code falls back to the type so the classification table matches either
/// spelling. Rate limits arrive as `code: "rate_limit_exceeded"` with
/// `type` distinguishing `tokens` from `requests`.
fn parse_upstream_error(provider: &str, status: u16, body: &str) -> DriverError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorPayload,
    }

    match sonic_rs::from_str::<ErrorBody>(body) {
        Ok(parsed) => DriverError {
            provider: provider.to_string(),
            code: parsed.error.code.clone().or_else(|| parsed.error.error_type.clone()),
            error_type: parsed.error.error_type,
            message: parsed.error.message,
            status: Some(status),
            transport: false,
            raw: serde_json::from_str(body).ok(),
        },
        Err(_) => DriverError {
            provider: provider.to_string(),
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

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// State machine turning OpenAI stream chunks into neutral events.
///
/// OpenAI interleaves role announcements, content deltas, incremental tool
/// calls, a finish-reason chunk and a final usage-only chunk; the processor
/// tracks which neutral block is open so starts and ends come out paired.
struct ChunkProcessor {
    provider: &'static str,
    started: bool,
    text_open: bool,
    reasoning_open: bool,
    tool_open: bool,
    seen_tool_call: bool,
    finish_reason: Option<String>,
    usage: NeutralUsage,
    done: bool,
}

impl ChunkProcessor {
    fn new(provider: &'static str) -> Self {
        Self {
            provider,
            started: false,
            text_open: false,
            reasoning_open: false,
            tool_open: false,
            seen_tool_call: false,
            finish_reason: None,
            usage: NeutralUsage::default(),
            done: false,
        }
    }

    fn handle(&mut self, data: &str) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }

        if data == "[DONE]" {
            return self.finish();
        }

        // Mid-stream errors arrive as a bare error object. They must be
        // probed first: the chunk shape is fully defaulted, so an error
        // object would otherwise parse as an empty chunk and vanish.
        if let Ok(error) = sonic_rs::from_str::<StreamErrorChunk>(data) {
            self.done = true;
            return vec![NeutralEvent::Error(DriverError {
                provider: self.provider.to_string(),
                code: error.error.code.clone().or_else(|| error.error.error_type.clone()),
                error_type: error.error.error_type,
                message: error.error.message,
                status: None,
                transport: false,
                raw: serde_json::from_str(data).ok(),
            })];
        }

        let chunk = match sonic_rs::from_str::<StreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(_) => {
                log::warn!("failed to parse {} stream chunk", self.provider);
                return Vec::new();
            }
        };

        let mut out = Vec::new();

        if !self.started {
            self.started = true;
            out.push(NeutralEvent::StepStart);
        }

        if let Some(usage) = chunk.usage {
            self.usage = NeutralUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cached_input_tokens: usage
                    .prompt_tokens_details
                    .map(|details| details.cached_tokens)
                    .unwrap_or(0),
            };
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                self.open_reasoning(&mut out);
                out.push(NeutralEvent::ReasoningDelta { text: reasoning });
            }

            if let Some(content) = choice.delta.content
                && !content.is_empty()
            {
                self.open_text(&mut out);
                out.push(NeutralEvent::TextDelta { text: content });
            }

            for tool_call in choice.delta.tool_calls.unwrap_or_default() {
                self.handle_tool_delta(tool_call, &mut out);
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        out
    }

    fn handle_tool_delta(&mut self, tool_call: ToolCallDelta, out: &mut Vec<NeutralEvent>) {
        let starts_new_call = tool_call
            .function
            .as_ref()
            .is_some_and(|function| function.name.is_some());

        if starts_new_call {
            self.close_open_blocks(out);

            let function = tool_call.function.as_ref();
            out.push(NeutralEvent::ToolInputStart {
                id: tool_call
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                tool_name: function
                    .and_then(|f| f.name.clone())
                    .unwrap_or_default(),
            });
            self.tool_open = true;
            self.seen_tool_call = true;
        }

        if let Some(arguments) = tool_call.function.and_then(|function| function.arguments)
            && !arguments.is_empty()
            && self.tool_open
        {
            out.push(NeutralEvent::ToolInputDelta {
                json_fragment: arguments,
            });
        }
    }

    fn fail(&mut self, message: String) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        vec![NeutralEvent::Error(DriverError::transport(
            self.provider,
            message,
        ))]
    }

    /// The upstream closed the stream without a `[DONE]` marker; settle
    /// with whatever state was gathered.
    fn end_of_stream(&mut self) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }
        self.finish()
    }

    fn finish(&mut self) -> Vec<NeutralEvent> {
        self.done = true;

        let mut out = Vec::new();
        self.close_open_blocks(&mut out);

        let reason = match self.finish_reason.as_deref() {
            Some("stop") | None => {
                if self.seen_tool_call {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                }
            }
            Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
            Some("length") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
        };

        out.push(NeutralEvent::StepFinish {
            reason,
            usage: self.usage,
        });
        out.push(NeutralEvent::Finish);
        out
    }

    fn open_text(&mut self, out: &mut Vec<NeutralEvent>) {
        if !self.text_open {
            self.close_open_blocks(out);
            out.push(NeutralEvent::TextStart);
            self.text_open = true;
        }
    }

    fn open_reasoning(&mut self, out: &mut Vec<NeutralEvent>) {
        if !self.reasoning_open {
            self.close_open_blocks(out);
            out.push(NeutralEvent::ReasoningStart);
            self.reasoning_open = true;
        }
    }

    fn close_open_blocks(&mut self, out: &mut Vec<NeutralEvent>) {
        if self.text_open {
            out.push(NeutralEvent::TextEnd);
            self.text_open = false;
        }
        if self.reasoning_open {
            out.push(NeutralEvent::ReasoningEnd);
            self.reasoning_open = false;
        }
        if self.tool_open {
            out.push(NeutralEvent::ToolInputEnd);
            self.tool_open = false;
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaPayload,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    content: Option<String>,
    /// Streamed chain-of-thought on OpenAI-compatible backends (xAI).
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamErrorChunk {
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_tier: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallSpec>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum UserContent {
    Text(String),
    Parts(Vec<UserPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ToolCallSpec {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: FunctionCallSpec,
}

#[derive(Debug, Serialize)]
struct FunctionCallSpec {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ToolSpec {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: FunctionSpec,
}

#[derive(Debug, Serialize)]
struct FunctionSpec {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::neutral::{NeutralPrompt, Turn};
    use crate::provider::ProviderHints;
    use config::{ReasoningEffort, ServiceTier};
    use secrecy::SecretString;
    use serde_json::json;

    fn driver(kind: ProviderType, base_url: Option<&str>) -> OpenAiDriver {
        let config = ProviderConfig {
            r#type: kind,
            api_key: SecretString::from("test-key".to_string()),
            base_url: base_url.map(str::to_string),
        };
        OpenAiDriver::new("test".to_string(), &config).unwrap()
    }

    fn invoke_request() -> InvokeRequest {
        InvokeRequest {
            model: "gpt-4o-mini".to_string(),
            prompt: NeutralPrompt {
                system: Some("Be helpful.".to_string()),
                turns: vec![
                    Turn::new(Role::User, vec![Part::text("find docs")]),
                    Turn::new(
                        Role::Assistant,
                        vec![
                            Part::text("Searching."),
                            Part::new(PartKind::ToolCall {
                                call_id: "call_1".to_string(),
                                tool_name: "search".to_string(),
                                input: json!({"q": "docs"}),
                            }),
                        ],
                    ),
                    Turn::new(
                        Role::Tool,
                        vec![Part::new(PartKind::ToolResult {
                            call_id: "call_1".to_string(),
                            tool_name: "search".to_string(),
                            output: ToolOutput::Text("two results".to_string()),
                        })],
                    ),
                ],
            },
            tools: vec![NeutralTool::Function {
                name: "search".to_string(),
                description: Some("find things".to_string()),
                input_schema: json!({"type": "object", "additionalProperties": false}),
            }],
            max_output_tokens: 1024,
            temperature: Some(0.5),
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            user_id: Some("user-7".to_string()),
            hints: ProviderHints {
                reasoning_effort: Some(ReasoningEffort::Low),
                service_tier: Some(ServiceTier::Flex),
            },
        }
    }

    #[test]
    fn request_shape_for_openai() {
        let request = driver(ProviderType::Openai, None)
            .build_request(&invoke_request())
            .unwrap();

        insta::assert_json_snapshot!(request, @r#"
        {
          "model": "gpt-4o-mini",
          "messages": [
            {
              "role": "system",
              "content": "Be helpful."
            },
            {
              "role": "user",
              "content": "find docs"
            },
            {
              "role": "assistant",
              "content": "Searching.",
              "tool_calls": [
                {
                  "id": "call_1",
                  "type": "function",
                  "function": {
                    "name": "search",
                    "arguments": "{\"q\":\"docs\"}"
                  }
                }
              ]
            },
            {
              "role": "tool",
              "tool_call_id": "call_1",
              "content": "two results"
            }
          ],
          "max_completion_tokens": 1024,
          "temperature": 0.5,
          "stream": true,
          "stream_options": {
            "include_usage": true
          },
          "tools": [
            {
              "type": "function",
              "function": {
                "name": "search",
                "description": "find things",
                "parameters": {
                  "type": "object",
                  "additionalProperties": false
                }
              }
            }
          ],
          "parallel_tool_calls": true,
          "reasoning_effort": "low",
          "service_tier": "flex",
          "user": "user-7"
        }
        "#);
    }

    #[test]
    fn xai_receives_no_openai_hints() {
        let request = driver(ProviderType::Xai, None)
            .build_request(&invoke_request())
            .unwrap();

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("reasoning_effort").is_none());
        assert!(json.get("service_tier").is_none());
        assert!(json.get("parallel_tool_calls").is_none());
    }

    #[test]
    fn azure_url_gets_api_version_and_api_key_auth() {
        let driver = driver(
            ProviderType::Azure,
            Some("https://res.openai.azure.com/openai/deployments/gpt4o"),
        );

        assert_eq!(
            driver.url,
            "https://res.openai.azure.com/openai/deployments/gpt4o/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn image_bytes_become_data_urls() {
        let mut request = invoke_request();
        request.prompt.turns = vec![Turn::new(
            Role::User,
            vec![Part::new(PartKind::File(crate::messages::neutral::FilePart {
                data: FileData::Bytes(vec![0xFF, 0xD8, 0xFF]),
                media_type: "image/jpeg".to_string(),
                filename: None,
            }))],
        )];

        let built = driver(ProviderType::Openai, None).build_request(&request).unwrap();
        let json = serde_json::to_value(&built).unwrap();

        let url = json["messages"][1]["content"][0]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn stream_chunks_translate_to_neutral_events() {
        let mut processor = ChunkProcessor::new("openai");
        let mut events = Vec::new();

        for data in [
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":" there"}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"search","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":\"x\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":50,"completion_tokens":9,"prompt_tokens_details":{"cached_tokens":30}}}"#,
            "[DONE]",
        ] {
            events.extend(processor.handle(data));
        }

        let shapes: Vec<&'static str> = events
            .iter()
            .map(|event| match event {
                NeutralEvent::StepStart => "step-start",
                NeutralEvent::TextStart => "text-start",
                NeutralEvent::TextDelta { .. } => "text-delta",
                NeutralEvent::TextEnd => "text-end",
                NeutralEvent::ToolInputStart { .. } => "tool-input-start",
                NeutralEvent::ToolInputDelta { .. } => "tool-input-delta",
                NeutralEvent::ToolInputEnd => "tool-input-end",
                NeutralEvent::StepFinish { .. } => "step-finish",
                NeutralEvent::Finish => "finish",
                _ => "other",
            })
            .collect();

        assert_eq!(
            shapes,
            vec![
                "step-start",
                "text-start",
                "text-delta",
                "text-delta",
                "text-end",
                "tool-input-start",
                "tool-input-delta",
                "tool-input-end",
                "step-finish",
                "finish"
            ]
        );

        let NeutralEvent::StepFinish { reason, usage } = &events[8] else {
            unreachable!("expected step-finish");
        };
        assert_eq!(*reason, FinishReason::ToolCalls);
        assert_eq!(usage.input_tokens, 50);
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.cached_input_tokens, 30);
    }

    #[test]
    fn midstream_error_chunk_becomes_error_event() {
        let mut processor = ChunkProcessor::new("openai");

        let events = processor.handle(
            r#"{"error":{"message":"The server had an error","type":"server_error","code":null}}"#,
        );

        let [NeutralEvent::Error(error)] = events.as_slice() else {
            unreachable!("expected a single error event");
        };
        assert_eq!(error.provider, "openai");
        assert_eq!(error.code.as_deref(), Some("server_error"));

        // Nothing more after a terminal error.
        assert!(processor.handle("[DONE]").is_empty());
    }

    #[test]
    fn upstream_429_parses_code_and_type() {
        let error = parse_upstream_error(
            "openai",
            429,
            r#"{"error":{"message":"Rate limit reached for tokens","type":"tokens","code":"rate_limit_exceeded"}}"#,
        );

        assert_eq!(error.code.as_deref(), Some("rate_limit_exceeded"));
        assert_eq!(error.error_type.as_deref(), Some("tokens"));
        assert_eq!(error.status, Some(429));
        assert!(!error.transport);
    }

    #[test]
    fn unparseable_error_body_is_preserved_as_message() {
        let error = parse_upstream_error("azure", 502, "Bad gateway");

        assert_eq!(error.message, "Bad gateway");
        assert!(error.code.is_none());
    }
}
