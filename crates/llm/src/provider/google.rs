//! Google Gemini generateContent driver.

use std::collections::VecDeque;

use async_trait::async_trait;
use config::{ProviderConfig, ProviderType};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    error::{DriverError, LlmResult},
    media,
    messages::neutral::{
        FileData, FinishReason, NeutralEvent, NeutralTool, NeutralUsage, Part, PartKind,
        ResultContent, Role, ToolOutput,
    },
    provider::{Driver, EventStream, InvokeRequest, http_client},
};

const DEFAULT_GOOGLE_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub(crate) struct GoogleDriver {
    name: String,
    api_key: SecretString,
    base_url: String,
}

impl GoogleDriver {
    pub fn new(name: String, config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_GOOGLE_API_URL)
            .trim_end_matches('/')
            .to_string();

        Self {
            name,
            api_key: config.api_key.clone(),
            base_url,
        }
    }

    fn build_request(&self, request: &InvokeRequest) -> LlmResult<GenerateRequest> {
        let system_instruction = request.prompt.flattened_system()?.map(|text| Content {
            role: None,
            parts: vec![GooglePart::Text { text }],
        });

        let mut contents = Vec::with_capacity(request.prompt.turns.len());

        for turn in request.prompt.conversation_turns() {
            if let Some(content) = build_content(turn.role, &turn.parts) {
                contents.push(content);
            }
        }

        let declarations: Vec<FunctionDeclaration> = request
            .tools
            .iter()
            .filter_map(|tool| match tool {
                NeutralTool::Function {
                    name,
                    description,
                    input_schema,
                } => Some(FunctionDeclaration {
                    name: name.clone(),
                    description: description.clone(),
                    // Schemas arrive already rewritten for Gemini's dialect.
                    parameters: Some(input_schema.clone()),
                }),
                NeutralTool::ProviderDefined(raw) => {
                    log::warn!(
                        "skipping Anthropic built-in tool '{}' for google",
                        raw.get("name").and_then(Value::as_str).unwrap_or("?")
                    );
                    None
                }
            })
            .collect();

        Ok(GenerateRequest {
            system_instruction,
            contents,
            tools: (!declarations.is_empty()).then(|| {
                vec![Tool {
                    function_declarations: declarations,
                }]
            }),
            generation_config: GenerationConfig {
                max_output_tokens: request.max_output_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
                stop_sequences: (!request.stop_sequences.is_empty())
                    .then(|| request.stop_sequences.clone()),
            },
        })
    }
}

#[async_trait]
impl Driver for GoogleDriver {
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<EventStream> {
        let body = self.build_request(&request)?;
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );

        let response = http_client()
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                DriverError::transport("google", format!("failed to send request: {e}")).upstream()
            })?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("google API error ({status}): {body}");
            return Err(parse_upstream_error(status.as_u16(), &body).upstream());
        }

        let state = StreamState {
            inner: response.bytes_stream().eventsource().boxed(),
            processor: ChunkProcessor::new(),
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
        ProviderType::Google
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

fn build_content(role: Role, parts: &[Part]) -> Option<Content> {
    let (google_role, google_parts) = match role {
        Role::System => return None,
        Role::User => {
            let parts: Vec<GooglePart> = parts
                .iter()
                .filter_map(|part| match &part.kind {
                    PartKind::Text { text } => Some(GooglePart::Text { text: text.clone() }),
                    PartKind::File(file) => Some(match &file.data {
                        FileData::Bytes(bytes) => GooglePart::InlineData {
                            inline_data: Blob {
                                mime_type: file.media_type.clone(),
                                data: media::encode_base64(bytes),
                            },
                        },
                        FileData::Url(url) => GooglePart::FileData {
                            file_data: FileRef {
                                mime_type: file.media_type.clone(),
                                file_uri: url.clone(),
                            },
                        },
                    }),
                    _ => None,
                })
                .collect();
            ("user", parts)
        }
        Role::Assistant => {
            let parts: Vec<GooglePart> = parts
                .iter()
                .filter_map(|part| match &part.kind {
                    PartKind::Text { text } => Some(GooglePart::Text { text: text.clone() }),
                    PartKind::ToolCall {
                        tool_name, input, ..
                    } => Some(GooglePart::FunctionCall {
                        function_call: FunctionCall {
                            name: tool_name.clone(),
                            args: input.clone(),
                        },
                    }),
                    // Gemini thought signatures are not round-tripped.
                    _ => None,
                })
                .collect();
            ("model", parts)
        }
        Role::Tool => {
            let parts: Vec<GooglePart> = parts
                .iter()
                .filter_map(|part| match &part.kind {
                    PartKind::ToolResult {
                        tool_name, output, ..
                    } => Some(GooglePart::FunctionResponse {
                        function_response: FunctionResponse {
                            name: tool_name.clone(),
                            response: render_tool_output(output),
                        },
                    }),
                    _ => None,
                })
                .collect();
            ("user", parts)
        }
    };

    if google_parts.is_empty() {
        return None;
    }

    Some(Content {
        role: Some(google_role),
        parts: google_parts,
    })
}

/// Gemini requires function responses to be JSON objects.
fn render_tool_output(output: &ToolOutput) -> Value {
    match output {
        ToolOutput::Text(text) => json!({"output": text}),
        ToolOutput::ErrorText(text) => json!({"error": text}),
        ToolOutput::Json(value) => wrap_object(value.clone(), "output"),
        ToolOutput::ErrorJson(value) => wrap_object(value.clone(), "error"),
        ToolOutput::Content(items) => {
            let text = items
                .iter()
                .filter_map(|item| match item {
                    ResultContent::Text { text } => Some(text.as_str()),
                    ResultContent::Media { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            json!({"output": text})
        }
    }
}

fn wrap_object(value: Value, key: &str) -> Value {
    if value.is_object() {
        value
    } else {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        Value::Object(map)
    }
}

fn parse_upstream_error(status: u16, body: &str) -> DriverError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorPayload,
    }

    #[derive(Deserialize)]
    struct ErrorPayload {
        message: String,
        #[serde(default)]
        status: Option<String>,
    }

    match sonic_rs::from_str::<ErrorBody>(body) {
        Ok(parsed) => DriverError {
            provider: "google".to_string(),
            code: parsed.error.status.clone(),
            error_type: parsed.error.status,
            message: parsed.error.message,
            status: Some(status),
            transport: false,
            raw: serde_json::from_str(body).ok(),
        },
        Err(_) => DriverError {
            provider: "google".to_string(),
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

/// State machine turning Gemini SSE chunks into neutral events.
///
/// Gemini has no per-block framing: each chunk carries candidate parts that
/// either extend the running text, carry thought summaries, or deliver a
/// complete function call. Function calls carry no id, so one is minted.
struct ChunkProcessor {
    started: bool,
    text_open: bool,
    reasoning_open: bool,
    seen_tool_call: bool,
    finish_reason: Option<String>,
    usage: NeutralUsage,
    done: bool,
}

impl ChunkProcessor {
    fn new() -> Self {
        Self {
            started: false,
            text_open: false,
            reasoning_open: false,
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

        // Error payloads must be probed first: the chunk shape is fully
        // defaulted, so an error object would otherwise parse as an empty
        // chunk and vanish.
        if let Ok(error) = sonic_rs::from_str::<StreamErrorChunk>(data) {
            self.done = true;
            return vec![NeutralEvent::Error(DriverError {
                provider: "google".to_string(),
                code: error.error.status.clone(),
                error_type: error.error.status,
                message: error.error.message,
                status: None,
                transport: false,
                raw: serde_json::from_str(data).ok(),
            })];
        }

        let chunk = match sonic_rs::from_str::<GenerateResponse>(data) {
            Ok(chunk) => chunk,
            Err(_) => {
                log::warn!("failed to parse google stream chunk");
                return Vec::new();
            }
        };

        let mut out = Vec::new();

        if !self.started {
            self.started = true;
            out.push(NeutralEvent::StepStart);
        }

        if let Some(usage) = chunk.usage_metadata {
            self.usage = NeutralUsage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
                cached_input_tokens: usage.cached_content_token_count,
            };
        }

        for candidate in chunk.candidates {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(function_call) = part.function_call {
                    self.close_open_blocks(&mut out);
                    self.seen_tool_call = true;
                    out.push(NeutralEvent::ToolCall {
                        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                        tool_name: function_call.name,
                        input: function_call.args,
                    });
                } else if let Some(text) = part.text
                    && !text.is_empty()
                {
                    if part.thought.unwrap_or(false) {
                        self.open_reasoning(&mut out);
                        out.push(NeutralEvent::ReasoningDelta { text });
                    } else {
                        self.open_text(&mut out);
                        out.push(NeutralEvent::TextDelta { text });
                    }
                }
            }

            if let Some(reason) = candidate.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        out
    }

    fn fail(&mut self, message: String) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        vec![NeutralEvent::Error(DriverError::transport("google", message))]
    }

    fn end_of_stream(&mut self) -> Vec<NeutralEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut out = Vec::new();
        self.close_open_blocks(&mut out);

        let reason = match self.finish_reason.as_deref() {
            Some("STOP") | None => {
                if self.seen_tool_call {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                }
            }
            Some("MAX_TOKENS") => FinishReason::Length,
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
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GooglePart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GooglePart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    FileData {
        #[serde(rename = "fileData")]
        file_data: FileRef,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
}

#[derive(Debug, Serialize)]
struct Blob {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct FileRef {
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "fileUri")]
    file_uri: String,
}

#[derive(Debug, Serialize)]
struct FunctionCall {
    name: String,
    args: Value,
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
struct Tool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    cached_content_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    function_call: Option<FunctionCallPayload>,
}

#[derive(Debug, Deserialize)]
struct FunctionCallPayload {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct StreamErrorChunk {
    error: StreamErrorPayload,
}

#[derive(Debug, Deserialize)]
struct StreamErrorPayload {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::neutral::{NeutralPrompt, Turn};
    use crate::provider::ProviderHints;
    use secrecy::SecretString;

    fn driver() -> GoogleDriver {
        GoogleDriver::new(
            "gemini".to_string(),
            &ProviderConfig {
                r#type: ProviderType::Google,
                api_key: SecretString::from("test-key".to_string()),
                base_url: None,
            },
        )
    }

    fn invoke_request() -> InvokeRequest {
        InvokeRequest {
            model: "gemini-2.0-flash".to_string(),
            prompt: NeutralPrompt {
                system: Some("Short answers.".to_string()),
                turns: vec![
                    Turn::new(Role::User, vec![Part::text("look it up")]),
                    Turn::new(
                        Role::Assistant,
                        vec![Part::new(PartKind::ToolCall {
                            call_id: "call_1".to_string(),
                            tool_name: "lookup".to_string(),
                            input: json!({"term": "rust"}),
                        })],
                    ),
                    Turn::new(
                        Role::Tool,
                        vec![Part::new(PartKind::ToolResult {
                            call_id: "call_1".to_string(),
                            tool_name: "lookup".to_string(),
                            output: ToolOutput::Json(json!({"definition": "a language"})),
                        })],
                    ),
                ],
            },
            tools: vec![NeutralTool::Function {
                name: "lookup".to_string(),
                description: None,
                // Already rewritten for Gemini's dialect by the schema
                // adapter before dispatch.
                input_schema: json!({
                    "type": "object",
                    "properties": {"term": {"type": "string"}}
                }),
            }],
            max_output_tokens: 256,
            temperature: None,
            top_p: None,
            top_k: Some(40),
            stop_sequences: Vec::new(),
            user_id: None,
            hints: ProviderHints::default(),
        }
    }

    #[test]
    fn request_uses_gemini_shapes() {
        let request = driver().build_request(&invoke_request()).unwrap();
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(
            json["systemInstruction"]["parts"][0]["text"],
            "Short answers."
        );
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(
            json["contents"][1]["parts"][0]["functionCall"]["name"],
            "lookup"
        );
        assert_eq!(
            json["contents"][2]["parts"][0]["functionResponse"]["response"],
            json!({"definition": "a language"})
        );
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(json["generationConfig"]["topK"], 40);
    }

    #[test]
    fn tool_schemas_pass_through_untouched() {
        let request = driver().build_request(&invoke_request()).unwrap();
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(
            json["tools"][0]["functionDeclarations"][0]["parameters"],
            json!({
                "type": "object",
                "properties": {"term": {"type": "string"}}
            })
        );
    }

    #[test]
    fn chunks_translate_with_minted_tool_ids() {
        let mut processor = ChunkProcessor::new();
        let mut events = Vec::new();

        for data in [
            r#"{"candidates":[{"content":{"parts":[{"text":"Checking "}],"role":"model"}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"lookup","args":{"term":"rust"}}}],"role":"model"},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":7,"cachedContentTokenCount":4}}"#,
        ] {
            events.extend(processor.handle(data));
        }
        events.extend(processor.end_of_stream());

        assert!(matches!(events[0], NeutralEvent::StepStart));
        assert!(matches!(events[1], NeutralEvent::TextStart));
        assert!(matches!(&events[2], NeutralEvent::TextDelta { text } if text == "Checking "));
        assert!(matches!(events[3], NeutralEvent::TextEnd));

        let NeutralEvent::ToolCall { id, tool_name, input } = &events[4] else {
            unreachable!("expected one-shot tool call");
        };
        assert!(id.starts_with("call_"));
        assert_eq!(tool_name, "lookup");
        assert_eq!(input, &json!({"term": "rust"}));

        let NeutralEvent::StepFinish { reason, usage } = &events[5] else {
            unreachable!("expected step-finish");
        };
        assert_eq!(*reason, FinishReason::ToolCalls);
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.cached_input_tokens, 4);
        assert!(matches!(events[6], NeutralEvent::Finish));
    }

    #[test]
    fn thought_parts_become_reasoning_events() {
        let mut processor = ChunkProcessor::new();

        let events = processor.handle(
            r#"{"candidates":[{"content":{"parts":[{"text":"pondering","thought":true}],"role":"model"}}]}"#,
        );

        assert!(matches!(events[0], NeutralEvent::StepStart));
        assert!(matches!(events[1], NeutralEvent::ReasoningStart));
        assert!(
            matches!(&events[2], NeutralEvent::ReasoningDelta { text } if text == "pondering")
        );
    }

    #[test]
    fn resource_exhausted_maps_to_driver_error() {
        let error = parse_upstream_error(
            429,
            r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
        );

        assert_eq!(error.provider, "google");
        assert_eq!(error.code.as_deref(), Some("RESOURCE_EXHAUSTED"));
        assert_eq!(error.message, "Quota exceeded");
    }
}
