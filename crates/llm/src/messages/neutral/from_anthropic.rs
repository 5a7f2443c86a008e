//! Lowering an inbound Anthropic request into the neutral prompt.

use std::collections::HashMap;

use crate::{
    error::{LlmError, LlmResult},
    media,
    messages::{
        anthropic::{
            ContentBlock, InputMessage, MediaSource, MessageContent, Role as WireRole,
            SystemPrompt, ToolDeclaration, ToolResultBlock, ToolResultContent,
        },
        neutral::{
            FileData, FilePart, NeutralPrompt, NeutralTool, Part, PartKind, ResultContent, Role,
            ToolOutput, Turn,
        },
    },
};

/// Result of lowering a request: the prompt plus the tool declarations.
#[derive(Debug, Default)]
pub struct ConvertedRequest {
    pub prompt: NeutralPrompt,
    pub tools: Vec<NeutralTool>,
}

/// Convert the message-shaped parts of an Anthropic request.
///
/// Tool results are resolved against a `call_id -> tool name` table built
/// while walking the same prompt; a result that refers to a call the prompt
/// never made is a structural violation.
pub fn convert(
    system: Option<SystemPrompt>,
    messages: Vec<InputMessage>,
    tools: Option<Vec<ToolDeclaration>>,
) -> LlmResult<ConvertedRequest> {
    let mut converter = Converter::default();

    let system = system.map(flatten_system);

    for message in messages {
        converter.push_message(message)?;
    }

    Ok(ConvertedRequest {
        prompt: NeutralPrompt {
            system,
            turns: converter.turns,
        },
        tools: tools.into_iter().flatten().map(convert_tool).collect(),
    })
}

/// Anthropic permits an array of system blocks; the driver surface only
/// accepts a single string.
fn flatten_system(system: SystemPrompt) -> String {
    match system {
        SystemPrompt::Text(text) => text,
        SystemPrompt::Blocks(blocks) => blocks
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn convert_tool(tool: ToolDeclaration) -> NeutralTool {
    match tool {
        ToolDeclaration::Custom(custom) => NeutralTool::Function {
            name: custom.name,
            description: custom.description,
            input_schema: custom.input_schema,
        },
        ToolDeclaration::Builtin(raw) => NeutralTool::ProviderDefined(raw),
    }
}

#[derive(Default)]
struct Converter {
    turns: Vec<Turn>,
    /// call_id -> tool name, filled from assistant tool_use blocks.
    tool_names: HashMap<String, String>,
}

impl Converter {
    fn push_message(&mut self, message: InputMessage) -> LlmResult<()> {
        let blocks = match message.content {
            MessageContent::Text(text) => vec![ContentBlock::Text {
                text,
                cache_control: None,
            }],
            MessageContent::Blocks(blocks) => blocks,
        };

        let first_turn = self.turns.len();

        match message.role {
            WireRole::System => {
                let parts = blocks
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text, cache_control } => Some(Part {
                            kind: PartKind::Text { text },
                            cache_control,
                        }),
                        _ => None,
                    })
                    .collect();

                self.turns.push(Turn::new(Role::System, parts));
            }
            WireRole::Assistant => {
                let mut parts = Vec::with_capacity(blocks.len());

                for block in blocks {
                    parts.push(self.convert_assistant_block(block)?);
                }

                self.turns.push(Turn::new(Role::Assistant, parts));
            }
            WireRole::User => {
                // Tool results become their own tool turns; everything else
                // groups into user turns, order preserved.
                let mut pending: Vec<Part> = Vec::new();

                for block in blocks {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                        cache_control,
                    } = block
                    {
                        if !pending.is_empty() {
                            self.turns
                                .push(Turn::new(Role::User, std::mem::take(&mut pending)));
                        }

                        let part = self.convert_tool_result(
                            tool_use_id,
                            content,
                            is_error.unwrap_or(false),
                            cache_control,
                        )?;
                        self.turns.push(Turn::new(Role::Tool, vec![part]));
                    } else {
                        pending.push(convert_user_block(block)?);
                    }
                }

                if !pending.is_empty() {
                    self.turns.push(Turn::new(Role::User, pending));
                }
            }
        }

        // A message-level cache annotation lands on the last turn the
        // message produced, mirroring "last block of its message".
        if let Some(cache_control) = message.cache_control
            && self.turns.len() > first_turn
            && let Some(turn) = self.turns.last_mut()
        {
            turn.cache_control = Some(cache_control);
        }

        Ok(())
    }

    fn convert_assistant_block(&mut self, block: ContentBlock) -> LlmResult<Part> {
        let part = match block {
            ContentBlock::Text { text, cache_control } => Part {
                kind: PartKind::Text { text },
                cache_control,
            },
            ContentBlock::Thinking {
                thinking,
                cache_control,
                ..
            } => Part {
                kind: PartKind::Reasoning { text: thinking },
                cache_control,
            },
            // The redacted payload is preserved as the reasoning text.
            ContentBlock::RedactedThinking { data, cache_control } => Part {
                kind: PartKind::Reasoning { text: data },
                cache_control,
            },
            ContentBlock::ToolUse {
                id,
                name,
                input,
                cache_control,
            } => {
                self.tool_names.insert(id.clone(), name.clone());
                Part {
                    kind: PartKind::ToolCall {
                        call_id: id,
                        tool_name: name,
                        input,
                    },
                    cache_control,
                }
            }
            ContentBlock::ToolResult { .. } => {
                return Err(LlmError::ProtocolInvariant(
                    "tool_result blocks are not allowed in assistant messages".to_string(),
                ));
            }
            other => convert_user_block(other)?,
        };

        Ok(part)
    }

    fn convert_tool_result(
        &self,
        call_id: String,
        content: Option<ToolResultContent>,
        is_error: bool,
        cache_control: Option<serde_json::Value>,
    ) -> LlmResult<Part> {
        let Some(tool_name) = self.tool_names.get(&call_id).cloned() else {
            return Err(LlmError::ProtocolInvariant(format!(
                "tool_result references unknown tool call '{call_id}'"
            )));
        };

        let output = match content {
            None => wrap_text(String::new(), is_error),
            Some(ToolResultContent::Text(text)) => wrap_text(text, is_error),
            Some(ToolResultContent::Blocks(blocks)) => {
                if is_error {
                    // Error results collapse to text; drivers report errors
                    // as strings on every wire format.
                    let text = blocks
                        .iter()
                        .filter_map(|block| match block {
                            ToolResultBlock::Text { text } => Some(text.as_str()),
                            ToolResultBlock::Image { .. } => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    ToolOutput::ErrorText(text)
                } else {
                    match <[_; 1]>::try_from(blocks) {
                        Ok([ToolResultBlock::Text { text }]) => ToolOutput::Text(text),
                        Ok([block]) => ToolOutput::Content(vec![convert_result_block(block)]),
                        Err(blocks) => ToolOutput::Content(
                            blocks.into_iter().map(convert_result_block).collect(),
                        ),
                    }
                }
            }
        };

        Ok(Part {
            kind: PartKind::ToolResult {
                call_id,
                tool_name,
                output,
            },
            cache_control,
        })
    }
}

fn wrap_text(text: String, is_error: bool) -> ToolOutput {
    if is_error {
        ToolOutput::ErrorText(text)
    } else {
        ToolOutput::Text(text)
    }
}

fn convert_result_block(block: ToolResultBlock) -> ResultContent {
    match block {
        ToolResultBlock::Text { text } => ResultContent::Text { text },
        ToolResultBlock::Image { source } => match source {
            MediaSource::Base64 { media_type, data } => ResultContent::Media { media_type, data },
            // URL-referenced images inside tool results degrade to the URL
            // itself; no provider fetches them from this position.
            MediaSource::Url { url } => ResultContent::Text { text: url },
        },
    }
}

fn convert_user_block(block: ContentBlock) -> LlmResult<Part> {
    let part = match block {
        ContentBlock::Text { text, cache_control } => Part {
            kind: PartKind::Text { text },
            cache_control,
        },
        ContentBlock::Thinking {
            thinking,
            cache_control,
            ..
        } => Part {
            kind: PartKind::Reasoning { text: thinking },
            cache_control,
        },
        ContentBlock::RedactedThinking { data, cache_control } => Part {
            kind: PartKind::Reasoning { text: data },
            cache_control,
        },
        ContentBlock::Image {
            source,
            cache_control,
        } => Part {
            kind: PartKind::File(convert_media(source, MediaKind::Image)?),
            cache_control,
        },
        ContentBlock::Document {
            source,
            cache_control,
        } => Part {
            kind: PartKind::File(convert_media(source, MediaKind::Document)?),
            cache_control,
        },
        ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => {
            return Err(LlmError::ProtocolInvariant(
                "tool blocks are not allowed in this position".to_string(),
            ));
        }
    };

    Ok(part)
}

#[derive(Clone, Copy)]
enum MediaKind {
    Image,
    Document,
}

fn convert_media(source: MediaSource, kind: MediaKind) -> LlmResult<FilePart> {
    match source {
        MediaSource::Base64 { media_type, data } => {
            let bytes = media::decode_base64(&data).map_err(|_| {
                LlmError::ProtocolInvariant("invalid base64 payload in media block".to_string())
            })?;

            let media_type = if media_type.is_empty() {
                match kind {
                    MediaKind::Image => media::sniff_image_media_type(&bytes)
                        .ok_or_else(|| {
                            LlmError::UnsupportedMediaType(
                                "image payload with unrecognized format".to_string(),
                            )
                        })?
                        .to_string(),
                    MediaKind::Document => "application/pdf".to_string(),
                }
            } else {
                media_type
            };

            Ok(FilePart {
                data: FileData::Bytes(bytes),
                media_type,
                filename: None,
            })
        }
        MediaSource::Url { url } => {
            // Clients sometimes put data: URLs in the url source.
            if let Some(parsed) = media::parse_data_url(&url) {
                return Ok(FilePart {
                    data: FileData::Bytes(parsed.bytes),
                    media_type: parsed.media_type,
                    filename: None,
                });
            }

            let media_type = match kind {
                MediaKind::Image => guess_image_media_type(&url).to_string(),
                MediaKind::Document => "application/pdf".to_string(),
            };

            Ok(FilePart {
                data: FileData::Url(url),
                media_type,
                filename: None,
            })
        }
    }
}

fn guess_image_media_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);

    match path.rsplit('.').next() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}
