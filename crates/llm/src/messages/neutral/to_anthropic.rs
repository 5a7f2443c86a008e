//! Rendering neutral turns back into Anthropic wire messages.
//!
//! Used in two places: the Anthropic driver rebuilds a native request from
//! the neutral prompt, and the non-streaming path renders the collected
//! assistant turn into the response content the client receives.

use std::collections::{BTreeSet, HashSet};

use crate::{
    error::{LlmError, LlmResult},
    media,
    messages::{
        anthropic::{
            ContentBlock, InputMessage, MediaSource, MessageContent, Role as WireRole,
            ToolResultBlock, ToolResultContent,
        },
        neutral::{
            FileData, FilePart, NeutralPrompt, Part, PartKind, ResultContent, Role, ToolOutput,
            Turn,
        },
    },
};

/// Beta capability required for document blocks.
const PDF_BETA: &str = "pdfs-2024-09-25";

/// Anthropic rejects non-text fallbacks for PDFs inside tool results; the
/// payload is replaced by this marker. Inherited behavior, not a contract.
const DOCUMENT_OMITTED: &str = "[document content omitted]";

/// Rendering knobs shared by both call sites.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Render reasoning parts as `thinking` blocks. When false the parts
    /// are skipped and a warning is recorded.
    pub send_reasoning: bool,
}

/// A rendered conversation plus the beta capabilities it needs.
#[derive(Debug, Default)]
pub struct RenderedConversation {
    pub messages: Vec<InputMessage>,
    pub betas: BTreeSet<String>,
}

/// Render the non-system turns of a prompt into wire messages.
///
/// The final text part of the final assistant turn is right-trimmed:
/// Anthropic rejects trailing whitespace in prefilled assistant turns.
pub fn render_conversation(
    prompt: &NeutralPrompt,
    options: RenderOptions,
) -> LlmResult<RenderedConversation> {
    let mut rendered = RenderedConversation::default();

    let turns: Vec<&Turn> = prompt.conversation_turns().collect();
    let last_assistant = turns
        .iter()
        .rposition(|turn| turn.role == Role::Assistant)
        .filter(|&position| position + 1 == turns.len());

    for (position, turn) in turns.iter().enumerate() {
        let trim_trailing = last_assistant == Some(position);
        let message = render_turn(turn, options, trim_trailing, &mut rendered.betas)?;

        // Anthropic rejects messages with empty content arrays.
        if !matches!(&message.content, MessageContent::Blocks(blocks) if blocks.is_empty()) {
            rendered.messages.push(message);
        }
    }

    Ok(rendered)
}

/// Render one assistant turn's parts into response content blocks.
pub fn render_assistant_content(
    parts: &[Part],
    options: RenderOptions,
) -> LlmResult<Vec<ContentBlock>> {
    let turn = Turn {
        role: Role::Assistant,
        parts: parts.to_vec(),
        cache_control: None,
    };
    let mut betas = BTreeSet::new();

    let message = render_turn(&turn, options, false, &mut betas)?;

    Ok(match message.content {
        MessageContent::Blocks(blocks) => blocks,
        MessageContent::Text(text) => vec![ContentBlock::Text {
            text,
            cache_control: None,
        }],
    })
}

fn render_turn(
    turn: &Turn,
    options: RenderOptions,
    trim_trailing: bool,
    betas: &mut BTreeSet<String>,
) -> LlmResult<InputMessage> {
    let role = match turn.role {
        Role::Assistant => WireRole::Assistant,
        // Tool results travel inside user messages on the Anthropic wire.
        Role::User | Role::Tool => WireRole::User,
        Role::System => {
            return Err(LlmError::ProtocolInvariant(
                "system turns cannot be rendered as messages".to_string(),
            ));
        }
    };

    let mut blocks: Vec<ContentBlock> = Vec::with_capacity(turn.parts.len());
    let mut seen_call_ids: HashSet<&str> = HashSet::new();

    for part in &turn.parts {
        let block = match &part.kind {
            PartKind::Text { text } => {
                if text.is_empty() {
                    continue;
                }
                ContentBlock::Text {
                    text: text.clone(),
                    cache_control: None,
                }
            }

            PartKind::Reasoning { text } => {
                if !options.send_reasoning {
                    log::warn!("dropping reasoning part: send_reasoning is disabled");
                    continue;
                }
                ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: None,
                    cache_control: None,
                }
            }

            PartKind::File(file) => render_file(file, betas)?,

            PartKind::ToolCall {
                call_id,
                tool_name,
                input,
            } => {
                // Some backends emit synthetic empty-argument retries after
                // a tool decode error; Anthropic rejects the duplicate id
                // outright. The first occurrence wins, input included.
                if !seen_call_ids.insert(call_id.as_str()) {
                    log::warn!("dropping duplicate tool call '{call_id}' in assistant turn");
                    continue;
                }
                ContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: tool_name.clone(),
                    input: input.clone(),
                    cache_control: None,
                }
            }

            PartKind::ToolResult {
                call_id, output, ..
            } => render_tool_result(call_id, output),
        };

        blocks.push(with_cache_control(block, part.cache_control.clone()));
    }

    if trim_trailing {
        trim_trailing_text(&mut blocks);
    }

    // A block keeps its own annotation; the message's last block inherits
    // the message-level one when it has none of its own.
    if let Some(cache_control) = &turn.cache_control
        && let Some(last) = blocks.last_mut()
        && last.cache_control().is_none()
    {
        last.set_cache_control(Some(cache_control.clone()));
    }

    Ok(InputMessage {
        role,
        content: MessageContent::Blocks(blocks),
        cache_control: None,
    })
}

fn with_cache_control(mut block: ContentBlock, cache_control: Option<serde_json::Value>) -> ContentBlock {
    if cache_control.is_some() {
        block.set_cache_control(cache_control);
    }
    block
}

fn render_file(file: &FilePart, betas: &mut BTreeSet<String>) -> LlmResult<ContentBlock> {
    let source = match &file.data {
        FileData::Bytes(bytes) => MediaSource::Base64 {
            media_type: file.media_type.clone(),
            data: media::encode_base64(bytes),
        },
        FileData::Url(url) => MediaSource::Url { url: url.clone() },
    };

    if file.media_type.starts_with("image/") {
        return Ok(ContentBlock::Image {
            source,
            cache_control: None,
        });
    }

    if file.media_type == "application/pdf" {
        betas.insert(PDF_BETA.to_string());
        return Ok(ContentBlock::Document {
            source,
            cache_control: None,
        });
    }

    Err(LlmError::UnsupportedMediaType(file.media_type.clone()))
}

fn render_tool_result(call_id: &str, output: &ToolOutput) -> ContentBlock {
    let (content, is_error) = match output {
        ToolOutput::Text(text) => (ToolResultContent::Text(text.clone()), false),
        ToolOutput::ErrorText(text) => (ToolResultContent::Text(text.clone()), true),
        ToolOutput::Json(value) => (ToolResultContent::Text(compact_json(value)), false),
        ToolOutput::ErrorJson(value) => (ToolResultContent::Text(compact_json(value)), true),
        ToolOutput::Content(items) => {
            let blocks = items
                .iter()
                .map(|item| match item {
                    ResultContent::Text { text } => ToolResultBlock::Text { text: text.clone() },
                    ResultContent::Media { media_type, data } => {
                        if media_type.starts_with("image/") {
                            ToolResultBlock::Image {
                                source: MediaSource::Base64 {
                                    media_type: media_type.clone(),
                                    data: data.clone(),
                                },
                            }
                        } else {
                            ToolResultBlock::Text {
                                text: DOCUMENT_OMITTED.to_string(),
                            }
                        }
                    }
                })
                .collect();
            (ToolResultContent::Blocks(blocks), false)
        }
    };

    ContentBlock::ToolResult {
        tool_use_id: call_id.to_string(),
        content: Some(content),
        is_error: is_error.then_some(true),
        cache_control: None,
    }
}

fn compact_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

fn trim_trailing_text(blocks: &mut Vec<ContentBlock>) {
    if let Some(ContentBlock::Text { text, .. }) = blocks.last_mut() {
        let trimmed = text.trim_end();
        if trimmed.len() != text.len() {
            *text = trimmed.to_string();
        }
        if text.is_empty() {
            blocks.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::neutral::Turn;
    use serde_json::json;

    const OPTIONS: RenderOptions = RenderOptions {
        send_reasoning: true,
    };

    fn tool_call(id: &str, name: &str, input: serde_json::Value) -> Part {
        Part::new(PartKind::ToolCall {
            call_id: id.to_string(),
            tool_name: name.to_string(),
            input,
        })
    }

    fn assistant_prompt(parts: Vec<Part>) -> NeutralPrompt {
        NeutralPrompt {
            system: None,
            turns: vec![Turn::new(Role::Assistant, parts)],
        }
    }

    #[test]
    fn duplicate_tool_calls_are_dropped_first_wins() {
        let prompt = assistant_prompt(vec![
            tool_call("call_123", "TodoWrite", json!({"todos": ["a", "b"]})),
            tool_call("call_123", "TodoWrite", json!({})),
        ]);

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };

        assert_eq!(blocks.len(), 1);
        let ContentBlock::ToolUse { id, input, .. } = &blocks[0] else {
            unreachable!("expected tool_use block");
        };
        assert_eq!(id, "call_123");
        assert_eq!(input, &json!({"todos": ["a", "b"]}));
    }

    #[test]
    fn mixed_content_keeps_order_while_deduplicating() {
        let prompt = assistant_prompt(vec![
            Part::text("Let me help."),
            tool_call("x", "Search", json!({"q": "t"})),
            Part::text("..."),
            tool_call("x", "Search", json!({"q": "d"})),
        ]);

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };

        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[0], ContentBlock::Text { text, .. } if text == "Let me help."));
        let ContentBlock::ToolUse { id, input, .. } = &blocks[1] else {
            unreachable!("expected tool_use block");
        };
        assert_eq!(id, "x");
        assert_eq!(input, &json!({"q": "t"}));
        assert!(matches!(&blocks[2], ContentBlock::Text { text, .. } if text == "..."));
    }

    #[test]
    fn trailing_whitespace_is_trimmed_from_final_assistant_text() {
        let prompt = assistant_prompt(vec![Part::text("The answer is 42.  \n")]);

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };

        assert!(matches!(&blocks[0], ContentBlock::Text { text, .. } if text == "The answer is 42."));
    }

    #[test]
    fn non_final_assistant_turns_keep_their_whitespace() {
        let prompt = NeutralPrompt {
            system: None,
            turns: vec![
                Turn::new(Role::Assistant, vec![Part::text("draft ")]),
                Turn::new(Role::User, vec![Part::text("continue")]),
            ],
        };

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };

        assert!(matches!(&blocks[0], ContentBlock::Text { text, .. } if text == "draft "));
    }

    #[test]
    fn empty_text_parts_are_dropped() {
        let prompt = assistant_prompt(vec![Part::text(""), Part::text("kept")]);

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };

        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn reasoning_is_gated_by_send_reasoning() {
        let parts = vec![
            Part::new(PartKind::Reasoning {
                text: "chain".to_string(),
            }),
            Part::text("visible"),
        ];

        let with = render_assistant_content(
            &parts,
            RenderOptions {
                send_reasoning: true,
            },
        )
        .unwrap();
        assert_eq!(with.len(), 2);
        assert!(matches!(&with[0], ContentBlock::Thinking { thinking, .. } if thinking == "chain"));

        let without = render_assistant_content(
            &parts,
            RenderOptions {
                send_reasoning: false,
            },
        )
        .unwrap();
        assert_eq!(without.len(), 1);
        assert!(matches!(&without[0], ContentBlock::Text { .. }));
    }

    #[test]
    fn message_level_cache_control_lands_on_last_block_only() {
        let mut turn = Turn::new(
            Role::User,
            vec![Part::text("first"), Part::text("second")],
        );
        turn.cache_control = Some(json!({"type": "ephemeral"}));

        let prompt = NeutralPrompt {
            system: None,
            turns: vec![turn],
        };

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };

        assert!(blocks[0].cache_control().is_none());
        assert_eq!(
            blocks[1].cache_control(),
            Some(&json!({"type": "ephemeral"}))
        );
    }

    #[test]
    fn block_level_cache_control_is_not_overridden() {
        let mut part = Part::text("own annotation");
        part.cache_control = Some(json!({"type": "ephemeral", "ttl": "1h"}));

        let mut turn = Turn::new(Role::User, vec![part]);
        turn.cache_control = Some(json!({"type": "ephemeral"}));

        let prompt = NeutralPrompt {
            system: None,
            turns: vec![turn],
        };

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };

        assert_eq!(
            blocks[0].cache_control(),
            Some(&json!({"type": "ephemeral", "ttl": "1h"}))
        );
    }

    #[test]
    fn pdf_files_add_the_beta_capability() {
        let prompt = NeutralPrompt {
            system: None,
            turns: vec![Turn::new(
                Role::User,
                vec![Part::new(PartKind::File(FilePart {
                    data: FileData::Bytes(b"%PDF-1.7".to_vec()),
                    media_type: "application/pdf".to_string(),
                    filename: Some("report.pdf".to_string()),
                }))],
            )],
        };

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();

        assert!(rendered.betas.contains(PDF_BETA));
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };
        assert!(matches!(&blocks[0], ContentBlock::Document { .. }));
    }

    #[test]
    fn unknown_media_types_are_rejected() {
        let prompt = NeutralPrompt {
            system: None,
            turns: vec![Turn::new(
                Role::User,
                vec![Part::new(PartKind::File(FilePart {
                    data: FileData::Bytes(b"BM".to_vec()),
                    media_type: "audio/wav".to_string(),
                    filename: None,
                }))],
            )],
        };

        let error = render_conversation(&prompt, OPTIONS).unwrap_err();
        assert_eq!(error.error_type(), "unsupported_media_type");
    }

    #[test]
    fn text_only_round_trip_is_pure() {
        // Parsing a text-only prompt and rendering the final assistant turn
        // must reproduce the original blocks, modulo empty-text dropping
        // and the trailing prefill trim.
        let messages: Vec<crate::messages::anthropic::InputMessage> = serde_json::from_value(json!([
            {"role": "user", "content": "What is 6 times 7?"},
            {"role": "assistant", "content": [
                {"type": "text", "text": "Let me compute."},
                {"type": "text", "text": ""},
                {"type": "text", "text": "It is 42. "}
            ]}
        ]))
        .unwrap();

        let converted =
            crate::messages::neutral::from_anthropic::convert(None, messages, None).unwrap();
        let rendered = render_conversation(&converted.prompt, OPTIONS).unwrap();

        let MessageContent::Blocks(blocks) = &rendered.messages[1].content else {
            unreachable!("expected block content");
        };

        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], ContentBlock::Text { text, .. } if text == "Let me compute."));
        assert!(matches!(&blocks[1], ContentBlock::Text { text, .. } if text == "It is 42."));
    }

    #[test]
    fn pdf_media_inside_tool_results_degrades_to_marker() {
        let prompt = NeutralPrompt {
            system: None,
            turns: vec![Turn::new(
                Role::Tool,
                vec![Part::new(PartKind::ToolResult {
                    call_id: "call_9".to_string(),
                    tool_name: "fetch".to_string(),
                    output: ToolOutput::Content(vec![ResultContent::Media {
                        media_type: "application/pdf".to_string(),
                        data: "aGk=".to_string(),
                    }]),
                })],
            )],
        };

        let rendered = render_conversation(&prompt, OPTIONS).unwrap();
        let MessageContent::Blocks(blocks) = &rendered.messages[0].content else {
            unreachable!("expected block content");
        };
        let ContentBlock::ToolResult {
            content: Some(ToolResultContent::Blocks(result_blocks)),
            ..
        } = &blocks[0]
        else {
            unreachable!("expected tool_result block");
        };

        assert!(matches!(
            &result_blocks[0],
            ToolResultBlock::Text { text } if text == DOCUMENT_OMITTED
        ));
    }
}
