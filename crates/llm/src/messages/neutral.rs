//! Provider-neutral intermediate representation.
//!
//! Every inbound Anthropic request is lowered into this model before a
//! backend driver sees it, and every backend reply is lifted back out of it.
//! The types are deliberately plain: ordered turns of typed parts, a small
//! tool vocabulary, and a flat stream-event union. Adding a part or event
//! variant is a compile-time signal at every `match` that consumes them.

use serde_json::Value;

use crate::error::DriverError;

pub(crate) mod from_anthropic;
pub(crate) mod to_anthropic;

/// A full prompt: an optional system string plus ordered turns.
///
/// Lives for exactly one HTTP request; consumed once by a driver.
#[derive(Debug, Clone, Default)]
pub struct NeutralPrompt {
    /// System instruction collected from the request's `system` field.
    pub system: Option<String>,
    /// Conversation turns in order.
    pub turns: Vec<Turn>,
}

impl NeutralPrompt {
    /// Flatten the request-level system string and any leading system turns
    /// into the single string the driver surface accepts.
    ///
    /// System turns separated from the leading run by non-system turns are
    /// a structural violation of the prompt.
    pub fn flattened_system(&self) -> Result<Option<String>, crate::error::LlmError> {
        let mut pieces: Vec<&str> = Vec::new();

        if let Some(system) = &self.system {
            pieces.push(system);
        }

        let mut seen_non_system = false;

        for turn in &self.turns {
            if turn.role == Role::System {
                if seen_non_system {
                    return Err(crate::error::LlmError::ProtocolInvariant(
                        "system messages must form a single leading block".to_string(),
                    ));
                }
                pieces.extend(turn.parts.iter().filter_map(|part| match &part.kind {
                    PartKind::Text { text } => Some(text.as_str()),
                    _ => None,
                }));
            } else {
                seen_non_system = true;
            }
        }

        if pieces.is_empty() {
            Ok(None)
        } else {
            Ok(Some(pieces.join("\n")))
        }
    }

    /// Turns without the leading system run.
    pub fn conversation_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|turn| turn.role != Role::System)
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
    /// Message-level cache annotation, inherited by the last rendered block.
    pub cache_control: Option<Value>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            cache_control: None,
        }
    }
}

/// Turn role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A typed content part with its opaque cache annotation.
#[derive(Debug, Clone)]
pub struct Part {
    pub kind: PartKind,
    pub cache_control: Option<Value>,
}

impl Part {
    pub fn new(kind: PartKind) -> Self {
        Self {
            kind,
            cache_control: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(PartKind::Text { text: text.into() })
    }
}

/// Part variants of the neutral prompt.
#[derive(Debug, Clone)]
pub enum PartKind {
    Text {
        text: String,
    },

    /// Opaque chain-of-thought carried across providers.
    Reasoning {
        text: String,
    },

    File(FilePart),

    /// Assistant tool invocation. `call_id` is unique within its turn; a
    /// second occurrence of the same id is dropped when rendering.
    ToolCall {
        call_id: String,
        tool_name: String,
        input: Value,
    },

    /// Tool output referring back to a preceding `ToolCall`. The tool name
    /// is resolved while converting the prompt so drivers that key results
    /// by function name (Gemini) don't need their own lookup.
    ToolResult {
        call_id: String,
        tool_name: String,
        output: ToolOutput,
    },
}

/// A file carried in the prompt. `media_type` is non-empty by the time a
/// driver sees the part.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub data: FileData,
    pub media_type: String,
    pub filename: Option<String>,
}

/// File payload: raw bytes or a reference the upstream fetches itself.
#[derive(Debug, Clone)]
pub enum FileData {
    Bytes(Vec<u8>),
    Url(String),
}

/// Output attached to a tool result.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
    ErrorText(String),
    ErrorJson(Value),
    Content(Vec<ResultContent>),
}

/// An item of structured tool result content.
#[derive(Debug, Clone)]
pub enum ResultContent {
    Text { text: String },
    /// Base64 payload with its media type.
    Media { media_type: String, data: String },
}

/// Tool declaration handed to a driver.
#[derive(Debug, Clone)]
pub enum NeutralTool {
    Function {
        name: String,
        description: Option<String>,
        input_schema: Value,
    },
    /// Anthropic built-in tool definition, carried through verbatim. Only
    /// the Anthropic driver can honor these.
    ProviderDefined(Value),
}

/// Token usage counters reported by a driver. Providers vary in fidelity;
/// anything missing defaults to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeutralUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_input_tokens: u32,
}

/// Why a generation step finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

/// Event stream a driver produces for one invocation.
#[derive(Debug, Clone)]
pub enum NeutralEvent {
    StepStart,

    TextStart,
    TextDelta { text: String },
    TextEnd,

    ReasoningStart,
    ReasoningDelta { text: String },
    ReasoningEnd,

    ToolInputStart { id: String, tool_name: String },
    ToolInputDelta { json_fragment: String },
    ToolInputEnd,

    /// One-shot variant for backends that deliver complete tool calls.
    ToolCall {
        id: String,
        tool_name: String,
        input: Value,
    },

    StepFinish {
        reason: FinishReason,
        usage: NeutralUsage,
    },

    Finish,

    Error(DriverError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_turn(text: &str) -> Turn {
        Turn::new(Role::System, vec![Part::text(text)])
    }

    fn user_turn(text: &str) -> Turn {
        Turn::new(Role::User, vec![Part::text(text)])
    }

    #[test]
    fn flattened_system_joins_leading_turns() {
        let prompt = NeutralPrompt {
            system: Some("Be brief.".to_string()),
            turns: vec![system_turn("Answer in English."), user_turn("hi")],
        };

        assert_eq!(
            prompt.flattened_system().unwrap().as_deref(),
            Some("Be brief.\nAnswer in English.")
        );
    }

    #[test]
    fn flattened_system_rejects_split_system_blocks() {
        let prompt = NeutralPrompt {
            system: None,
            turns: vec![system_turn("a"), user_turn("hi"), system_turn("b")],
        };

        let error = prompt.flattened_system().unwrap_err();
        assert_eq!(error.error_type(), "protocol_invariant");
    }

    #[test]
    fn flattened_system_empty_prompt_is_none() {
        let prompt = NeutralPrompt {
            system: None,
            turns: vec![user_turn("hi")],
        };

        assert!(prompt.flattened_system().unwrap().is_none());
    }
}
