//! Per-provider JSON Schema adaptation for tool input contracts.
//!
//! Function-calling validators disagree about which draft-7 constructs they
//! accept. The adapter rewrites a tool's `input_schema` into a form the
//! target provider tolerates. The transformation is pure, stable and
//! idempotent: adapting an already-adapted schema is a no-op.

use config::ProviderType;
use serde_json::Value;

/// Adapt a tool input schema for the given provider.
///
/// Rules, applied recursively:
///
/// - `openai` and `google` reject strict URI validation inconsistently, so
///   `format: "uri"` annotations are removed.
/// - `openai` requires closed objects: `additionalProperties` is set to
///   `false` where absent. An explicit `required` array is preserved and
///   never synthesized, since OpenAI rejects required fields that are
///   semantically optional.
/// - `google` speaks a narrower schema dialect: `additionalProperties`,
///   `$schema` and `default` are removed outright, and string `format`
///   annotations other than `enum` and `date-time` are dropped.
/// - Recursion descends into `properties.*` and into `items` when it is a
///   single object schema.
///
/// Non-object, non-array nodes are returned unchanged.
pub fn adapt(provider: ProviderType, schema: Value) -> Value {
    match provider {
        ProviderType::Openai => adapt_node(schema, Dialect::OpenAi),
        ProviderType::Google => adapt_node(schema, Dialect::Google),
        ProviderType::Xai | ProviderType::Azure | ProviderType::Anthropic => schema,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Dialect {
    OpenAi,
    Google,
}

fn adapt_node(mut schema: Value, dialect: Dialect) -> Value {
    let Some(node) = schema.as_object_mut() else {
        return schema;
    };

    if node.get("format").and_then(Value::as_str) == Some("uri") {
        node.remove("format");
    }

    if dialect == Dialect::Google {
        node.remove("additionalProperties");
        node.remove("$schema");
        node.remove("default");

        // Only "enum" and "date-time" string formats survive Gemini's
        // validator.
        if node.get("type").and_then(Value::as_str) == Some("string")
            && let Some(format) = node.get("format").and_then(Value::as_str)
            && format != "enum"
            && format != "date-time"
        {
            node.remove("format");
        }
    }

    let node_type = node
        .get("type")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    if node_type.as_deref() == Some("object") {
        if dialect == Dialect::OpenAi && !node.contains_key("additionalProperties") {
            node.insert("additionalProperties".to_string(), Value::Bool(false));
        }

        if let Some(properties) = node.get_mut("properties").and_then(Value::as_object_mut) {
            for (_, property) in properties.iter_mut() {
                *property = adapt_node(property.take(), dialect);
            }
        }
    }

    if node_type.as_deref() == Some("array")
        && let Some(items) = node.get_mut("items")
        && items.is_object()
    {
        *items = adapt_node(items.take(), dialect);
    }

    schema
}
