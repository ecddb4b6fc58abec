//! Schema translation between MCP tool descriptors and the
//! chat-completion API's function-tool format, plus argument validation.
//!
//! Translation is pure and deterministic. Unsupported schema constructs
//! are reported with their path rather than silently dropped, and
//! LLM-supplied arguments are type-checked against the descriptor before
//! dispatch; the only permitted widening is integer-where-number.

use crate::error::{BridgeError, ToolError};
use crate::mcp::ToolDescriptor;
use serde_json::{json, Map, Value};

/// Nesting depth past which translation refuses a schema. Guards against
/// recursive or pathologically deep tool schemas.
const MAX_SCHEMA_DEPTH: usize = 16;

/// Schema keywords the chat-completion side has no representation for.
const UNSUPPORTED_KEYWORDS: &[&str] = &["$ref", "anyOf", "oneOf", "allOf", "not"];

/// Type tags accepted in `"type"` positions.
const KNOWN_TYPES: &[&str] = &[
    "string", "number", "integer", "boolean", "object", "array", "null",
];

/// Convert an MCP tool descriptor into an OpenAI-compatible tool schema.
pub fn translate(descriptor: &ToolDescriptor) -> Result<Value, BridgeError> {
    check_schema(&descriptor.input_schema, &descriptor.name, "", 0)?;
    Ok(json!({
        "type": "function",
        "function": {
            "name": descriptor.openai_name,
            "description": descriptor.description,
            "parameters": descriptor.input_schema,
        }
    }))
}

/// Walk the input schema and reject anything untranslatable.
fn check_schema(schema: &Value, tool: &str, path: &str, depth: usize) -> Result<(), BridgeError> {
    if depth > MAX_SCHEMA_DEPTH {
        return Err(unsupported(tool, path, "nesting deeper than supported"));
    }

    let obj = match schema {
        Value::Object(obj) => obj,
        // `true`/`false` schemas and bare values pass through untouched.
        _ => return Ok(()),
    };

    for keyword in UNSUPPORTED_KEYWORDS {
        if obj.contains_key(*keyword) {
            return Err(unsupported(tool, path, keyword));
        }
    }

    if let Some(ty) = obj.get("type") {
        match ty {
            Value::String(s) if KNOWN_TYPES.contains(&s.as_str()) => {}
            Value::Array(options)
                if options
                    .iter()
                    .all(|t| t.as_str().is_some_and(|s| KNOWN_TYPES.contains(&s))) => {}
            _ => {
                return Err(unsupported(
                    tool,
                    path,
                    &format!("type `{ty}`"),
                ))
            }
        }
    }

    if let Some(props) = obj.get("properties") {
        let props = props.as_object().ok_or_else(|| {
            unsupported(tool, &format!("{path}/properties"), "non-object properties")
        })?;
        for (name, sub) in props {
            check_schema(sub, tool, &format!("{path}/properties/{name}"), depth + 1)?;
        }
    }

    if let Some(items) = obj.get("items") {
        check_schema(items, tool, &format!("{path}/items"), depth + 1)?;
    }

    if let Some(additional) = obj.get("additionalProperties") {
        if additional.is_object() {
            check_schema(
                additional,
                tool,
                &format!("{path}/additionalProperties"),
                depth + 1,
            )?;
        }
    }

    Ok(())
}

fn unsupported(tool: &str, path: &str, construct: &str) -> BridgeError {
    BridgeError::SchemaTranslation {
        tool: tool.to_string(),
        path: if path.is_empty() { "/".into() } else { path.into() },
        construct: construct.to_string(),
    }
}

/// Validate LLM-supplied call arguments against the descriptor's input
/// schema. Returns the arguments unchanged on success.
pub fn validate_arguments(
    arguments: Value,
    descriptor: &ToolDescriptor,
) -> Result<Value, ToolError> {
    let schema = &descriptor.input_schema;

    let args = arguments.as_object().ok_or_else(|| ToolError::InvalidArguments {
        tool: descriptor.name.clone(),
        field: "/".into(),
        reason: "arguments must be a JSON object".into(),
    })?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(field) {
                return Err(ToolError::InvalidArguments {
                    tool: descriptor.name.clone(),
                    field: field.to_string(),
                    reason: "missing required field".into(),
                });
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, sub) in props {
            if let Some(value) = args.get(name) {
                check_value(value, sub, &descriptor.name, name)?;
            }
        }
    }

    // Fields the schema does not mention pass through, matching JSON
    // Schema's default for additionalProperties.
    Ok(arguments)
}

/// Type-check one argument value against its subschema.
fn check_value(value: &Value, schema: &Value, tool: &str, field: &str) -> Result<(), ToolError> {
    let obj = match schema.as_object() {
        Some(obj) => obj,
        None => return Ok(()),
    };

    if let Some(ty) = obj.get("type") {
        let allowed: Vec<&str> = match ty {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => vec![],
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(value, t)) {
            return Err(ToolError::InvalidArguments {
                tool: tool.to_string(),
                field: field.to_string(),
                reason: format!(
                    "expected {}, got {}",
                    allowed.join(" or "),
                    type_name(value)
                ),
            });
        }
    }

    if let Some(options) = obj.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return Err(ToolError::InvalidArguments {
                tool: tool.to_string(),
                field: field.to_string(),
                reason: "value is not one of the allowed enum options".into(),
            });
        }
    }

    match value {
        Value::Object(map) => check_object(map, obj, tool, field)?,
        Value::Array(items) => {
            if let Some(item_schema) = obj.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check_value(item, item_schema, tool, &format!("{field}[{i}]"))?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn check_object(
    map: &Map<String, Value>,
    schema: &Map<String, Value>,
    tool: &str,
    field: &str,
) -> Result<(), ToolError> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for sub in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(sub) {
                return Err(ToolError::InvalidArguments {
                    tool: tool.to_string(),
                    field: format!("{field}.{sub}"),
                    reason: "missing required field".into(),
                });
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, sub_schema) in props {
            if let Some(sub_value) = map.get(name) {
                check_value(sub_value, sub_schema, tool, &format!("{field}.{name}"))?;
            }
        }
    }
    Ok(())
}

/// Does `value` satisfy JSON Schema type tag `ty`?
///
/// An integer literal satisfies `number` (the one allowed widening);
/// nothing else is coerced.
fn type_matches(value: &Value, ty: &str) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Build a minimal argument object satisfying a descriptor's schema:
/// every required field filled with a zero value of its declared type.
/// Used by the self-consistency tests.
#[cfg(test)]
pub(crate) fn minimal_example(schema: &Value) -> Value {
    let mut out = Map::new();
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, sub) in props {
            if required.contains(&name.as_str()) {
                out.insert(name.clone(), zero_value(sub));
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
fn zero_value(schema: &Value) -> Value {
    let ty = schema
        .get("type")
        .and_then(|t| match t {
            Value::String(s) => Some(s.clone()),
            Value::Array(list) => list.first().and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .unwrap_or_else(|| "string".to_string());
    match ty.as_str() {
        "string" => json!(""),
        "number" => json!(0.0),
        "integer" => json!(0),
        "boolean" => json!(false),
        "array" => json!([]),
        "object" => minimal_example(schema),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor(input_schema: Value) -> ToolDescriptor {
        ToolDescriptor {
            name: "fetch-page".to_string(),
            openai_name: "fetch_page".to_string(),
            description: "Fetch a URL".to_string(),
            input_schema,
        }
    }

    fn fetch_descriptor() -> ToolDescriptor {
        descriptor(json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Target URL" },
                "max_bytes": { "type": "number" },
                "headers": {
                    "type": "object",
                    "properties": { "accept": { "type": "string" } },
                    "required": ["accept"]
                },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["url"]
        }))
    }

    #[test]
    fn translation_is_deterministic_and_preserves_shape() {
        let d = fetch_descriptor();
        let first = translate(&d).unwrap();
        let second = translate(&d).unwrap();
        assert_eq!(first, second);

        assert_eq!(first["type"], "function");
        assert_eq!(first["function"]["name"], "fetch_page");
        assert_eq!(first["function"]["parameters"], d.input_schema);
    }

    #[test]
    fn translation_rejects_ref_with_path() {
        let d = descriptor(json!({
            "type": "object",
            "properties": { "inner": { "$ref": "#/defs/thing" } }
        }));
        match translate(&d) {
            Err(BridgeError::SchemaTranslation { path, construct, .. }) => {
                assert_eq!(path, "/properties/inner");
                assert_eq!(construct, "$ref");
            }
            other => panic!("expected SchemaTranslation, got {other:?}"),
        }
    }

    #[test]
    fn translation_rejects_union_combinators() {
        for keyword in ["anyOf", "oneOf", "allOf"] {
            let d = descriptor(json!({ (keyword): [{ "type": "string" }] }));
            assert!(matches!(
                translate(&d),
                Err(BridgeError::SchemaTranslation { .. })
            ));
        }
    }

    #[test]
    fn translation_rejects_unknown_type_tags() {
        let d = descriptor(json!({
            "type": "object",
            "properties": { "when": { "type": "datetime" } }
        }));
        match translate(&d) {
            Err(BridgeError::SchemaTranslation { construct, .. }) => {
                assert!(construct.contains("datetime"));
            }
            other => panic!("expected SchemaTranslation, got {other:?}"),
        }
    }

    #[test]
    fn translation_rejects_excessive_nesting() {
        let mut schema = json!({ "type": "string" });
        for _ in 0..(MAX_SCHEMA_DEPTH + 2) {
            schema = json!({ "type": "object", "properties": { "next": schema } });
        }
        assert!(matches!(
            translate(&descriptor(schema)),
            Err(BridgeError::SchemaTranslation { .. })
        ));
    }

    #[test]
    fn valid_arguments_pass_through_unchanged() {
        let args = json!({
            "url": "http://example.com",
            "max_bytes": 1024,
            "headers": { "accept": "text/html" },
            "tags": ["a", "b"]
        });
        let validated = validate_arguments(args.clone(), &fetch_descriptor()).unwrap();
        assert_eq!(validated, args);
    }

    #[test]
    fn missing_required_field_is_named() {
        let err = validate_arguments(json!({}), &fetch_descriptor()).unwrap_err();
        match err {
            ToolError::InvalidArguments { field, .. } => assert_eq!(field, "url"),
            other => panic!("expected InvalidArguments, got {other:?}"),
        }
    }

    #[test]
    fn missing_nested_required_field_is_named() {
        let args = json!({ "url": "http://example.com", "headers": {} });
        let err = validate_arguments(args, &fetch_descriptor()).unwrap_err();
        match err {
            ToolError::InvalidArguments { field, .. } => assert_eq!(field, "headers.accept"),
            other => panic!("expected InvalidArguments, got {other:?}"),
        }
    }

    #[test]
    fn integer_is_accepted_where_number_is_declared() {
        let args = json!({ "url": "x", "max_bytes": 7 });
        assert!(validate_arguments(args, &fetch_descriptor()).is_ok());
    }

    #[test]
    fn string_is_not_coerced_to_number() {
        let args = json!({ "url": "x", "max_bytes": "1024" });
        let err = validate_arguments(args, &fetch_descriptor()).unwrap_err();
        match err {
            ToolError::InvalidArguments { field, reason, .. } => {
                assert_eq!(field, "max_bytes");
                assert!(reason.contains("expected number"));
            }
            other => panic!("expected InvalidArguments, got {other:?}"),
        }
    }

    #[test]
    fn array_item_type_mismatch_is_named_with_index() {
        let args = json!({ "url": "x", "tags": ["ok", 3] });
        let err = validate_arguments(args, &fetch_descriptor()).unwrap_err();
        match err {
            ToolError::InvalidArguments { field, .. } => assert_eq!(field, "tags[1]"),
            other => panic!("expected InvalidArguments, got {other:?}"),
        }
    }

    #[test]
    fn enum_values_are_enforced() {
        let d = descriptor(json!({
            "type": "object",
            "properties": { "mode": { "type": "string", "enum": ["fast", "slow"] } },
            "required": ["mode"]
        }));
        assert!(validate_arguments(json!({ "mode": "fast" }), &d).is_ok());
        assert!(validate_arguments(json!({ "mode": "medium" }), &d).is_err());
    }

    #[test]
    fn unknown_extra_fields_are_permitted() {
        let args = json!({ "url": "x", "surprise": true });
        assert!(validate_arguments(args, &fetch_descriptor()).is_ok());
    }

    #[test]
    fn minimal_example_round_trips_through_validation() {
        // Schema self-consistency: a minimal valid payload built from a
        // translated schema must validate against its own descriptor.
        let descriptors = vec![
            fetch_descriptor(),
            descriptor(json!({
                "type": "object",
                "properties": {
                    "count": { "type": "integer" },
                    "ratio": { "type": "number" },
                    "flag": { "type": "boolean" },
                    "items": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["count", "ratio", "flag", "items"]
            })),
        ];
        for d in descriptors {
            translate(&d).unwrap();
            let example = minimal_example(&d.input_schema);
            validate_arguments(example, &d)
                .unwrap_or_else(|e| panic!("minimal example failed for {}: {e}", d.name));
        }
    }
}
