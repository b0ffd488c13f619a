//! Exact-shape validation of model output.
//!
//! Both payloads are checked key by key before they are deserialized: a
//! missing key, an extra key, or a value of the wrong type rejects the whole
//! payload.

use crate::error::SchemaError;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

/// Phase 1 model output payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOneOutput {
    /// Detailed markdown raw memory for a single rollout.
    pub raw_memory: String,
    /// Compact summary used for routing and indexing.
    pub rollout_summary: String,
    /// Short human-readable suffix for the summary file name.
    pub rollout_slug: Option<String>,
}

/// Phase 2 model output payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsolidationOutput {
    pub memory_md: String,
    pub memory_summary: String,
    pub skills: Vec<SkillBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillBundle {
    pub name: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub scripts: Vec<SkillFile>,
    #[serde(default)]
    pub templates: Vec<SkillFile>,
    #[serde(default)]
    pub examples: Vec<SkillFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillFile {
    pub path: String,
    pub content: String,
}

const SKILL_FILE_LISTS: [&str; 3] = ["scripts", "templates", "examples"];

/// JSON schema used to constrain phase-1 model output.
pub fn stage_one_output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "rollout_summary": { "type": "string" },
            "rollout_slug": { "type": ["string", "null"] },
            "raw_memory": { "type": "string" }
        },
        "required": ["rollout_summary", "rollout_slug", "raw_memory"],
        "additionalProperties": false
    })
}

/// JSON schema used to constrain phase-2 model output.
pub fn consolidation_output_schema() -> Value {
    let file = json!({
        "type": "object",
        "properties": {
            "path": { "type": "string" },
            "content": { "type": "string" }
        },
        "required": ["path", "content"],
        "additionalProperties": false
    });
    json!({
        "type": "object",
        "properties": {
            "memory_md": { "type": "string" },
            "memory_summary": { "type": "string" },
            "skills": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "content": { "type": "string" },
                        "scripts": { "type": "array", "items": file.clone() },
                        "templates": { "type": "array", "items": file.clone() },
                        "examples": { "type": "array", "items": file }
                    },
                    "required": ["name"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["memory_md", "memory_summary", "skills"],
        "additionalProperties": false
    })
}

pub fn parse_stage_one_output(text: &str) -> Result<StageOneOutput, SchemaError> {
    let value = parse_json_payload(text)?;
    let object = as_object(&value, "output")?;
    expect_exact_keys(
        object,
        &["raw_memory", "rollout_summary", "rollout_slug"],
        &[],
        "output",
    )?;
    expect_string(object, "raw_memory", "output")?;
    expect_string(object, "rollout_summary", "output")?;
    if let Some(slug) = object.get("rollout_slug")
        && !(slug.is_string() || slug.is_null())
    {
        return Err(SchemaError::WrongType {
            context: "output".to_string(),
            key: "rollout_slug".to_string(),
            expected: "a string or null",
        });
    }
    deserialize(value)
}

pub fn parse_consolidation_output(text: &str) -> Result<ConsolidationOutput, SchemaError> {
    let value = parse_json_payload(text)?;
    let object = as_object(&value, "output")?;
    expect_exact_keys(
        object,
        &["memory_md", "memory_summary", "skills"],
        &[],
        "output",
    )?;
    expect_string(object, "memory_md", "output")?;
    expect_string(object, "memory_summary", "output")?;
    for (index, skill) in expect_array(object, "skills", "output")?.iter().enumerate() {
        validate_skill(skill, &format!("skills[{index}]"))?;
    }
    deserialize(value)
}

fn validate_skill(skill: &Value, context: &str) -> Result<(), SchemaError> {
    let object = as_object(skill, context)?;
    expect_exact_keys(
        object,
        &["name"],
        &["content", "scripts", "templates", "examples"],
        context,
    )?;
    expect_string(object, "name", context)?;
    if object.contains_key("content") {
        expect_string(object, "content", context)?;
    }
    for list in SKILL_FILE_LISTS {
        if !object.contains_key(list) {
            continue;
        }
        for (index, file) in expect_array(object, list, context)?.iter().enumerate() {
            let file_context = format!("{context}.{list}[{index}]");
            let file = as_object(file, &file_context)?;
            expect_exact_keys(file, &["path", "content"], &[], &file_context)?;
            expect_string(file, "path", &file_context)?;
            expect_string(file, "content", &file_context)?;
        }
    }
    Ok(())
}

/// Parses the model text as JSON, tolerating one surrounding markdown fence.
fn parse_json_payload(text: &str) -> Result<Value, SchemaError> {
    serde_json::from_str(strip_code_fence(text))
        .map_err(|err| SchemaError::InvalidJson(err.to_string()))
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`, ...) on the opening fence line.
    match body.split_once('\n') {
        Some((info, rest)) if !info.trim_start().starts_with('{') => rest.trim(),
        _ => body.trim(),
    }
}

fn as_object<'a>(value: &'a Value, context: &str) -> Result<&'a Map<String, Value>, SchemaError> {
    value.as_object().ok_or_else(|| SchemaError::NotAnObject {
        context: context.to_string(),
    })
}

fn expect_exact_keys(
    object: &Map<String, Value>,
    required: &[&str],
    optional: &[&str],
    context: &str,
) -> Result<(), SchemaError> {
    if let Some(key) = required.iter().find(|key| !object.contains_key(**key)) {
        return Err(SchemaError::MissingKey {
            context: context.to_string(),
            key: (*key).to_string(),
        });
    }
    if let Some(key) = object
        .keys()
        .find(|key| !required.contains(&key.as_str()) && !optional.contains(&key.as_str()))
    {
        return Err(SchemaError::UnexpectedKey {
            context: context.to_string(),
            key: key.clone(),
        });
    }
    Ok(())
}

fn expect_string(
    object: &Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<(), SchemaError> {
    match object.get(key) {
        Some(Value::String(_)) => Ok(()),
        _ => Err(SchemaError::WrongType {
            context: context.to_string(),
            key: key.to_string(),
            expected: "a string",
        }),
    }
}

fn expect_array<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<&'a Vec<Value>, SchemaError> {
    object
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| SchemaError::WrongType {
            context: context.to_string(),
            key: key.to_string(),
            expected: "an array",
        })
}

fn deserialize<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, SchemaError> {
    serde_json::from_value(value).map_err(|err| SchemaError::InvalidJson(err.to_string()))
}
