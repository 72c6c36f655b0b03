use serde_json::Value;
use std::collections::BTreeMap;

use crate::context::Context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Context(String),
    Variable(String),
    Secret(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),
    #[error("empty placeholder in '{0}'")]
    Empty(String),
    #[error("context key '{0}' is not set")]
    MissingContext(String),
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("undefined secret '{0}'")]
    UndefinedSecret(String),
}

/// Everything a template may draw from while a step is being resolved.
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub context: &'a Context,
    pub variables: &'a BTreeMap<String, String>,
    pub secrets: &'a BTreeMap<String, String>,
}

pub fn placeholders(value: &str) -> Result<Vec<Placeholder>, TemplateError> {
    let mut found = Vec::new();
    let mut cursor = 0;

    while let Some(start_offset) = value[cursor..].find("${") {
        let start_idx = cursor + start_offset;
        let remainder = &value[start_idx + 2..];
        let end_offset = remainder
            .find('}')
            .ok_or_else(|| TemplateError::Unterminated(value.to_string()))?;
        let token = remainder[..end_offset].trim();
        found.push(classify(token, value)?);
        cursor = start_idx + 2 + end_offset + 1;
    }

    Ok(found)
}

pub fn json_placeholders(value: &Value) -> Result<Vec<Placeholder>, TemplateError> {
    let mut found = Vec::new();
    collect_json(value, &mut found)?;
    Ok(found)
}

fn collect_json(value: &Value, found: &mut Vec<Placeholder>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => found.extend(placeholders(s)?),
        Value::Array(items) => {
            for item in items {
                collect_json(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_json(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn classify(token: &str, source: &str) -> Result<Placeholder, TemplateError> {
    if token.is_empty() {
        return Err(TemplateError::Empty(source.to_string()));
    }
    if let Some(name) = token.strip_prefix("var:") {
        let name = name.trim();
        if name.is_empty() {
            return Err(TemplateError::Empty(source.to_string()));
        }
        return Ok(Placeholder::Variable(name.to_string()));
    }
    if let Some(name) = token.strip_prefix("secret:") {
        let name = name.trim();
        if name.is_empty() {
            return Err(TemplateError::Empty(source.to_string()));
        }
        return Ok(Placeholder::Secret(name.to_string()));
    }
    Ok(Placeholder::Context(token.to_string()))
}

pub fn substitute(value: &str, scope: TemplateScope<'_>) -> Result<String, TemplateError> {
    let mut result = String::with_capacity(value.len());
    let mut cursor = 0;

    while let Some(start_offset) = value[cursor..].find("${") {
        let start_idx = cursor + start_offset;
        result.push_str(&value[cursor..start_idx]);

        let remainder = &value[start_idx + 2..];
        let end_offset = remainder
            .find('}')
            .ok_or_else(|| TemplateError::Unterminated(value.to_string()))?;
        let token = remainder[..end_offset].trim();

        match classify(token, value)? {
            Placeholder::Context(key) => {
                let replacement = scope
                    .context
                    .get(&key)
                    .ok_or(TemplateError::MissingContext(key))?;
                result.push_str(&value_to_text(replacement));
            }
            Placeholder::Variable(name) => {
                let replacement = scope
                    .variables
                    .get(&name)
                    .ok_or(TemplateError::UndefinedVariable(name))?;
                result.push_str(replacement);
            }
            Placeholder::Secret(name) => {
                let replacement = scope
                    .secrets
                    .get(&name)
                    .ok_or(TemplateError::UndefinedSecret(name))?;
                result.push_str(replacement);
            }
        }
        cursor = start_idx + 2 + end_offset + 1;
    }

    result.push_str(&value[cursor..]);
    Ok(result)
}

/// A string that is exactly one context placeholder keeps the JSON type of the
/// stored value; anything else is interpolated as text.
pub fn substitute_json(value: &Value, scope: TemplateScope<'_>) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => {
            if let Some(key) = whole_context_reference(s) {
                return scope
                    .context
                    .get(key)
                    .cloned()
                    .ok_or_else(|| TemplateError::MissingContext(key.to_string()));
            }
            Ok(Value::String(substitute(s, scope)?))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_json(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), substitute_json(item, scope)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn whole_context_reference(value: &str) -> Option<&str> {
    let inner = value.strip_prefix("${")?.strip_suffix('}')?.trim();
    if inner.is_empty() || inner.contains("${") || inner.contains('}') || inner.contains(':') {
        return None;
    }
    Some(inner)
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Replaces every known secret value in diagnostic text with `***`.
#[derive(Debug, Clone, Default)]
pub struct SecretMask {
    values: Vec<String>,
}

impl SecretMask {
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a String>) -> Self {
        let mut values: Vec<String> = secrets
            .into_iter()
            .filter(|value| !value.is_empty())
            .cloned()
            .collect();
        // longest first so a secret containing another is masked whole
        values.sort_by(|a, b| b.len().cmp(&a.len()));
        Self { values }
    }

    pub fn mask(&self, input: &str) -> String {
        let mut masked = input.to_string();
        for value in &self.values {
            masked = masked.replace(value.as_str(), "***");
        }
        masked
    }
}
