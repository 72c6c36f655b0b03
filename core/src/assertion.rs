use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::HarnessError;
use crate::suite::{BodyAssertions, Expectation, ResponseShape};
use crate::template::value_to_text;
use crate::transport::HttpResponse;

/// Structural reading of a response body, decided once before any field is
/// inspected.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Empty,
    SuccessEnvelope { success: bool, body: Value },
    ErrorEnvelope { error: String, body: Value },
    Json(Value),
    Binary { content_type: String, len: usize },
}

impl ResponseKind {
    pub fn classify(response: &HttpResponse) -> Self {
        if response.body.is_empty() {
            return ResponseKind::Empty;
        }
        let Some(body) = response.json() else {
            return ResponseKind::Binary {
                content_type: response
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                len: response.body.len(),
            };
        };
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return ResponseKind::ErrorEnvelope {
                error: error.to_string(),
                body,
            };
        }
        if let Some(success) = body.get("success").and_then(Value::as_bool) {
            return ResponseKind::SuccessEnvelope { success, body };
        }
        ResponseKind::Json(body)
    }

    pub fn json(&self) -> Option<&Value> {
        match self {
            ResponseKind::SuccessEnvelope { body, .. }
            | ResponseKind::ErrorEnvelope { body, .. }
            | ResponseKind::Json(body) => Some(body),
            ResponseKind::Empty | ResponseKind::Binary { .. } => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ResponseKind::Empty => "an empty body",
            ResponseKind::SuccessEnvelope { .. } => "a success envelope",
            ResponseKind::ErrorEnvelope { .. } => "an error envelope",
            ResponseKind::Json(_) => "a plain JSON body",
            ResponseKind::Binary { .. } => "a binary body",
        }
    }
}

pub fn status_matches(expect: &Expectation, status: u16) -> bool {
    match expect {
        Expectation::MustSucceed => (200..300).contains(&status),
        Expectation::MustFail(expected) => status == *expected,
        Expectation::MayFail => true,
        Expectation::AnyOf(statuses) => statuses.contains(&status),
    }
}

/// Checks a response against a step's expectation and body assertions and
/// reports the first mismatch. Status is always checked first. Success-body
/// assertions apply to 2xx responses, error-body assertions to the rest.
pub fn check(
    expect: &Expectation,
    assertions: &BodyAssertions,
    equals: &BTreeMap<String, Value>,
    response: &HttpResponse,
) -> Result<(), HarnessError> {
    if !status_matches(expect, response.status) {
        return Err(HarnessError::Assertion(format!(
            "expected {}, got status {}{}",
            describe(expect),
            response.status,
            error_suffix(response)
        )));
    }

    let kind = ResponseKind::classify(response);
    let success = response.is_success();

    check_shape(&assertions.shape, &kind, response, success)?;

    if success {
        if !assertions.required_keys.is_empty() {
            let object = kind.json().and_then(Value::as_object).ok_or_else(|| {
                HarnessError::Protocol(format!(
                    "expected a JSON object with keys, got {}",
                    kind.label()
                ))
            })?;
            if let Some(key) = assertions
                .required_keys
                .iter()
                .find(|key| !object.contains_key(key.as_str()))
            {
                return Err(HarnessError::Assertion(format!(
                    "response is missing required key '{key}'"
                )));
            }
        }

        for (pointer, expected) in equals {
            let actual = kind.json().and_then(|body| body.pointer(pointer));
            match actual {
                None => {
                    return Err(HarnessError::Assertion(format!(
                        "response has no field at {pointer}"
                    )))
                }
                Some(actual) if !loosely_equal(actual, expected) => {
                    return Err(HarnessError::Assertion(format!(
                        "field {pointer} is {actual}, expected {expected}"
                    )))
                }
                Some(_) => {}
            }
        }
    } else if let Some(needle) = &assertions.error_contains {
        let ResponseKind::ErrorEnvelope { error, .. } = &kind else {
            return Err(HarnessError::Protocol(format!(
                "expected an error envelope, got {}",
                kind.label()
            )));
        };
        if !error.to_lowercase().contains(&needle.to_lowercase()) {
            return Err(HarnessError::Assertion(format!(
                "error '{error}' does not mention '{needle}'"
            )));
        }
    }

    Ok(())
}

fn check_shape(
    shape: &ResponseShape,
    kind: &ResponseKind,
    response: &HttpResponse,
    success: bool,
) -> Result<(), HarnessError> {
    match shape {
        ResponseShape::Any => Ok(()),
        ResponseShape::SuccessEnvelope if success => match kind {
            ResponseKind::SuccessEnvelope { success: true, .. } => Ok(()),
            ResponseKind::SuccessEnvelope { success: false, .. } => Err(
                HarnessError::Assertion("success envelope reports success=false".to_string()),
            ),
            other => Err(HarnessError::Protocol(format!(
                "expected a success envelope, got {}",
                other.label()
            ))),
        },
        ResponseShape::ErrorEnvelope if !success => match kind {
            ResponseKind::ErrorEnvelope { .. } => Ok(()),
            other => Err(HarnessError::Protocol(format!(
                "expected an error envelope, got {}",
                other.label()
            ))),
        },
        ResponseShape::Binary { content_type } if success => {
            let actual = response.content_type().unwrap_or_default();
            if !actual
                .to_ascii_lowercase()
                .starts_with(&content_type.to_ascii_lowercase())
            {
                return Err(HarnessError::Protocol(format!(
                    "expected content type {content_type}, got '{actual}'"
                )));
            }
            if response.body.is_empty() {
                return Err(HarnessError::Protocol(format!(
                    "expected {content_type} payload, got an empty body"
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Pulls each declared key out of a 2xx body. A missing or null field fails
/// the whole extraction so no partial writes reach the context.
pub fn extract(
    rules: &BTreeMap<String, String>,
    response: &HttpResponse,
) -> Result<Vec<(String, Value)>, HarnessError> {
    if rules.is_empty() {
        return Ok(Vec::new());
    }
    let body = response.json().ok_or_else(|| {
        HarnessError::Protocol("cannot extract values from a non-JSON body".to_string())
    })?;
    let mut values = Vec::with_capacity(rules.len());
    for (key, pointer) in rules {
        match body.pointer(pointer) {
            Some(Value::Null) | None => {
                return Err(HarnessError::Protocol(format!(
                    "response has no field at '{pointer}' for context key '{key}'"
                )))
            }
            Some(value) => values.push((key.clone(), value.clone())),
        }
    }
    Ok(values)
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    // path placeholders resolve to text; ids may come back as numbers
    match (actual, expected) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            value_to_text(actual) == value_to_text(expected)
        }
        _ => false,
    }
}

fn describe(expect: &Expectation) -> String {
    match expect {
        Expectation::MustSucceed => "a 2xx status".to_string(),
        Expectation::MustFail(status) => format!("status {status}"),
        Expectation::MayFail => "any status".to_string(),
        Expectation::AnyOf(statuses) => {
            let list: Vec<String> = statuses.iter().map(u16::to_string).collect();
            format!("one of [{}]", list.join(", "))
        }
    }
}

fn error_suffix(response: &HttpResponse) -> String {
    match ResponseKind::classify(response) {
        ResponseKind::ErrorEnvelope { error, .. } => format!(" ({error})"),
        _ => String::new(),
    }
}
