//! Inbound `/v1/messages` body validation
//!
//! The body is checked against the Messages schema but forwarded as the
//! original JSON value, so fields the gateway does not model (`metadata`,
//! `thinking`, ...) pass through untouched.

use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Deserialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Value>,
    max_tokens: u64,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    top_k: Option<u64>,
    #[serde(default)]
    system: Option<Value>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    tools: Option<Vec<Value>>,
    #[serde(default)]
    tool_choice: Option<Value>,
}

/// A body that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub body: Value,
    pub model: String,
    pub stream: bool,
}

pub fn validate(bytes: &[u8]) -> Result<ValidatedRequest, GatewayError> {
    let body: Value = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::Validation(format!("request body is not valid JSON: {e}")))?;
    if !body.is_object() {
        return Err(GatewayError::Validation(
            "request body must be a JSON object".into(),
        ));
    }
    let parsed: MessagesRequest = serde_json::from_value(body.clone())
        .map_err(|e| GatewayError::Validation(format!("invalid messages request: {e}")))?;

    if parsed.model.trim().is_empty() {
        return Err(GatewayError::Validation("model must not be empty".into()));
    }
    if parsed.messages.is_empty() {
        return Err(GatewayError::Validation(
            "messages must contain at least one message".into(),
        ));
    }
    if parsed.max_tokens == 0 {
        return Err(GatewayError::Validation(
            "max_tokens must be greater than 0".into(),
        ));
    }
    for (name, value) in [("temperature", parsed.temperature), ("top_p", parsed.top_p)] {
        if let Some(v) = value
            && !(0.0..=1.0).contains(&v)
        {
            return Err(GatewayError::Validation(format!(
                "{name} must be between 0 and 1, got {v}"
            )));
        }
    }
    if parsed.top_k == Some(0) {
        return Err(GatewayError::Validation(
            "top_k must be greater than 0".into(),
        ));
    }
    if let Some(stops) = &parsed.stop_sequences
        && stops.iter().any(|stop| stop.is_empty())
    {
        return Err(GatewayError::Validation(
            "stop_sequences must not contain empty strings".into(),
        ));
    }
    if let Some(tools) = &parsed.tools
        && let Some(index) = tools.iter().position(|tool| !has_string(tool, "name"))
    {
        return Err(GatewayError::Validation(format!(
            "tools[{index}] must be an object with a string name"
        )));
    }
    if let Some(choice) = &parsed.tool_choice
        && !has_string(choice, "type")
    {
        return Err(GatewayError::Validation(
            "tool_choice must be an object with a string type".into(),
        ));
    }
    if let Some(system) = &parsed.system
        && !(system.is_string() || system.is_array())
    {
        return Err(GatewayError::Validation(
            "system must be a string or an array of content blocks".into(),
        ));
    }

    Ok(ValidatedRequest {
        model: parsed.model,
        stream: parsed.stream.unwrap_or(false),
        body,
    })
}

fn has_string(value: &Value, field: &str) -> bool {
    value.get(field).is_some_and(Value::is_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_message(body: &str) -> String {
        match validate(body.as_bytes()) {
            Err(GatewayError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn minimal_request_is_accepted_and_kept_verbatim() {
        let raw = r#"{"model":"claude-sonnet-4","messages":[{"role":"user","content":"hi"}],"max_tokens":16,"metadata":{"user_id":"u1"}}"#;
        let validated = validate(raw.as_bytes()).unwrap();
        assert_eq!(validated.model, "claude-sonnet-4");
        assert!(!validated.stream);
        assert_eq!(validated.body["metadata"]["user_id"], "u1");
    }

    #[test]
    fn stream_flag_is_read() {
        let raw = r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"max_tokens":1,"stream":true}"#;
        assert!(validate(raw.as_bytes()).unwrap().stream);
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(err_message("not json").contains("not valid JSON"));
        assert!(err_message("[1,2]").contains("JSON object"));
        assert!(err_message(r#"{"messages":[{}],"max_tokens":1}"#).contains("model"));
        assert!(err_message(r#"{"model":"m","messages":[],"max_tokens":1}"#).contains("messages"));
        assert!(
            err_message(r#"{"model":"m","messages":[{}],"max_tokens":0}"#).contains("max_tokens")
        );
        assert!(
            err_message(r#"{"model":" ","messages":[{}],"max_tokens":1}"#).contains("model")
        );
    }

    #[test]
    fn sampling_parameters_are_range_checked() {
        assert!(
            err_message(r#"{"model":"m","messages":[{}],"max_tokens":1,"temperature":1.5}"#)
                .contains("temperature")
        );
        assert!(
            err_message(r#"{"model":"m","messages":[{}],"max_tokens":1,"top_p":-0.1}"#)
                .contains("top_p")
        );
        assert!(
            err_message(r#"{"model":"m","messages":[{}],"max_tokens":1,"system":42}"#)
                .contains("system")
        );
    }

    #[test]
    fn tool_and_stop_fields_are_shape_checked() {
        let base = r#""model":"m","messages":[{}],"max_tokens":1"#;
        let check = |extra: &str| err_message(&format!("{{{base},{extra}}}"));

        assert!(check(r#""top_k":0"#).contains("top_k"));
        assert!(check(r#""top_k":-1"#).contains("invalid"));
        assert!(check(r#""stop_sequences":"x""#).contains("expected a sequence"));
        assert!(check(r#""stop_sequences":["ok",""]"#).contains("stop_sequences"));
        assert!(check(r#""tools":{"name":"t"}"#).contains("expected a sequence"));
        assert!(check(r#""tools":[{"name":"t"},{"input_schema":{}}]"#).contains("tools[1]"));
        assert!(check(r#""tool_choice":"auto""#).contains("tool_choice"));

        let ok = format!(
            r#"{{{base},"top_k":5,"stop_sequences":["\n\nHuman:"],"tools":[{{"name":"lookup","input_schema":{{"type":"object"}}}}],"tool_choice":{{"type":"auto"}}}}"#
        );
        let validated = validate(ok.as_bytes()).unwrap();
        assert_eq!(validated.body["tools"][0]["name"], "lookup");
    }
}
