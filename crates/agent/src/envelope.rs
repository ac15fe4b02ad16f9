//! The textual tool-call protocol between the model and the dispatcher.
//!
//! The model asks for a call with
//!
//! ```text
//! <tool_call>{"id": 1, "name": "sum", "arguments": {"a": 1, "b": 2}}</tool_call>
//! ```
//!
//! and is answered with one `<tool_response>` envelope per call, carrying
//! either a `result` or an `error`.

use hearth_core::{Error, Result, ToolArguments, ToolCall, ToolSchema};
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

pub const CALL_OPEN: &str = "<tool_call>";
pub const CALL_CLOSE: &str = "</tool_call>";
pub const RESPONSE_OPEN: &str = "<tool_response>";
pub const RESPONSE_CLOSE: &str = "</tool_response>";

// lazy body capture, so a second envelope is never swallowed by the first
const CALL_PATTERN: &str = r"<tool_call>([\s\S]*?)</tool_call>";

/// One envelope found in model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCall {
    Call(ToolCall),
    Malformed {
        /// 1-based position among the envelopes of the turn
        position: i64,
        reason: String,
        envelope: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawCall {
    #[serde(default)]
    id: Option<Value>,
    name: String,
    #[serde(default, alias = "parameters")]
    arguments: Value,
}

/// Finds and parses tool-call envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeScanner {
    pattern: Regex,
}

impl EnvelopeScanner {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(CALL_PATTERN)
            .map_err(|e| Error::Internal(format!("tool call pattern: {e}")))?;
        Ok(Self { pattern })
    }

    pub fn contains_call(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Every envelope in `text`, in order of appearance.
    pub fn scan(&self, text: &str) -> Vec<ParsedCall> {
        self.pattern
            .captures_iter(text)
            .enumerate()
            .map(|(i, caps)| {
                let position = i as i64 + 1;
                let body = caps.get(1).map_or("", |m| m.as_str());
                match parse_call(body, position) {
                    Ok(call) => ParsedCall::Call(call),
                    Err(reason) => ParsedCall::Malformed {
                        position,
                        reason,
                        envelope: caps.get(0).map_or("", |m| m.as_str()).to_string(),
                    },
                }
            })
            .collect()
    }
}

fn parse_call(body: &str, position: i64) -> std::result::Result<ToolCall, String> {
    let raw: RawCall = serde_json::from_str(body.trim()).map_err(|e| e.to_string())?;

    let id = match raw.id {
        None | Some(Value::Null) => position,
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| format!("call id {n} is not an integer"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| format!("call id '{s}' is not an integer"))?,
        Some(other) => return Err(format!("call id must be an integer, got {other}")),
    };

    // some models send the arguments object as an encoded string
    let arguments = match raw.arguments {
        Value::String(s) => serde_json::from_str(&s).map_err(|e| format!("arguments: {e}"))?,
        other => other,
    };
    let arguments = ToolArguments::from_value(arguments).map_err(|e| e.to_string())?;

    Ok(ToolCall {
        id,
        name: raw.name,
        arguments,
    })
}

/// Wrap a tool's output. Output that is itself JSON is embedded as JSON.
pub fn response(id: i64, name: &str, output: &str) -> String {
    let result = serde_json::from_str::<Value>(output).unwrap_or_else(|_| json!(output));
    wrap(json!({ "id": id, "name": name, "result": result }))
}

pub fn error_response(id: i64, name: &str, message: &str) -> String {
    wrap(json!({ "id": id, "name": name, "error": message }))
}

fn wrap(body: Value) -> String {
    format!("{RESPONSE_OPEN}{body}{RESPONSE_CLOSE}")
}

/// System preamble describing the available tools and the envelope format.
pub fn preamble(schemas: &[ToolSchema]) -> String {
    let tools: Vec<String> = schemas.iter().map(|s| s.to_json().to_string()).collect();
    format!(
        "You are a function calling AI model. You are provided with function signatures \
         within <tools></tools> XML tags. You may call one or more functions to assist with \
         the user query. Don't make assumptions about what values to plug into functions.\n\
         <tools>\n{tools}\n</tools>\n\
         For each function call return a JSON object with the call number, function name and \
         arguments within {CALL_OPEN}{CALL_CLOSE} XML tags as follows:\n\
         {CALL_OPEN}{{\"id\": <call-number>, \"name\": <function-name>, \"arguments\": <args-dict>}}{CALL_CLOSE}\n\
         Each result is returned within {RESPONSE_OPEN}{RESPONSE_CLOSE} XML tags. \
         When no function is needed, answer the user directly.\n",
        tools = tools.join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{ParamType, ToolParameter};

    fn scanner() -> EnvelopeScanner {
        EnvelopeScanner::new().unwrap()
    }

    #[test]
    fn scan_finds_calls_in_order_without_greedy_overlap() {
        let text = r#"Let me check.
<tool_call>{"id":1,"name":"sum","arguments":{"a":1,"b":2}}</tool_call>
<tool_call>{"id":2,"name":"clock","arguments":{}}</tool_call>"#;
        let calls = scanner().scan(text);
        assert_eq!(calls.len(), 2);
        let ParsedCall::Call(first) = &calls[0] else {
            panic!("expected a call");
        };
        assert_eq!(first.name, "sum");
        assert_eq!(first.arguments.i64("b").unwrap(), 2);
        let ParsedCall::Call(second) = &calls[1] else {
            panic!("expected a call");
        };
        assert_eq!((second.id, second.name.as_str()), (2, "clock"));
    }

    #[test]
    fn missing_id_falls_back_to_position_and_parameters_alias_works() {
        let text = r#"<tool_call>{"name":"a"}</tool_call><tool_call>{"name":"b","parameters":{"x":"y"}}</tool_call>"#;
        let calls = scanner().scan(text);
        match &calls[1] {
            ParsedCall::Call(call) => {
                assert_eq!(call.id, 2);
                assert_eq!(call.arguments.str("x").unwrap(), "y");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn string_encoded_arguments_are_decoded() {
        let text = r#"<tool_call>{"id":"7","name":"sum","arguments":"{\"a\":4}"}</tool_call>"#;
        let ParsedCall::Call(call) = &scanner().scan(text)[0] else {
            panic!("expected a call");
        };
        assert_eq!(call.id, 7);
        assert_eq!(call.arguments.i64("a").unwrap(), 4);
    }

    #[test]
    fn malformed_body_is_reported_not_dropped() {
        let text = "<tool_call>{not json}</tool_call>";
        match &scanner().scan(text)[0] {
            ParsedCall::Malformed {
                position, envelope, ..
            } => {
                assert_eq!(*position, 1);
                assert_eq!(envelope, text);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plain_text_has_no_calls() {
        assert!(!scanner().contains_call("The answer is 3."));
        assert!(scanner().scan("<tool_call> unterminated").is_empty());
    }

    #[test]
    fn response_embeds_json_results_and_quotes_text() {
        assert_eq!(
            response(1, "sum", "3"),
            r#"<tool_response>{"id":1,"name":"sum","result":3}</tool_response>"#
        );
        assert_eq!(
            response(2, "clock", "noon"),
            r#"<tool_response>{"id":2,"name":"clock","result":"noon"}</tool_response>"#
        );
        assert_eq!(
            error_response(3, "x", "boom"),
            r#"<tool_response>{"error":"boom","id":3,"name":"x"}</tool_response>"#
        );
    }

    #[test]
    fn preamble_lists_every_schema() {
        let schema = ToolSchema {
            name: "sum".into(),
            description: "Add".into(),
            parameters: vec![ToolParameter::required("a", ParamType::Integer, "first")],
        };
        let text = preamble(&[schema]);
        assert!(text.contains(r#""name":"sum""#));
        assert!(text.contains("<tool_call>{\"id\": <call-number>"));
        assert!(text.contains("<tools>"));
    }
}
