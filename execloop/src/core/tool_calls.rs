//! Structured tool calls embedded in model output.
//!
//! Wire format: a fenced block tagged [`TOOL_FENCE`] holding one JSON object
//! `{"tool": ..., "params": {...}}`. Plain `json` fences are never treated as
//! tool calls. Parsing never fails as a whole: each malformed fence becomes a
//! [`ToolCallError`] next to the calls that did parse.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::markdown::fenced_blocks;

/// Info-string tag that marks a fenced block as a tool call.
pub const TOOL_FENCE: &str = "json-tool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigateOp {
    List,
    Read,
    Write,
    Mkdir,
    Delete,
    Stat,
}

impl NavigateOp {
    const ALL: [NavigateOp; 6] = [
        Self::List,
        Self::Read,
        Self::Write,
        Self::Mkdir,
        Self::Delete,
        Self::Stat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Read => "read",
            Self::Write => "write",
            Self::Mkdir => "mkdir",
            Self::Delete => "delete",
            Self::Stat => "stat",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == raw)
    }
}

impl fmt::Display for NavigateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_dirs: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateParams {
    pub op: NavigateOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_options: Option<WriteOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mkdir_options: Option<MkdirOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_options: Option<DeleteOptions>,
}

/// A validated tool call. Constructed by [`parse_tool_calls`], consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "params", rename_all = "camelCase")]
pub enum ToolCall {
    Navigate(NavigateParams),
    VersionControl(Map<String, Value>),
}

impl ToolCall {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Navigate(_) => "navigate",
            Self::VersionControl(_) => "versionControl",
        }
    }
}

/// A fence that could not be turned into a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallError {
    pub error: String,
    /// Raw fence body, kept for diagnostics.
    pub fence: String,
}

/// Everything found in one document: valid calls and per-fence errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCallParse {
    pub calls: Vec<ToolCall>,
    pub errors: Vec<ToolCallError>,
}

/// Parse every tool-call fence in `markdown`.
pub fn parse_tool_calls(markdown: &str) -> ToolCallParse {
    let mut parsed = ToolCallParse::default();
    debug!(chars = markdown.len(), "scanning markdown for tool calls");

    let fences = fenced_blocks(markdown)
        .into_iter()
        .filter(|block| block.lang.as_deref() == Some(TOOL_FENCE));

    for block in fences {
        let fence = block.body.trim().to_string();
        let outcome = serde_json::from_str::<Value>(&fence)
            .map_err(|err| format!("invalid JSON: {err}"))
            .and_then(|value| parse_tool_call(&value));
        match outcome {
            Ok(call) => {
                debug!(tool = call.tool_name(), "valid tool call");
                parsed.calls.push(call);
            }
            Err(error) => {
                warn!(%error, "invalid tool call");
                parsed.errors.push(ToolCallError { error, fence });
            }
        }
    }

    info!(
        valid = parsed.calls.len(),
        errors = parsed.errors.len(),
        "tool calls parsed"
    );
    parsed
}

/// Validate one decoded JSON value against the closed tool-call schema.
pub fn parse_tool_call(value: &Value) -> Result<ToolCall, String> {
    let Some(obj) = value.as_object() else {
        return Err("tool call must be an object".to_string());
    };

    let empty = Map::new();
    let params = obj
        .get("params")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    match obj.get("tool").and_then(Value::as_str) {
        Some("navigate") => parse_navigate(params).map(ToolCall::Navigate),
        Some("versionControl") => Ok(ToolCall::VersionControl(params.clone())),
        _ => Err(format!(
            "unknown tool: {}",
            obj.get("tool").map(display_value).unwrap_or_else(|| "undefined".to_string())
        )),
    }
}

fn parse_navigate(params: &Map<String, Value>) -> Result<NavigateParams, String> {
    let op = params
        .get("op")
        .and_then(Value::as_str)
        .and_then(NavigateOp::parse)
        .ok_or_else(|| {
            format!(
                "navigate.op must be one of list|read|write|mkdir|delete|stat (got: {})",
                params.get("op").map(display_value).unwrap_or_else(|| "undefined".to_string())
            )
        })?;

    let path = params
        .get("path")
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .map(str::to_string);
    let content = params
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    if op != NavigateOp::List && path.is_none() {
        return Err(format!("navigate.op={op} requires params.path"));
    }
    if op == NavigateOp::Write && content.is_none() {
        return Err("navigate.op=write requires params.content".to_string());
    }

    let write_options = params.get("writeOptions").and_then(Value::as_object).map(|opts| WriteOptions {
        append: opts.get("append").and_then(Value::as_bool),
        create_dirs: opts.get("createDirs").and_then(Value::as_bool),
    });
    let mkdir_options = params.get("mkdirOptions").and_then(Value::as_object).map(|opts| MkdirOptions {
        recursive: opts.get("recursive").and_then(Value::as_bool),
    });
    let delete_options = params.get("deleteOptions").and_then(Value::as_object).map(|opts| DeleteOptions {
        recursive: opts.get("recursive").and_then(Value::as_bool),
    });

    Ok(NavigateParams {
        op,
        path,
        content,
        write_options,
        mkdir_options,
        delete_options,
    })
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence(body: &str) -> String {
        format!("```json-tool\n{body}\n```\n")
    }

    #[test]
    fn parses_navigate_and_version_control_calls() {
        let md = format!(
            "Doing things.\n\n{}\n{}",
            fence(r#"{"tool":"navigate","params":{"op":"mkdir","path":"src","mkdirOptions":{"recursive":true}}}"#),
            fence(r#"{"tool":"versionControl","params":{"commitMessage":"feat: x"}}"#),
        );
        let parsed = parse_tool_calls(&md);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        assert_eq!(parsed.calls.len(), 2);

        let ToolCall::Navigate(params) = &parsed.calls[0] else {
            panic!("expected navigate call");
        };
        assert_eq!(params.op, NavigateOp::Mkdir);
        assert_eq!(params.path.as_deref(), Some("src"));
        assert_eq!(
            params.mkdir_options,
            Some(MkdirOptions {
                recursive: Some(true)
            })
        );

        let ToolCall::VersionControl(params) = &parsed.calls[1] else {
            panic!("expected versionControl call");
        };
        assert_eq!(params.get("commitMessage"), Some(&Value::from("feat: x")));
    }

    #[test]
    fn write_without_content_is_rejected() {
        let md = fence(r#"{"tool":"navigate","params":{"op":"write","path":"a.txt"}}"#);
        let parsed = parse_tool_calls(&md);
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].error, "navigate.op=write requires params.content");
        assert!(parsed.errors[0].fence.contains("\"a.txt\""));
    }

    #[test]
    fn write_with_empty_content_is_valid() {
        let md = fence(r#"{"tool":"navigate","params":{"op":"write","path":"a.txt","content":""}}"#);
        let parsed = parse_tool_calls(&md);
        assert!(parsed.errors.is_empty());
        let ToolCall::Navigate(params) = &parsed.calls[0] else {
            panic!("expected navigate call");
        };
        assert_eq!(params.content.as_deref(), Some(""));
    }

    #[test]
    fn plain_json_fences_are_ignored() {
        let md = "```json\n{\"tool\":\"navigate\",\"params\":{\"op\":\"list\"}}\n```\n";
        let parsed = parse_tool_calls(md);
        assert!(parsed.calls.is_empty());
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn tool_fence_tag_is_case_sensitive() {
        let body = "{\"tool\":\"navigate\",\"params\":{\"op\":\"list\"}}";
        let shouted = format!("```JSON-TOOL\n{body}\n```\n");
        assert!(parse_tool_calls(&shouted).calls.is_empty());
        assert_eq!(parse_tool_calls(&fence(body)).calls.len(), 1);
    }

    #[test]
    fn one_bad_fence_does_not_block_others() {
        let md = format!(
            "{}\n{}\n{}\n{}",
            fence("{not json"),
            fence(r#"["navigate"]"#),
            fence(r#"{"tool":"shell","params":{}}"#),
            fence(r#"{"tool":"navigate","params":{"op":"list"}}"#),
        );
        let parsed = parse_tool_calls(&md);
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.errors.len(), 3);
        assert!(parsed.errors[0].error.starts_with("invalid JSON"));
        assert_eq!(parsed.errors[1].error, "tool call must be an object");
        assert_eq!(parsed.errors[2].error, "unknown tool: shell");
    }

    #[test]
    fn path_is_required_except_for_list() {
        for op in ["read", "mkdir", "delete", "stat"] {
            let value: Value = serde_json::json!({"tool": "navigate", "params": {"op": op}});
            let err = parse_tool_call(&value).unwrap_err();
            assert_eq!(err, format!("navigate.op={op} requires params.path"));
        }
        let list = serde_json::json!({"tool": "navigate", "params": {"op": "list"}});
        assert!(parse_tool_call(&list).is_ok());
    }

    #[test]
    fn unknown_op_names_the_value() {
        let value = serde_json::json!({"tool": "navigate", "params": {"op": "chmod", "path": "x"}});
        let err = parse_tool_call(&value).unwrap_err();
        assert!(err.ends_with("(got: chmod)"), "{err}");
    }

    #[test]
    fn tool_call_serializes_to_wire_shape() {
        let call = ToolCall::Navigate(NavigateParams {
            op: NavigateOp::Read,
            path: Some("a.txt".to_string()),
            content: None,
            write_options: None,
            mkdir_options: None,
            delete_options: None,
        });
        let value = serde_json::to_value(&call).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"tool": "navigate", "params": {"op": "read", "path": "a.txt"}})
        );
    }
}
