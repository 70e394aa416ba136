//! Routes parsed tool calls to the navigator and the version-control collaborator.
//!
//! Missing collaborators and unauthorized version-control calls are skipped,
//! never treated as errors. Tracing is optional and does not change behavior.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::core::tool_calls::{ToolCall, ToolCallError, ToolCallParse};
use crate::io::navigator::Navigator;
use crate::io::retry::{RetryPolicy, retry_with_backoff};
use crate::io::trace::TraceSink;
use crate::io::version_control::{VcRequest, VersionControl};

/// What happened to one tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DispatchOutcome {
    Ok { tool: &'static str, result: Value },
    Error { tool: &'static str, error: String },
    Skipped { tool: &'static str, reason: String },
}

impl DispatchOutcome {
    pub fn tool(&self) -> &'static str {
        match self {
            Self::Ok { tool, .. } | Self::Error { tool, .. } | Self::Skipped { tool, .. } => *tool,
        }
    }
}

/// Outcomes for every valid call plus the parse errors carried through.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub outcomes: Vec<DispatchOutcome>,
    pub parse_errors: Vec<ToolCallError>,
}

struct VcHandle<'a> {
    backend: &'a dyn VersionControl,
    authorized: bool,
    defaults: VcRequest,
}

/// Dispatches tool calls. Collaborators are borrowed for one run.
pub struct ToolDispatcher<'a> {
    navigator: Option<&'a Navigator>,
    version_control: Option<VcHandle<'a>>,
    trace: Option<&'a dyn TraceSink>,
    retry: RetryPolicy,
}

impl Default for ToolDispatcher<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ToolDispatcher<'a> {
    pub fn new() -> Self {
        Self {
            navigator: None,
            version_control: None,
            trace: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_navigator(mut self, navigator: &'a Navigator) -> Self {
        self.navigator = Some(navigator);
        self
    }

    /// Enable version-control calls. They only run when `authorized`.
    pub fn with_version_control(
        mut self,
        backend: &'a dyn VersionControl,
        authorized: bool,
        defaults: VcRequest,
    ) -> Self {
        self.version_control = Some(VcHandle {
            backend,
            authorized,
            defaults,
        });
        self
    }

    pub fn with_trace(mut self, trace: &'a dyn TraceSink) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Dispatch every call in `parse`, in order. Only cancellation aborts the batch.
    #[instrument(skip_all, fields(calls = parse.calls.len(), parse_errors = parse.errors.len(), iter = ?iter))]
    pub fn dispatch(
        &self,
        parse: &ToolCallParse,
        iter: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        if !parse.calls.is_empty() || !parse.errors.is_empty() {
            self.emit(
                iter,
                "tool.parse",
                json!({"calls": parse.calls.len(), "errors": parse.errors}),
            );
        }

        let mut outcomes = Vec::with_capacity(parse.calls.len());
        for call in &parse.calls {
            cancel.check("tool dispatch")?;
            self.emit(iter, "tool.dispatch", json!({"call": call}));
            let outcome = self.dispatch_one(call, cancel)?;
            match &outcome {
                DispatchOutcome::Ok { tool, .. } => info!(tool, "tool call succeeded"),
                DispatchOutcome::Error { tool, error } => warn!(tool, %error, "tool call failed"),
                DispatchOutcome::Skipped { tool, reason } => info!(tool, %reason, "tool call skipped"),
            }
            self.emit(
                iter,
                "tool.result",
                serde_json::to_value(&outcome).unwrap_or(Value::Null),
            );
            outcomes.push(outcome);
        }

        Ok(DispatchReport {
            outcomes,
            parse_errors: parse.errors.clone(),
        })
    }

    fn dispatch_one(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<DispatchOutcome> {
        let tool = call.tool_name();
        match call {
            ToolCall::Navigate(params) => {
                let Some(navigator) = self.navigator else {
                    return Ok(DispatchOutcome::Skipped {
                        tool,
                        reason: "navigator disabled".to_string(),
                    });
                };
                Ok(match navigator.run(params) {
                    Ok(success) => DispatchOutcome::Ok {
                        tool,
                        result: serde_json::to_value(&success).unwrap_or(Value::Null),
                    },
                    Err(err) => DispatchOutcome::Error {
                        tool,
                        error: err.to_string(),
                    },
                })
            }
            ToolCall::VersionControl(params) => {
                let Some(vc) = &self.version_control else {
                    return Ok(DispatchOutcome::Skipped {
                        tool,
                        reason: "version control not configured".to_string(),
                    });
                };
                if !vc.authorized {
                    return Ok(DispatchOutcome::Skipped {
                        tool,
                        reason: "version control not authorized (enable version_control.before or .after)"
                            .to_string(),
                    });
                }
                let request = vc.defaults.with_params(params);
                debug!(?request, "running version control from tool call");
                let result = retry_with_backoff("version control", self.retry, cancel, |_| {
                    vc.backend.run(&request)
                });
                match result {
                    Ok(outcome) => Ok(DispatchOutcome::Ok {
                        tool,
                        result: serde_json::to_value(&outcome).unwrap_or(Value::Null),
                    }),
                    Err(err) if crate::cancel::is_cancelled_error(&err) => Err(err),
                    Err(err) => Ok(DispatchOutcome::Error {
                        tool,
                        error: format!("{err:#}"),
                    }),
                }
            }
        }
    }

    fn emit(&self, iter: Option<u32>, event: &str, data: Value) {
        if let Some(trace) = self.trace {
            trace.emit(iter, event, Some(data));
        }
    }
}
