//! Tool dispatch: turn the envelopes of one model turn into the response
//! text that is fed back as the next input.

use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use hearth_config::ToolCallPolicy;
use hearth_core::{DispatchError, EventBus, Result, SessionEvent, ToolCall, ToolRegistry};
use tracing::{debug, info, warn};

use crate::envelope::{self, EnvelopeScanner, ParsedCall};

/// How one envelope will be answered.
enum Planned {
    Run(ToolCall),
    Reject { id: i64, name: String, message: String },
}

pub struct ToolDispatcher {
    registry: ToolRegistry,
    scanner: EnvelopeScanner,
    policy: ToolCallPolicy,
    events: EventBus,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, policy: ToolCallPolicy, events: EventBus) -> Result<Self> {
        Ok(Self {
            registry,
            scanner: EnvelopeScanner::new()?,
            policy,
            events,
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn contains_call(&self, output: &str) -> bool {
        self.scanner.contains_call(output)
    }

    /// Execute every call in `output` and return the concatenated response
    /// envelopes, or `None` when the turn holds no calls.
    ///
    /// Calls run concurrently; responses keep call order. A failing tool is
    /// answered with an error envelope. Malformed envelopes and unknown
    /// tools follow the configured policy and are checked before any tool
    /// runs.
    pub async fn dispatch(&self, output: &str) -> Result<Option<String>> {
        let parsed = self.scanner.scan(output);
        if parsed.is_empty() {
            return Ok(None);
        }

        let mut planned = Vec::with_capacity(parsed.len());
        for call in parsed {
            planned.push(self.plan(call)?);
        }
        debug!(calls = planned.len(), "dispatching tool calls");

        let responses = join_all(planned.into_iter().map(|p| self.answer(p))).await;
        Ok(Some(responses.concat()))
    }

    fn plan(&self, parsed: ParsedCall) -> Result<Planned> {
        match parsed {
            ParsedCall::Call(call) if self.registry.contains(&call.name) => Ok(Planned::Run(call)),
            ParsedCall::Call(call) => {
                warn!(tool = %call.name, "model requested an unknown tool");
                match self.policy {
                    ToolCallPolicy::Fatal => Err(DispatchError::UnknownTool(call.name).into()),
                    ToolCallPolicy::Recover => Ok(Planned::Reject {
                        id: call.id,
                        message: format!("unknown tool '{}'", call.name),
                        name: call.name,
                    }),
                }
            }
            ParsedCall::Malformed {
                position,
                reason,
                envelope,
            } => {
                warn!(position, %reason, "malformed tool call");
                match self.policy {
                    ToolCallPolicy::Fatal => {
                        Err(DispatchError::MalformedCall { reason, envelope }.into())
                    }
                    ToolCallPolicy::Recover => Ok(Planned::Reject {
                        id: position,
                        name: String::new(),
                        message: format!("malformed tool call: {reason}"),
                    }),
                }
            }
        }
    }

    async fn answer(&self, planned: Planned) -> String {
        let call = match planned {
            Planned::Run(call) => call,
            Planned::Reject { id, name, message } => {
                return envelope::error_response(id, &name, &message);
            }
        };

        let start = Instant::now();
        let result = self.registry.execute(&call).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.events.publish(SessionEvent::ToolExecuted {
            tool_name: call.name.clone(),
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        match result {
            Ok(output) => {
                info!(tool = %call.name, id = call.id, duration_ms, "tool executed");
                envelope::response(call.id, &call.name, &output)
            }
            Err(e) => {
                warn!(tool = %call.name, id = call.id, error = %e, "tool failed");
                envelope::error_response(call.id, &call.name, &e.to_string())
            }
        }
    }
}
