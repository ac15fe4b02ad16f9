//! A session that can call tools.
//!
//! The model is told about the registry in a preamble, and the closing
//! delimiter of the call envelope is an anti-prompt, so every turn that
//! requests a call hands control back right after the request. The calls are
//! executed and their responses fed back as the next input line, until the
//! model answers without calling anything.

use std::sync::Arc;

use hearth_config::{AgentConfig, SessionConfig};
use hearth_core::{Error, InferenceBackend, Result, ToolRegistry};
use hearth_engine::{ChatTemplate, OutputChange, Session};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::dispatch::ToolDispatcher;
use crate::envelope::{self, CALL_CLOSE};
use crate::stream_filter::{StreamingToolFilter, TurnEnd};

pub struct ToolSession {
    session: Arc<Session>,
    dispatcher: Arc<ToolDispatcher>,
    max_iterations: u32,
    end_marker: Option<String>,
    /// Held for a whole exchange, so turns of concurrent callers never interleave
    turn: Arc<Mutex<()>>,
}

impl ToolSession {
    /// Start a tool-calling session around `backend`.
    pub fn new<B>(
        config: &SessionConfig,
        agent: &AgentConfig,
        registry: ToolRegistry,
        backend: B,
    ) -> Result<Self>
    where
        B: InferenceBackend + Send + 'static,
    {
        Self::with_factory(config, agent, registry, move || Ok(backend))
    }

    /// Like [`new`](Self::new), building the backend on the session thread.
    pub fn with_factory<B, F>(
        config: &SessionConfig,
        agent: &AgentConfig,
        registry: ToolRegistry,
        factory: F,
    ) -> Result<Self>
    where
        B: InferenceBackend + 'static,
        F: FnOnce() -> Result<B> + Send + 'static,
    {
        let session_config = compose_config(config, &registry);
        let end_marker = match &config.chat_template {
            Some(name) => Some(
                ChatTemplate::from_name(name)
                    .ok_or_else(|| Error::config(format!("unknown chat template '{name}'")))?
                    .end_marker()
                    .to_string(),
            ),
            None => None,
        };

        let session = Session::start_with(session_config, factory)?;
        let dispatcher = ToolDispatcher::new(
            registry,
            agent.malformed_tool_calls,
            session.event_bus(),
        )?;
        info!(
            session = %session.id(),
            tools = dispatcher.registry().len(),
            "tool session started"
        );

        Ok(Self {
            session: Arc::new(session),
            dispatcher: Arc::new(dispatcher),
            max_iterations: agent.max_tool_iterations,
            end_marker,
            turn: Arc::new(Mutex::new(())),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Send `message` and return the model's answer once no tool calls
    /// remain.
    ///
    /// Stops dispatching after `max_tool_iterations` rounds and returns the
    /// last output as it stands.
    pub async fn infer(&self, message: impl Into<String>) -> Result<String> {
        let _turn = self.turn.lock().await;
        let mut output = exchange(&self.session, message.into()).await?;
        let mut rounds = 0;

        while self.dispatcher.contains_call(&output) {
            if rounds >= self.max_iterations {
                warn!(rounds, "max tool iterations reached, returning last output");
                break;
            }
            let Some(responses) = self.dispatcher.dispatch(&output).await? else {
                break;
            };
            rounds += 1;
            debug!(round = rounds, "feeding tool responses back");
            output = exchange(&self.session, responses).await?;
        }

        Ok(strip_marker(output, self.end_marker.as_deref()))
    }

    /// Stream the answer to `message` fragment by fragment.
    ///
    /// Tool calls are withheld from the stream and dispatched as in
    /// [`infer`](Self::infer). Dropping the stream stops dispatching and
    /// deregisters the output observer; the turn in flight still runs to
    /// completion inside the session.
    pub fn inference_stream(&self, message: impl Into<String>) -> ReceiverStream<Result<String>> {
        let (tx, rx) = mpsc::channel::<Result<String>>(128);
        let session = Arc::clone(&self.session);
        let dispatcher = Arc::clone(&self.dispatcher);
        let max_iterations = self.max_iterations;
        let mut filter = StreamingToolFilter::new(self.end_marker.clone());
        let message = message.into();
        let turn = Arc::clone(&self.turn);

        tokio::spawn(async move {
            let turn = turn.lock_owned().await;
            let mut changes = session.subscribe();
            if let Err(e) = send_line(&session, message).await {
                let _ = tx.send(Err(e)).await;
                return;
            }
            let mut rounds = 0;

            loop {
                let change = tokio::select! {
                    _ = tx.closed() => {
                        debug!("stream consumer went away");
                        drop(changes);
                        drain_turn(&session, turn);
                        return;
                    }
                    change = changes.recv() => change,
                };

                match change {
                    Some(OutputChange::Inserted(text)) => {
                        if let Some(fragment) = filter.on_insert(&text) {
                            if tx.send(Ok(fragment)).await.is_err() {
                                drop(changes);
                                drain_turn(&session, turn);
                                return;
                            }
                        }
                    }
                    Some(OutputChange::Removed(_)) => {
                        // the completed line is also waiting in the transport
                        if let Err(e) = receive_line(&session).await {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }

                        let buffer = match filter.on_turn_end() {
                            TurnEnd::Finished(tail) => {
                                if !tail.is_empty() {
                                    let _ = tx.send(Ok(tail)).await;
                                }
                                return;
                            }
                            TurnEnd::ToolCall(buffer) => buffer,
                        };

                        if rounds >= max_iterations {
                            warn!(rounds, "max tool iterations reached, ending stream");
                            return;
                        }
                        let responses = match dispatcher.dispatch(&buffer).await {
                            Ok(Some(responses)) => responses,
                            Ok(None) => {
                                // the envelope never closed; show what was held
                                let _ = tx.send(Ok(buffer)).await;
                                return;
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        };
                        rounds += 1;
                        if tx.is_closed() {
                            return;
                        }
                        if let Err(e) = send_line(&session, responses).await {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                    None => {
                        let err = session.take_failure().unwrap_or(Error::SessionClosed);
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Stop the underlying session. Idempotent.
    pub fn stop(&self) {
        self.session.stop();
    }
}

/// The session config with the tool preamble and call delimiter applied.
///
/// The call delimiter is a stop sequence, not an anti-prompt, so it is never
/// written back into the context at end-of-generation. Unless the caller
/// chose an `n_keep`, the whole composed prompt is anchored against window
/// shifts.
pub fn compose_config(config: &SessionConfig, registry: &ToolRegistry) -> SessionConfig {
    let mut composed = config.clone();
    composed.prompt = format!("{}{}", envelope::preamble(&registry.schemas()), config.prompt);
    composed.antiprompts.retain(|a| a != CALL_CLOSE);
    if !composed.stop_sequences.iter().any(|s| s == CALL_CLOSE) {
        composed.stop_sequences.push(CALL_CLOSE.to_string());
    }
    if composed.n_keep == 0 {
        composed.n_keep = -1;
    }
    composed.interactive_first = true;
    composed
}

fn strip_marker(output: String, marker: Option<&str>) -> String {
    match marker {
        Some(marker) if output.ends_with(marker) => {
            output[..output.len() - marker.len()].to_string()
        }
        _ => output,
    }
}

async fn exchange(session: &Arc<Session>, line: String) -> Result<String> {
    session
        .blocking(move |s| {
            s.send(line)?;
            s.receive()
        })
        .await
}

async fn send_line(session: &Arc<Session>, line: String) -> Result<()> {
    session.blocking(move |s| s.send(line)).await
}

async fn receive_line(session: &Arc<Session>) -> Result<String> {
    session.blocking(|s| s.receive()).await
}

/// Consume the output line of a turn nobody is listening to any more, so
/// the next exchange does not read it. The turn lock is released once the
/// line is gone.
fn drain_turn(session: &Arc<Session>, turn: OwnedMutexGuard<()>) {
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || {
        let _turn = turn;
        if let Ok(line) = session.receive() {
            debug!(bytes = line.len(), "discarded abandoned turn");
        }
    });
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        self.session.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::FunctionTool;

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .tool(FunctionTool::new("noop", "Does nothing", |_| async {
                Ok(String::new())
            }))
            .build()
            .unwrap()
    }

    #[test]
    fn composed_prompt_starts_with_the_preamble() {
        let config = SessionConfig {
            prompt: "Be brief.\n".into(),
            ..SessionConfig::default()
        };
        let composed = compose_config(&config, &registry());
        assert!(composed.prompt.starts_with("You are a function calling AI model."));
        assert!(composed.prompt.ends_with("Be brief.\n"));
        assert!(composed.prompt.contains(r#""name":"noop""#));
        assert!(composed.interactive_first);
    }

    #[test]
    fn call_delimiter_is_a_stop_sequence_only() {
        let config = SessionConfig {
            antiprompts: vec![CALL_CLOSE.into(), "User:".into()],
            ..SessionConfig::default()
        };
        let composed = compose_config(&config, &registry());
        assert_eq!(composed.antiprompts, vec!["User:".to_string()]);
        assert_eq!(composed.stop_sequences, vec![CALL_CLOSE.to_string()]);

        let again = compose_config(&composed, &registry());
        assert_eq!(again.stop_sequences.len(), 1);
    }

    #[test]
    fn preamble_is_anchored_unless_n_keep_was_chosen() {
        let composed = compose_config(&SessionConfig::default(), &registry());
        assert_eq!(composed.n_keep, -1);

        let config = SessionConfig {
            n_keep: 12,
            ..SessionConfig::default()
        };
        assert_eq!(compose_config(&config, &registry()).n_keep, 12);
    }
}
