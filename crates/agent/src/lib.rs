//! Tool calling on top of the Hearth session engine.
//!
//! A [`ToolSession`] turns a plain interactive session into an agentic one:
//!
//! 1. **Describe** the registered tools to the model in a system preamble
//! 2. **Run** a turn; it ends right after a `</tool_call>` delimiter
//! 3. **Dispatch** every call envelope in the turn, concurrently
//! 4. **Feed back** the `<tool_response>` envelopes in call order and loop
//!
//! The loop ends when a turn contains no calls, or after
//! `max_tool_iterations` rounds.

pub mod dispatch;
pub mod envelope;
pub mod stream_filter;
pub mod tool_session;

pub use dispatch::ToolDispatcher;
pub use envelope::{EnvelopeScanner, ParsedCall};
pub use stream_filter::{StreamingToolFilter, TurnEnd};
pub use tool_session::{ToolSession, compose_config};
