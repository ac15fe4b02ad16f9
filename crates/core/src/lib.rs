//! # Hearth Core
//!
//! Domain types, traits, and error definitions for the Hearth inference
//! session engine. This crate has **no engine dependencies**: it defines the
//! vocabulary every other crate implements against.
//!
//! ## Design Philosophy
//!
//! The tensor compute engine is a collaborator behind [`InferenceBackend`];
//! callables the model may invoke sit behind [`Tool`]. The generation loop and
//! its caller only ever meet at the [`LineTransport`]. This enables:
//! - Running the whole session engine against a scripted backend in tests
//! - Swapping llama.cpp for another engine without touching the loop
//! - Clean dependency graph (all crates depend inward on core)

pub mod backend;
pub mod error;
pub mod event;
pub mod tool;
pub mod transport;

// Re-export key types at crate root for ergonomics
pub use backend::{DecodeStatus, InferenceBackend, Token};
pub use error::{BackendError, ContextError, DispatchError, Error, Phase, Result, ToolError};
pub use event::{EventBus, SessionEvent};
pub use tool::{
    FunctionTool, ParamType, Tool, ToolArguments, ToolCall, ToolParameter, ToolRegistry,
    ToolRegistryBuilder, ToolSchema,
};
pub use transport::{Direction, LineTransport, Received, TranscriptEntry};
