//! # Hearth Engine
//!
//! The inference session engine: a turn-taking generation loop over an
//! [`InferenceBackend`](hearth_core::InferenceBackend), with bounded-context
//! management, session caching and a line transport to the caller.
//!
//! ```text
//! caller ──send──▶ LineTransport ──▶ GenerationLoop ──▶ backend
//!        ◀─receive─             ◀──                 ◀──
//!                    OutputFeed (live partial output)
//! ```

pub mod antiprompt;
pub mod feed;
pub mod generation;
pub mod prompt;
pub mod session;
pub mod session_cache;
pub mod session_file;
pub mod window;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(feature = "llama")]
pub mod llama;

pub use feed::{ObservedOutput, OutputChange, OutputFeed, OutputSubscription};
pub use generation::{GenerationLoop, LoopHandles, LoopState};
pub use prompt::{ChatHistory, ChatMessage, ChatTemplate, Role};
pub use session::Session;
pub use window::{ContextWindow, WindowAction};
