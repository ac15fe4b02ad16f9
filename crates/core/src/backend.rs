//! Inference backend trait: the seam between the session engine and the
//! tensor compute engine.
//!
//! A backend owns one loaded model and one evaluation context. The session
//! engine drives it token by token and edits the positions stored in its
//! attention (KV) cache when the context window overflows. Everything behind
//! this trait (model files, tensor math, sampler chains, grammars) is opaque
//! to the engine.

use std::path::Path;

use crate::error::BackendError;

/// A vocabulary token id.
pub type Token = i32;

/// Outcome of a successful `decode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The batch was evaluated and logits for its last token are available.
    Ok,
    /// The cache had no slot large enough for the batch. Nothing was evaluated.
    NoKvSlot,
}

/// The tensor compute engine, as the generation loop consumes it.
///
/// Positions are `i32` throughout, matching the attention cache. A `None`
/// upper bound in the cache-editing primitives means "to the end".
pub trait InferenceBackend {
    /// Size of the evaluation context in tokens.
    fn n_ctx(&self) -> u32;

    /// Context length the model was trained with.
    fn n_ctx_train(&self) -> u32;

    /// Whether the model expects a BOS token at the start of a sequence.
    fn add_bos(&self) -> bool;

    fn token_bos(&self) -> Token;

    /// End-of-turn token, used to close an interrupted assistant turn.
    fn token_eot(&self) -> Token;

    /// Whether `token` ends generation (EOS, EOT, and similar).
    fn is_eog(&self, token: Token) -> bool;

    /// Tokenize `text`. `add_special` prepends BOS when the model wants it;
    /// `parse_special` recognizes control-token text such as `<|im_end|>`.
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError>;

    /// Text for a single token. `special` renders control tokens verbatim.
    fn token_to_piece(&self, token: Token, special: bool) -> String;

    /// Evaluate `tokens` at consecutive positions starting at `start_pos`.
    fn decode(&mut self, tokens: &[Token], start_pos: i32) -> Result<DecodeStatus, BackendError>;

    /// Sample the next token from the logits of the last decoded position.
    fn sample(&mut self) -> Result<Token, BackendError>;

    /// Feed a token into the sampling state (repetition penalties, grammar).
    fn accept(&mut self, token: Token, apply_grammar: bool);

    /// Clear sampling history, e.g. when a new user turn starts.
    fn reset_sampler(&mut self);

    /// Remove cache cells in `[p0, p1)`.
    fn kv_remove(&mut self, p0: i32, p1: Option<i32>) -> bool;

    /// Add `delta` to the position of every cache cell in `[p0, p1)`.
    fn kv_shift(&mut self, p0: i32, p1: Option<i32>, delta: i32);

    /// Integer-divide the position of every cache cell in `[p0, p1)` by `divisor`.
    fn kv_divide(&mut self, p0: i32, p1: Option<i32>, divisor: i32);

    /// Persist the attention cache and the tokens it was computed from.
    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> Result<(), BackendError>;

    /// Restore a state written by [`save_state`](Self::save_state), returning
    /// its tokens. At most `capacity` tokens are accepted.
    fn load_state(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError>;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn n_ctx(&self) -> u32 {
        (**self).n_ctx()
    }
    fn n_ctx_train(&self) -> u32 {
        (**self).n_ctx_train()
    }
    fn add_bos(&self) -> bool {
        (**self).add_bos()
    }
    fn token_bos(&self) -> Token {
        (**self).token_bos()
    }
    fn token_eot(&self) -> Token {
        (**self).token_eot()
    }
    fn is_eog(&self, token: Token) -> bool {
        (**self).is_eog(token)
    }
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        (**self).tokenize(text, add_special, parse_special)
    }
    fn token_to_piece(&self, token: Token, special: bool) -> String {
        (**self).token_to_piece(token, special)
    }
    fn decode(&mut self, tokens: &[Token], start_pos: i32) -> Result<DecodeStatus, BackendError> {
        (**self).decode(tokens, start_pos)
    }
    fn sample(&mut self) -> Result<Token, BackendError> {
        (**self).sample()
    }
    fn accept(&mut self, token: Token, apply_grammar: bool) {
        (**self).accept(token, apply_grammar)
    }
    fn reset_sampler(&mut self) {
        (**self).reset_sampler()
    }
    fn kv_remove(&mut self, p0: i32, p1: Option<i32>) -> bool {
        (**self).kv_remove(p0, p1)
    }
    fn kv_shift(&mut self, p0: i32, p1: Option<i32>, delta: i32) {
        (**self).kv_shift(p0, p1, delta)
    }
    fn kv_divide(&mut self, p0: i32, p1: Option<i32>, divisor: i32) {
        (**self).kv_divide(p0, p1, divisor)
    }
    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> Result<(), BackendError> {
        (**self).save_state(path, tokens)
    }
    fn load_state(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError> {
        (**self).load_state(path, capacity)
    }
}
