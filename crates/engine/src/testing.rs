//! A deterministic backend for exercising the session engine without a model.
//!
//! - Tokenizer: one token per `char` (id `CHAR_BASE + codepoint`), plus a
//!   handful of control tokens recognized when special parsing is on.
//! - Sampler: replays scripted replies. Each reply is followed by EOS;
//!   resetting the sampler moves on to the next reply.
//! - KV cache: a list of `(token, position)` cells edited by the window
//!   primitives exactly like a real cache would be.
//! - State files: written with [`session_file`](crate::session_file).
//!
//! The backend usually moves onto the session thread, so everything a test
//! wants to look at afterwards lives in a shared [`BackendProbe`].

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use hearth_core::{BackendError, DecodeStatus, InferenceBackend, Token};
use parking_lot::Mutex;

use crate::session_file;

pub const BOS: Token = 1;
pub const EOS: Token = 2;
pub const EOT: Token = 3;
pub const CHAR_BASE: Token = 256;

const SPECIALS: &[(Token, &str)] = &[
    (BOS, "<s>"),
    (EOS, "</s>"),
    (EOT, "<|im_end|>"),
    (4, "<|im_start|>"),
    (5, "<|eot_id|>"),
    (6, "<|start_header_id|>"),
    (7, "<|end_header_id|>"),
];

/// Tokenize without a backend instance.
pub fn tokenize(text: &str, parse_special: bool) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(text.len());
    let mut rest = text;
    'outer: while let Some(c) = rest.chars().next() {
        if parse_special {
            for (id, marker) in SPECIALS {
                if let Some(tail) = rest.strip_prefix(marker) {
                    tokens.push(*id);
                    rest = tail;
                    continue 'outer;
                }
            }
        }
        tokens.push(CHAR_BASE + c as Token);
        rest = &rest[c.len_utf8()..];
    }
    tokens
}

/// Render tokens, control tokens included.
pub fn detokenize(tokens: &[Token]) -> String {
    tokens.iter().map(|&t| piece(t, true)).collect()
}

fn piece(token: Token, special: bool) -> String {
    if token >= CHAR_BASE {
        return char::from_u32((token - CHAR_BASE) as u32)
            .map(String::from)
            .unwrap_or_default();
    }
    match SPECIALS.iter().find(|(id, _)| *id == token) {
        Some((_, marker)) if special => marker.to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    decode_calls: usize,
    decoded: Vec<(Token, i32)>,
    accepted: Vec<(Token, bool)>,
    samples: usize,
    resets: usize,
    saves: usize,
    cells: Vec<(Token, i32)>,
}

/// Shared view into a [`ScriptedBackend`].
#[derive(Debug, Clone, Default)]
pub struct BackendProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl BackendProbe {
    pub fn decode_calls(&self) -> usize {
        self.state.lock().decode_calls
    }

    /// Every token decoded so far, with the position it was decoded at.
    pub fn decoded(&self) -> Vec<(Token, i32)> {
        self.state.lock().decoded.clone()
    }

    pub fn decoded_count(&self) -> usize {
        self.state.lock().decoded.len()
    }

    /// Tokens fed to the sampling state, with the grammar flag.
    pub fn accepted(&self) -> Vec<(Token, bool)> {
        self.state.lock().accepted.clone()
    }

    pub fn samples(&self) -> usize {
        self.state.lock().samples
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn saves(&self) -> usize {
        self.state.lock().saves
    }

    /// Cache cells ordered by position.
    pub fn kv_cells(&self) -> Vec<(Token, i32)> {
        let mut cells = self.state.lock().cells.clone();
        cells.sort_by_key(|&(_, pos)| pos);
        cells
    }
}

pub struct ScriptedBackend {
    n_ctx: u32,
    n_ctx_train: u32,
    add_bos: bool,
    replies: VecDeque<String>,
    current: VecDeque<Token>,
    turn_loaded: bool,
    fail_decode_at: Option<usize>,
    probe: BackendProbe,
}

impl ScriptedBackend {
    pub fn new(n_ctx: u32) -> Self {
        Self {
            n_ctx,
            n_ctx_train: n_ctx,
            add_bos: true,
            replies: VecDeque::new(),
            current: VecDeque::new(),
            turn_loaded: false,
            fail_decode_at: None,
            probe: BackendProbe::default(),
        }
    }

    pub fn with_replies<I, S>(mut self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replies.extend(replies.into_iter().map(Into::into));
        self
    }

    pub fn with_n_ctx_train(mut self, n_ctx_train: u32) -> Self {
        self.n_ctx_train = n_ctx_train;
        self
    }

    pub fn without_bos(mut self) -> Self {
        self.add_bos = false;
        self
    }

    /// Make the `call`-th decode (0-based) fail.
    pub fn failing_decode_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }

    pub fn probe(&self) -> BackendProbe {
        self.probe.clone()
    }

    fn in_range(pos: i32, p0: i32, p1: Option<i32>) -> bool {
        pos >= p0.max(0) && p1.is_none_or(|end| pos < end)
    }
}

impl InferenceBackend for ScriptedBackend {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_ctx_train(&self) -> u32 {
        self.n_ctx_train
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn token_bos(&self) -> Token {
        BOS
    }

    fn token_eot(&self) -> Token {
        EOT
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOS || token == EOT || token == 5
    }

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        let mut tokens = Vec::new();
        if add_special && self.add_bos {
            tokens.push(BOS);
        }
        tokens.extend(tokenize(text, parse_special));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, special: bool) -> String {
        piece(token, special)
    }

    fn decode(&mut self, tokens: &[Token], start_pos: i32) -> Result<DecodeStatus, BackendError> {
        let mut state = self.probe.state.lock();
        let call = state.decode_calls;
        state.decode_calls += 1;
        if self.fail_decode_at == Some(call) {
            return Err(BackendError::Decode {
                code: -1,
                reason: "injected failure".into(),
            });
        }
        if state.cells.len() + tokens.len() > self.n_ctx as usize {
            return Ok(DecodeStatus::NoKvSlot);
        }
        for (i, &token) in tokens.iter().enumerate() {
            let pos = start_pos + i as i32;
            state.cells.push((token, pos));
            state.decoded.push((token, pos));
        }
        Ok(DecodeStatus::Ok)
    }

    fn sample(&mut self) -> Result<Token, BackendError> {
        if !self.turn_loaded {
            self.turn_loaded = true;
            if let Some(reply) = self.replies.pop_front() {
                self.current = tokenize(&reply, true).into();
                self.current.push_back(EOS);
            }
        }
        self.probe.state.lock().samples += 1;
        Ok(self.current.pop_front().unwrap_or(EOS))
    }

    fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.probe.state.lock().accepted.push((token, apply_grammar));
    }

    fn reset_sampler(&mut self) {
        self.turn_loaded = false;
        self.current.clear();
        self.probe.state.lock().resets += 1;
    }

    fn kv_remove(&mut self, p0: i32, p1: Option<i32>) -> bool {
        self.probe
            .state
            .lock()
            .cells
            .retain(|&(_, pos)| !Self::in_range(pos, p0, p1));
        true
    }

    fn kv_shift(&mut self, p0: i32, p1: Option<i32>, delta: i32) {
        for cell in self.probe.state.lock().cells.iter_mut() {
            if Self::in_range(cell.1, p0, p1) {
                cell.1 += delta;
            }
        }
    }

    fn kv_divide(&mut self, p0: i32, p1: Option<i32>, divisor: i32) {
        for cell in self.probe.state.lock().cells.iter_mut() {
            if Self::in_range(cell.1, p0, p1) {
                cell.1 /= divisor;
            }
        }
    }

    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> Result<(), BackendError> {
        session_file::write(path, tokens)?;
        self.probe.state.lock().saves += 1;
        Ok(())
    }

    fn load_state(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError> {
        let tokens = session_file::read(path, capacity)?;
        let mut state = self.probe.state.lock();
        state.cells = tokens
            .iter()
            .enumerate()
            .map(|(pos, &token)| (token, pos as i32))
            .collect();
        Ok(tokens)
    }
}
