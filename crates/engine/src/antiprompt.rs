//! Anti-prompt detection over the most recent tokens.

use std::collections::VecDeque;

use hearth_core::{BackendError, InferenceBackend, Token};

/// How many accepted tokens are kept for string matching.
pub const RECENT_WINDOW: usize = 32;

/// Configured anti-prompts, pre-tokenized where they are a single token.
///
/// Stop sequences match like anti-prompts but come after them, so
/// [`first`](Self::first) never returns one.
#[derive(Debug, Clone, Default)]
pub struct Antiprompts {
    strings: Vec<String>,
    injectable: usize,
    single_tokens: Vec<Token>,
}

impl Antiprompts {
    pub fn new<B: InferenceBackend + ?Sized>(
        antiprompts: Vec<String>,
        stop_sequences: Vec<String>,
        backend: &B,
    ) -> Result<Self, BackendError> {
        let injectable = antiprompts.len();
        let mut strings = antiprompts;
        strings.extend(stop_sequences);
        let mut single_tokens = Vec::new();
        for antiprompt in &strings {
            let ids = backend.tokenize(antiprompt, false, true)?;
            if let [id] = ids.as_slice() {
                single_tokens.push(*id);
            }
        }
        Ok(Self {
            strings,
            injectable,
            single_tokens,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// The first user anti-prompt, re-inserted on end-of-generation.
    pub fn first(&self) -> Option<&str> {
        self.strings[..self.injectable].first().map(|s| s.as_str())
    }

    /// Whether the tail of `recent_text`, or `last_token`, matches.
    ///
    /// In interactive mode the anti-prompt must sit at the very end of the
    /// text; otherwise two trailing bytes are tolerated.
    pub fn matches(&self, recent_text: &str, last_token: Option<Token>, interactive: bool) -> bool {
        let padding = if interactive { 0 } else { 2 };
        for antiprompt in &self.strings {
            let mut start = recent_text
                .len()
                .saturating_sub(antiprompt.len() + padding);
            while !recent_text.is_char_boundary(start) {
                start -= 1;
            }
            if recent_text[start..].contains(antiprompt.as_str()) {
                return true;
            }
        }
        last_token.is_some_and(|last| self.single_tokens.contains(&last))
    }
}

/// The last [`RECENT_WINDOW`] tokens fed to the sampler.
#[derive(Debug, Clone, Default)]
pub struct RecentTokens {
    tokens: VecDeque<Token>,
}

impl RecentTokens {
    pub fn push(&mut self, token: Token) {
        if self.tokens.len() == RECENT_WINDOW {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token);
    }

    pub fn last(&self) -> Option<Token> {
        self.tokens.back().copied()
    }

    pub fn text<B: InferenceBackend + ?Sized>(&self, backend: &B) -> String {
        self.tokens
            .iter()
            .map(|&t| backend.token_to_piece(t, true))
            .collect()
    }
}
