//! Session cache: reuse of a previously computed prompt prefix.
//!
//! The cache holds the tokens whose attention state was restored from disk.
//! While pending tokens keep matching it, they are skipped instead of
//! decoded. The first mismatch truncates the cache at that point. The cache
//! is written back once, right before the first token is sampled, and only
//! when the prompt went beyond what was cached.

use std::path::{Path, PathBuf};

use hearth_core::{BackendError, InferenceBackend, Token};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct SessionCache {
    path: Option<PathBuf>,
    tokens: Vec<Token>,
    consumed: usize,
    need_save: bool,
    read_only: bool,
}

impl SessionCache {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Restore the state stored at `path` into `backend`.
    ///
    /// A missing or empty file starts a fresh cache; an unreadable or
    /// corrupt one is an error.
    pub fn load<B: InferenceBackend + ?Sized>(
        path: &Path,
        read_only: bool,
        backend: &mut B,
        capacity: usize,
    ) -> Result<Self, BackendError> {
        let mut cache = Self {
            path: Some(path.to_path_buf()),
            read_only,
            ..Self::default()
        };

        match std::fs::metadata(path) {
            Err(_) => {
                info!(path = %path.display(), "session file does not exist, will create");
            }
            Ok(meta) if meta.len() == 0 => {
                info!(path = %path.display(), "session file is empty, a new session will be initialized");
            }
            Ok(_) => {
                cache.tokens = backend.load_state(path, capacity)?;
                info!(
                    path = %path.display(),
                    tokens = cache.tokens.len(),
                    "loaded a session"
                );
            }
        }
        Ok(cache)
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Line the restored state up with the prompt about to be evaluated.
    ///
    /// Drops cached positions past the matching prefix from the backend and
    /// decides whether the cache needs writing back. Returns the number of
    /// matching tokens.
    pub fn reconcile<B: InferenceBackend + ?Sized>(
        &mut self,
        prompt: &[Token],
        prompt_from_cache: bool,
        backend: &mut B,
    ) -> usize {
        let mut n_matching = 0;
        if !self.tokens.is_empty() {
            n_matching = self
                .tokens
                .iter()
                .zip(prompt)
                .take_while(|(a, b)| a == b)
                .count();

            if prompt_from_cache && n_matching == prompt.len() {
                info!("using full prompt from session file");
            } else if n_matching >= prompt.len() {
                info!("session file has exact match for prompt");
            } else if n_matching < prompt.len() / 2 {
                warn!(
                    n_matching,
                    prompt = prompt.len(),
                    "session file has low similarity to prompt, will mostly be reevaluated"
                );
            } else {
                info!(n_matching, prompt = prompt.len(), "session file matches prompt");
            }

            backend.kv_remove(n_matching as i32, None);
        }

        // re-evaluate the last prompt token so its logits are fresh
        if !prompt.is_empty() && n_matching == prompt.len() && self.tokens.len() > prompt.len() {
            self.tokens.truncate(prompt.len() - 1);
        }

        self.need_save = self.path.is_some() && n_matching < prompt.len();
        n_matching
    }

    /// Remove the leading tokens of `batch` that the cache already holds,
    /// advancing `n_past` past each one. Truncates the cache at the first
    /// mismatch.
    pub fn reuse_prefix(&mut self, batch: &mut Vec<Token>, n_past: &mut i32) -> usize {
        if self.consumed >= self.tokens.len() {
            return 0;
        }
        let mut skipped = 0;
        while skipped < batch.len() {
            if batch[skipped] != self.tokens[self.consumed] {
                self.tokens.truncate(self.consumed);
                break;
            }
            *n_past += 1;
            self.consumed += 1;
            skipped += 1;
            if self.consumed >= self.tokens.len() {
                break;
            }
        }
        batch.drain(..skipped);
        skipped
    }

    /// Record freshly decoded tokens.
    pub fn extend(&mut self, decoded: &[Token]) {
        if self.path.is_none() || decoded.is_empty() {
            return;
        }
        self.tokens.extend_from_slice(decoded);
        self.consumed = self.tokens.len();
    }

    /// Write the cache back if this run computed a new prefix. One-shot.
    ///
    /// Returns the number of tokens written.
    pub fn save_if_needed<B: InferenceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<Option<usize>, BackendError> {
        if !self.need_save || self.read_only {
            return Ok(None);
        }
        let Some(path) = self.path.as_deref() else {
            return Ok(None);
        };
        self.need_save = false;
        backend.save_state(path, &self.tokens)?;
        info!(path = %path.display(), tokens = self.tokens.len(), "saved session cache");
        Ok(Some(self.tokens.len()))
    }

    /// Stop using the cache for the rest of the run. Cached positions are
    /// stale after a shift, so nothing more is reused either.
    pub fn disable(&mut self) {
        if self.path.take().is_some() {
            info!("session cache disabled after context shift");
        }
        self.tokens.clear();
        self.consumed = 0;
        self.need_save = false;
    }
}
