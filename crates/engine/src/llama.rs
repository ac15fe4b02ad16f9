//! [`InferenceBackend`] over llama.cpp, via `llama-cpp-2`.
//!
//! The model is loaded once per process and lives for the rest of it; a
//! context borrows it, so the model reference is `'static`.

use std::num::{NonZeroU8, NonZeroU32};
use std::path::Path;
use std::sync::OnceLock;

use hearth_config::{SamplingConfig, SessionConfig};
use hearth_core::{BackendError, DecodeStatus, InferenceBackend, Token};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{DecodeError, LlamaCppError};
use tracing::{debug, info};

static LLAMA: OnceLock<LlamaBackend> = OnceLock::new();

fn llama_backend() -> Result<&'static LlamaBackend, BackendError> {
    if let Some(backend) = LLAMA.get() {
        return Ok(backend);
    }
    match LlamaBackend::init() {
        Ok(backend) => Ok(LLAMA.get_or_init(|| backend)),
        Err(LlamaCppError::BackendAlreadyInitialized) => LLAMA
            .get()
            .ok_or_else(|| BackendError::Unavailable("llama backend initialized elsewhere".into())),
        Err(e) => Err(BackendError::Unavailable(e.to_string())),
    }
}

/// Load a GGUF model for the rest of the process.
pub fn load_model(path: &Path) -> Result<&'static LlamaModel, BackendError> {
    let backend = llama_backend()?;
    info!(path = %path.display(), "loading model");
    let model = LlamaModel::load_from_file(backend, path, &LlamaModelParams::default())
        .map_err(|e| BackendError::ModelLoad(format!("{}: {e}", path.display())))?;
    Ok(Box::leak(Box::new(model)))
}

pub struct LlamaCppBackend {
    model: &'static LlamaModel,
    ctx: LlamaContext<'static>,
    sampler: LlamaSampler,
    sampling: SamplingConfig,
    batch: LlamaBatch,
    add_bos: bool,
}

impl LlamaCppBackend {
    /// Create a context sized by `session` (`n_ctx == 0` uses the trained
    /// context length).
    pub fn new(
        model: &'static LlamaModel,
        session: &SessionConfig,
        sampling: &SamplingConfig,
    ) -> Result<Self, BackendError> {
        let backend = llama_backend()?;
        let n_ctx = match session.n_ctx {
            0 => model.n_ctx_train(),
            n => n,
        };
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(session.n_batch);
        let ctx = model
            .new_context(backend, params)
            .map_err(|e| BackendError::ContextInit(e.to_string()))?;

        let add_bos = model
            .str_to_token("", AddBos::Always)
            .map(|tokens| !tokens.is_empty())
            .unwrap_or(true);

        debug!(n_ctx, n_batch = session.n_batch, add_bos, "llama context created");
        Ok(Self {
            sampler: build_sampler(model, sampling)?,
            model,
            ctx,
            sampling: sampling.clone(),
            batch: LlamaBatch::new(session.n_batch.max(1) as usize, 1),
            add_bos,
        })
    }

    /// Load the model at `path` and build a backend around it.
    pub fn load(
        path: &Path,
        session: &SessionConfig,
        sampling: &SamplingConfig,
    ) -> Result<Self, BackendError> {
        Self::new(load_model(path)?, session, sampling)
    }
}

fn build_sampler(model: &LlamaModel, cfg: &SamplingConfig) -> Result<LlamaSampler, BackendError> {
    let mut chain = Vec::new();
    if let Some(grammar) = &cfg.grammar {
        chain.push(
            LlamaSampler::grammar(model, grammar, "root")
                .map_err(|e| BackendError::Sample(format!("invalid grammar: {e}")))?,
        );
    }
    chain.push(LlamaSampler::penalties(
        cfg.repeat_last_n,
        cfg.repeat_penalty,
        0.0,
        0.0,
    ));
    if cfg.temperature <= 0.0 {
        chain.push(LlamaSampler::greedy());
    } else {
        chain.push(LlamaSampler::top_k(cfg.top_k));
        chain.push(LlamaSampler::top_p(cfg.top_p, 1));
        chain.push(LlamaSampler::min_p(cfg.min_p, 1));
        chain.push(LlamaSampler::temp(cfg.temperature));
        chain.push(LlamaSampler::dist(cfg.seed));
    }
    Ok(LlamaSampler::chain_simple(chain))
}

fn position(p: i32) -> Option<u32> {
    u32::try_from(p).ok()
}

impl InferenceBackend for LlamaCppBackend {
    fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn n_ctx_train(&self) -> u32 {
        self.model.n_ctx_train()
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn token_bos(&self) -> Token {
        self.model.token_bos().0
    }

    fn token_eot(&self) -> Token {
        self.model.token_eos().0
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    // llama-cpp-2 always parses control tokens, so `parse_special` is advisory
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        let add_bos = if add_special && self.add_bos {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BackendError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_piece(&self, token: Token, special: bool) -> String {
        let special = if special {
            Special::Tokenize
        } else {
            Special::Plaintext
        };
        self.model
            .token_to_bytes(LlamaToken(token), special)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    fn decode(&mut self, tokens: &[Token], start_pos: i32) -> Result<DecodeStatus, BackendError> {
        self.batch.clear();
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            self.batch
                .add(LlamaToken(token), start_pos + i as i32, &[0], i == last)
                .map_err(|e| BackendError::Decode {
                    code: -1,
                    reason: e.to_string(),
                })?;
        }
        match self.ctx.decode(&mut self.batch) {
            Ok(()) => Ok(DecodeStatus::Ok),
            Err(DecodeError::NoKvCacheSlot) => Ok(DecodeStatus::NoKvSlot),
            Err(DecodeError::Unknown(code)) => Err(BackendError::Decode {
                code,
                reason: "llama_decode failed".into(),
            }),
            Err(e) => Err(BackendError::Decode {
                code: -1,
                reason: e.to_string(),
            }),
        }
    }

    fn sample(&mut self) -> Result<Token, BackendError> {
        Ok(self.sampler.sample(&self.ctx, -1).0)
    }

    // sampling already fed the token through the chain
    fn accept(&mut self, token: Token, apply_grammar: bool) {
        if !apply_grammar {
            self.sampler.accept(LlamaToken(token));
        }
    }

    fn reset_sampler(&mut self) {
        match build_sampler(self.model, &self.sampling) {
            Ok(sampler) => self.sampler = sampler,
            Err(e) => debug!(error = %e, "sampler rebuild failed, keeping the current one"),
        }
    }

    fn kv_remove(&mut self, p0: i32, p1: Option<i32>) -> bool {
        self.ctx
            .clear_kv_cache_seq(Some(0), position(p0), p1.and_then(position))
            .unwrap_or(false)
    }

    fn kv_shift(&mut self, p0: i32, p1: Option<i32>, delta: i32) {
        if let Err(e) = self
            .ctx
            .kv_cache_seq_add(0, position(p0), p1.and_then(position), delta)
        {
            debug!(error = %e, p0, delta, "kv shift rejected");
        }
    }

    fn kv_divide(&mut self, p0: i32, p1: Option<i32>, divisor: i32) {
        let Some(divisor) = u8::try_from(divisor).ok().and_then(NonZeroU8::new) else {
            debug!(divisor, "kv divide skipped, divisor out of range");
            return;
        };
        if let Err(e) = self
            .ctx
            .kv_cache_seq_div(0, position(p0), p1.and_then(position), divisor)
        {
            debug!(error = %e, p0, "kv divide rejected");
        }
    }

    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> Result<(), BackendError> {
        let tokens: Vec<LlamaToken> = tokens.iter().map(|&t| LlamaToken(t)).collect();
        self.ctx
            .save_session_file(path, &tokens)
            .map_err(|e| BackendError::SessionFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn load_state(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError> {
        let tokens = self
            .ctx
            .load_session_file(path, capacity)
            .map_err(|e| BackendError::SessionFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }
}
