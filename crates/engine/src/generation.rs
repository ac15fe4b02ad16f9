//! The generation loop: a turn-taking decode/sample cycle.
//!
//! Each cycle decodes whatever tokens are pending, then either samples one
//! new token or moves up to one batch of queued input into the pending set.
//! Once the queued input is exhausted the loop checks for anti-prompts and
//! end-of-generation, and in interactive mode hands the turn back to the
//! caller over the [`LineTransport`].
//!
//! The context buffer, pending input queue and session cache are owned by
//! the loop and only touched on its thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use hearth_config::SessionConfig;
use hearth_core::{
    ContextError, DecodeStatus, Direction, Error, EventBus, InferenceBackend, LineTransport,
    Received, Result, SessionEvent, Token,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::antiprompt::{Antiprompts, RecentTokens};
use crate::feed::{ObservedOutput, OutputFeed};
use crate::prompt::{
    ChatHistory, ChatTemplate, DEFAULT_SYSTEM_MESSAGE, PromptTranscript, Role, process_escapes,
};
use crate::session_cache::SessionCache;
use crate::window::{ContextWindow, WindowAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingInput,
    ConsumingPrompt,
    Generating,
    CheckingStop,
    Stopped,
}

/// Everything the loop shares with the thread that owns the session.
#[derive(Clone, Default)]
pub struct LoopHandles {
    pub transport: Arc<LineTransport>,
    pub feed: OutputFeed,
    pub events: EventBus,
    pub stop: Arc<AtomicBool>,
    pub failure: Arc<Mutex<Option<Error>>>,
}

impl LoopHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }
}

pub struct GenerationLoop<B: InferenceBackend> {
    backend: B,
    config: SessionConfig,
    handles: LoopHandles,
    output: ObservedOutput,
    window: ContextWindow,
    cache: SessionCache,
    antiprompts: Antiprompts,
    chat: Option<ChatHistory>,
    transcript: Option<PromptTranscript>,
    interactive: bool,
    n_ctx: u32,
    state: LoopState,

    /// Tokens about to be decoded.
    embd: Vec<Token>,
    /// Queued input: prompt and user lines.
    embd_inp: Vec<Token>,
    n_consumed: usize,
    n_past: i32,
    n_remain: i64,
    recent: RecentTokens,

    is_interacting: bool,
    is_antiprompt: bool,
    need_insert_eot: bool,
    /// `embd` holds a token sampled this cycle
    sampled: bool,
    received_input: bool,
    turn_tokens: usize,
    assistant_text: String,
}

impl<B: InferenceBackend> GenerationLoop<B> {
    /// Prepare a session: restore the session cache, tokenize the prompt and
    /// pick the window strategy.
    pub fn new(config: &SessionConfig, mut backend: B, handles: LoopHandles) -> Result<Self> {
        let n_ctx = backend.n_ctx();
        let n_ctx_train = backend.n_ctx_train();
        if n_ctx > n_ctx_train {
            warn!(n_ctx, n_ctx_train, "model was trained on a shorter context than requested");
        }

        let interactive = config.is_interactive();
        let template = config
            .chat_template
            .as_deref()
            .map(|name| {
                ChatTemplate::from_name(name)
                    .ok_or_else(|| Error::config(format!("unknown chat template '{name}'")))
            })
            .transpose()?;
        let mut chat = if config.conversation {
            Some(ChatHistory::new(template.unwrap_or(ChatTemplate::ChatMl)))
        } else {
            None
        };

        let mut cache = match &config.path_session {
            Some(path) => {
                SessionCache::load(path, config.prompt_cache_ro, &mut backend, n_ctx as usize)?
            }
            None => SessionCache::disabled(),
        };

        let transcript = config.prompt_transcript.as_ref().map(PromptTranscript::new);
        let mut prompt = if config.escape {
            process_escapes(&config.prompt)
        } else {
            config.prompt.clone()
        };
        if let Some(transcript) = &transcript {
            prompt.push_str(&transcript.replay()?);
        }

        let prompt_from_cache = prompt.is_empty() && !cache.tokens().is_empty();
        let mut embd_inp = if prompt_from_cache {
            cache.tokens().to_vec()
        } else {
            let text = match chat.as_mut() {
                Some(history) => {
                    let system = if prompt.is_empty() {
                        DEFAULT_SYSTEM_MESSAGE.to_string()
                    } else {
                        prompt
                    };
                    history.add(Role::System, system, false)
                }
                None => prompt,
            };
            backend.tokenize(&text, true, true)?
        };
        if embd_inp.is_empty() {
            embd_inp.push(backend.token_bos());
        }

        let max_prompt = (n_ctx as usize).saturating_sub(4);
        if embd_inp.len() > max_prompt {
            return Err(ContextError::PromptTooLong {
                len: embd_inp.len(),
                max: max_prompt,
            }
            .into());
        }

        cache.reconcile(&embd_inp, prompt_from_cache, &mut backend);

        let n_keep = if config.n_keep < 0 || config.n_keep as usize > embd_inp.len() {
            embd_inp.len() as i32
        } else {
            config.n_keep + i32::from(backend.add_bos())
        };
        let window = ContextWindow::for_session(config, n_keep, n_ctx, n_ctx_train)?;
        let antiprompts = Antiprompts::new(
            config.antiprompts.clone(),
            config.stop_sequences.clone(),
            &backend,
        )?;

        info!(
            n_ctx,
            n_batch = config.n_batch,
            n_predict = config.n_predict,
            n_keep,
            prompt_tokens = embd_inp.len(),
            interactive,
            "generation loop initialized"
        );

        Ok(Self {
            output: ObservedOutput::new(handles.feed.clone()),
            backend,
            config: config.clone(),
            handles,
            window,
            cache,
            antiprompts,
            chat,
            transcript,
            interactive,
            n_ctx,
            state: LoopState::ConsumingPrompt,
            embd: Vec::new(),
            embd_inp,
            n_consumed: 0,
            n_past: 0,
            n_remain: i64::from(config.n_predict),
            recent: RecentTokens::default(),
            is_interacting: config.interactive_first || config.conversation,
            is_antiprompt: false,
            need_insert_eot: false,
            sampled: false,
            received_input: false,
            turn_tokens: 0,
            assistant_text: String::new(),
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn n_past(&self) -> i32 {
        self.n_past
    }

    /// Run until the session stops. A fatal error is stored in the shared
    /// failure slot before the transport is closed, so a caller woken by
    /// the close can always find it.
    pub fn run(mut self) {
        let result = self.drive();
        self.set_state(LoopState::Stopped);

        let reason = match result {
            Ok(()) => "finished".to_string(),
            Err(e) => {
                error!(error = %e, phase = %e.phase(), "generation loop failed");
                let reason = e.to_string();
                *self.handles.failure.lock() = Some(e);
                reason
            }
        };
        self.handles.events.publish(SessionEvent::SessionStopped {
            reason,
            timestamp: Utc::now(),
        });
        self.handles.transport.close();
        self.handles.feed.close();
    }

    fn drive(&mut self) -> Result<()> {
        while (self.n_remain != 0 && !self.is_antiprompt) || self.interactive {
            if self.stop_requested() {
                debug!("stop requested");
                return Ok(());
            }

            self.evaluate_pending()?;

            if self.embd_inp.len() <= self.n_consumed && !self.is_interacting {
                self.generate()?;
            } else {
                self.consume_input();
            }
            self.echo_sampled();

            if self.embd_inp.len() <= self.n_consumed {
                self.set_state(LoopState::CheckingStop);
                self.check_antiprompts();

                if self.interactive && self.recent.last().is_some_and(|t| self.backend.is_eog(t)) {
                    self.yield_on_end_of_generation()?;
                }

                if self.n_past > 0 && self.is_interacting {
                    self.set_state(LoopState::AwaitingInput);
                    if !self.await_input()? {
                        return Ok(());
                    }
                }

                if self.n_past > 0 {
                    if self.is_interacting {
                        self.backend.reset_sampler();
                    }
                    self.is_interacting = false;
                }
            }

            if !self.interactive && self.embd.last().is_some_and(|&t| self.backend.is_eog(t)) {
                info!("end of text");
                self.finish_turn()?;
                return Ok(());
            }

            // out of budget: hand the turn back instead of stopping
            if self.interactive && self.n_remain <= 0 && self.config.n_predict >= 0 {
                self.n_remain = i64::from(self.config.n_predict);
                self.is_interacting = true;
            }
        }

        self.finish_turn()?;
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        self.handles.stop.load(Ordering::Acquire)
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, n_past = self.n_past, "loop state");
            self.state = state;
        }
    }

    fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.backend.accept(token, apply_grammar);
        self.recent.push(token);
    }

    /// Decode `embd`, making room in the context first.
    fn evaluate_pending(&mut self) -> Result<()> {
        if self.embd.is_empty() {
            return Ok(());
        }

        let mut max_embd = (self.n_ctx as usize).saturating_sub(4);
        if let Some(n_keep) = self.window.n_keep() {
            // must still fit once everything after the anchored prefix is evicted
            let fits = (self.n_ctx as usize).saturating_sub(n_keep.max(0) as usize + 1);
            max_embd = max_embd.min(fits);
        }
        if self.embd.len() > max_embd {
            let skipped = self.embd.len() - max_embd;
            self.embd.truncate(max_embd);
            warn!(skipped, "input too long, skipped tokens");
            self.handles.events.publish(SessionEvent::InputTruncated {
                skipped,
                timestamp: Utc::now(),
            });
        }

        match self.window.make_room(
            &mut self.backend,
            &mut self.n_past,
            self.embd.len(),
            self.n_ctx,
        )? {
            WindowAction::Unchanged => {}
            WindowAction::Shifted { discarded } => {
                self.cache.disable();
                self.handles.events.publish(SessionEvent::ContextShifted {
                    discarded,
                    n_past: self.n_past,
                    timestamp: Utc::now(),
                });
            }
            WindowAction::Extended { .. } => {
                self.handles.events.publish(SessionEvent::SelfExtended {
                    ga_i: self.window.ga_i().unwrap_or_default(),
                    n_past: self.n_past,
                    timestamp: Utc::now(),
                });
            }
        }

        let reused = self.cache.reuse_prefix(&mut self.embd, &mut self.n_past);
        if reused > 0 {
            debug!(reused, "reused session cache tokens");
        }

        let n_batch = self.config.n_batch.max(1) as usize;
        for chunk in self.embd.chunks(n_batch) {
            match self.backend.decode(chunk, self.n_past)? {
                DecodeStatus::Ok => {}
                DecodeStatus::NoKvSlot => {
                    return Err(ContextError::NoKvSlot {
                        batch: chunk.len(),
                        n_past: self.n_past,
                    }
                    .into());
                }
            }
            self.n_past += chunk.len() as i32;
        }

        self.cache.extend(&self.embd);
        self.embd.clear();
        Ok(())
    }

    fn generate(&mut self) -> Result<()> {
        self.set_state(LoopState::Generating);

        if let Some(tokens) = self.cache.save_if_needed(&mut self.backend)? {
            let path = self
                .cache
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            self.handles.events.publish(SessionEvent::SessionCacheSaved {
                path,
                tokens,
                timestamp: Utc::now(),
            });
        }

        let id = self.backend.sample()?;
        self.accept(id, true);
        self.embd.push(id);
        self.sampled = true;
        self.n_remain -= 1;
        Ok(())
    }

    fn consume_input(&mut self) {
        self.set_state(LoopState::ConsumingPrompt);
        let n_batch = self.config.n_batch.max(1) as usize;
        while self.embd_inp.len() > self.n_consumed {
            let token = self.embd_inp[self.n_consumed];
            self.embd.push(token);
            self.accept(token, false);
            self.n_consumed += 1;
            if self.embd.len() >= n_batch {
                break;
            }
        }
    }

    fn echo_sampled(&mut self) {
        if !std::mem::take(&mut self.sampled) {
            return;
        }
        for &id in &self.embd {
            let piece = self.backend.token_to_piece(id, self.config.special);
            self.output.push(&piece);
            if self.chat.is_some() {
                self.assistant_text
                    .push_str(&self.backend.token_to_piece(id, false));
            }
            self.turn_tokens += 1;
        }
    }

    fn check_antiprompts(&mut self) {
        if self.antiprompts.is_empty() {
            return;
        }
        let text = self.recent.text(&self.backend);
        let last = self.recent.last();
        self.is_antiprompt = self.antiprompts.matches(&text, last, self.interactive);
        if self.is_antiprompt && self.interactive {
            debug!("anti-prompt found, yielding");
            self.is_interacting = true;
            if self.chat.is_some() {
                self.need_insert_eot = !last.is_some_and(|t| self.backend.is_eog(t));
            }
        }
    }

    fn yield_on_end_of_generation(&mut self) -> Result<()> {
        if self.chat.is_none() {
            if let Some(first) = self.antiprompts.first() {
                let tokens = self.backend.tokenize(first, false, true)?;
                self.embd_inp.extend(tokens);
                self.is_antiprompt = true;
            }
        }
        self.is_interacting = true;
        Ok(())
    }

    /// Send the finished turn to the caller. Returns `false` once the
    /// transport is closed.
    fn finish_turn(&mut self) -> Result<bool> {
        let text = self.output.value().to_string();
        match self.handles.transport.send(Direction::Output, text.as_str()) {
            Ok(()) => {}
            Err(Error::SessionClosed) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.output.reset();

        debug!(tokens = self.turn_tokens, n_past = self.n_past, "turn completed");
        self.handles.events.publish(SessionEvent::TurnCompleted {
            tokens_generated: self.turn_tokens,
            timestamp: Utc::now(),
        });

        if let Some(history) = self.chat.as_mut() {
            history.add(Role::Assistant, std::mem::take(&mut self.assistant_text), false);
        }
        if let Some(transcript) = &self.transcript {
            if !text.is_empty() {
                transcript.append(&text)?;
            }
        }
        self.turn_tokens = 0;
        Ok(true)
    }

    /// Hand the turn to the caller and queue its reply. Returns `false` when
    /// the session should stop.
    fn await_input(&mut self) -> Result<bool> {
        if (self.received_input || self.turn_tokens > 0) && !self.finish_turn()? {
            return Ok(false);
        }

        if self.config.input_prefix_bos {
            self.embd_inp.push(self.backend.token_bos());
        }

        let line = match self.handles.transport.receive(Direction::Input) {
            Received::Line(line) => line,
            Received::Closed => {
                debug!("transport closed while awaiting input");
                return Ok(false);
            }
        };
        if self.stop_requested() {
            return Ok(false);
        }
        self.received_input = true;

        if line.is_empty() {
            debug!("empty line, passing control back");
            return Ok(true);
        }
        if let Some(transcript) = &self.transcript {
            transcript.append(&line)?;
        }

        let mut buffer = if self.config.escape {
            process_escapes(&line)
        } else {
            line
        };
        let (user_input, parse_special) = match self.chat.as_mut() {
            Some(history) => (history.add(Role::User, buffer, true), true),
            None => {
                buffer.push('\n');
                (buffer, false)
            }
        };

        let line_pfx = self
            .backend
            .tokenize(&self.config.input_prefix, false, true)?;
        let line_inp = self.backend.tokenize(&user_input, false, parse_special)?;
        let line_sfx = self
            .backend
            .tokenize(&self.config.input_suffix, false, true)?;

        // close the interrupted assistant turn
        if self.need_insert_eot && self.chat.is_some() {
            self.embd_inp.push(self.backend.token_eot());
            self.need_insert_eot = false;
        }

        self.embd_inp.extend(line_pfx);
        self.embd_inp.extend_from_slice(&line_inp);
        self.embd_inp.extend(line_sfx);
        self.n_remain -= line_inp.len() as i64;

        debug!(
            input_tokens = line_inp.len(),
            queued = self.embd_inp.len() - self.n_consumed,
            "queued user input"
        );
        Ok(true)
    }
}
