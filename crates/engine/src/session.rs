//! A running inference session: the generation loop on its own thread plus
//! the caller-side handles to talk to it.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread::JoinHandle;

use hearth_config::SessionConfig;
use hearth_core::{
    Direction, Error, EventBus, InferenceBackend, LineTransport, Received, Result, SessionEvent,
};
use tokio::sync::broadcast;
use tracing::{Instrument as _, debug, info_span, warn};
use uuid::Uuid;

use crate::feed::{OutputFeed, OutputSubscription};
use crate::generation::{GenerationLoop, LoopHandles};

pub struct Session {
    id: Uuid,
    handles: LoopHandles,
    thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Start a session around an already-loaded backend.
    pub fn start<B>(config: SessionConfig, backend: B) -> Result<Self>
    where
        B: InferenceBackend + Send + 'static,
    {
        Self::start_with(config, move || Ok(backend))
    }

    /// Start a session whose backend is built on the session thread.
    ///
    /// Construction errors (model load, prompt too long, bad window
    /// geometry) are returned here; nothing is left running.
    pub fn start_with<B, F>(config: SessionConfig, factory: F) -> Result<Self>
    where
        B: InferenceBackend + 'static,
        F: FnOnce() -> Result<B> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let handles = LoopHandles::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let loop_handles = handles.clone();
        let thread = std::thread::Builder::new()
            .name(format!("hearth-session-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let span = info_span!("session", %id);
                let _guard = span.enter();

                let generation = factory()
                    .and_then(|backend| GenerationLoop::new(&config, backend, loop_handles));
                match generation {
                    Ok(generation) => {
                        let _ = ready_tx.send(Ok(()));
                        generation.run();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!(%id, "session started");
                Ok(Self {
                    id,
                    handles,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Internal("session thread exited during construction".into()))
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transport(&self) -> Arc<LineTransport> {
        Arc::clone(&self.handles.transport)
    }

    /// Watch the output line as tokens are generated. A new subscription
    /// replaces the previous one.
    pub fn subscribe(&self) -> OutputSubscription {
        self.handles.feed.subscribe()
    }

    pub fn output_feed(&self) -> OutputFeed {
        self.handles.feed.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.handles.events.subscribe()
    }

    pub fn event_bus(&self) -> EventBus {
        self.handles.events.clone()
    }

    /// Hand a line of input to the loop. Blocks while the previous line has
    /// not been taken.
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        self.handles.transport.send(Direction::Input, line)
    }

    /// Block until the loop finishes a turn.
    pub fn receive(&self) -> Result<String> {
        match self.handles.transport.receive(Direction::Output) {
            Received::Line(line) => Ok(line),
            Received::Closed => Err(self.take_failure().unwrap_or(Error::SessionClosed)),
        }
    }

    /// Ask the loop to stop. Safe to call more than once.
    pub fn stop(&self) {
        if !self.handles.stop.swap(true, Ordering::AcqRel) {
            debug!(id = %self.id, "stopping session");
        }
        self.handles.transport.close();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// The error that ended the loop, if any. Taken at most once.
    pub fn take_failure(&self) -> Option<Error> {
        self.handles.take_failure()
    }

    /// Wait for the loop thread to exit and report how it ended.
    pub fn wait(mut self) -> Result<()> {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                return Err(Error::Internal("session thread panicked".into()));
            }
        }
        match self.take_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `f` against the session on the blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
    {
        let session = Arc::clone(self);
        let span = info_span!("session_call", id = %self.id);
        tokio::task::spawn_blocking(move || f(&session))
            .instrument(span)
            .await
            .map_err(|e| Error::Internal(format!("blocking session call failed: {e}")))?
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.thread.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!(id = %self.id, "session dropped while running, stopping");
        }
        self.stop();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}
