//! Conversation state machine
//!
//! [`ChatEngine`] owns one [`Session`] and applies the defined
//! transitions: submit, edit, delete, regenerate, interrupt. All
//! session mutation and persistence happens here, on the controller —
//! generation workers only ever talk through the hand-off channel.
//!
//! The engine is `Idle` or `Generating`. `submit` drives a generation
//! to completion: it persists the user turn, appends the pending
//! placeholder, consumes the backend's update stream (observing the
//! interrupt flag between applications), then finalizes the reply.
//! Re-entrancy is structurally impossible (`&mut self`), and a caller
//! that dropped a submit future mid-generation sees `Status::Generating`
//! and gets [`EngineError::Busy`] until the next successful operation.

use crate::backend::ModelBackend;
use crate::session::{Message, Role, Session, Update};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Per-session generation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Generating,
}

/// Persistence collaborator. `save` and `delete` are expected to be
/// atomic from the engine's point of view; the engine never retries.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<(), StoreError>;
    fn delete(&self, session: &Session) -> Result<(), StoreError>;
}

/// A `save`/`delete` call failed. Propagated to the caller of the
/// triggering operation; in-memory state stays as applied.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Render collaborator: pushed the session after every mutation it
/// should display. Passive; must not mutate engine state.
pub trait Renderer: Send {
    fn render(&mut self, session: &Session);
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a generation is already in progress")]
    Busy,
    #[error("no message at index {index}")]
    OutOfBounds { index: usize },
    #[error("message at index {index} is not a user or system turn")]
    NotEditable { index: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cloneable handle for requesting interruption of an in-flight
/// generation. The flag is observed between successive update
/// applications; partial content already applied is always retained.
#[derive(Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State machine for one conversation.
pub struct ChatEngine<S: SessionStore, R: Renderer> {
    session: Session,
    backend: Arc<dyn ModelBackend>,
    store: S,
    renderer: R,
    status: Status,
    editing: Option<usize>,
    interrupt: Arc<AtomicBool>,
}

impl<S: SessionStore, R: Renderer> ChatEngine<S, R> {
    pub fn new(session: Session, backend: Arc<dyn ModelBackend>, store: S, renderer: R) -> Self {
        Self {
            session,
            backend,
            store,
            renderer,
            status: Status::Idle,
            editing: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Index currently staged for editing, if any.
    pub fn editing(&self) -> Option<usize> {
        self.editing
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    /// Enter edit mode at `index`. Mutates nothing until the next
    /// `submit`, which will overwrite the message and truncate
    /// everything after it.
    pub fn edit(&mut self, index: usize) -> Result<(), EngineError> {
        self.require_idle()?;
        self.require_editable(index)?;
        self.editing = Some(index);
        Ok(())
    }

    /// Remove the user/system message at `index` together with the
    /// reply that immediately follows it, if one exists.
    pub fn delete(&mut self, index: usize) -> Result<(), EngineError> {
        self.require_idle()?;
        self.require_editable(index)?;

        if index + 1 < self.session.messages.len() {
            self.session.messages.remove(index + 1);
        }
        self.session.messages.remove(index);
        // A staged edit at or past the removed turn no longer points at
        // what the user selected.
        if self.editing.is_some_and(|i| i >= index) {
            self.editing = None;
        }

        self.store.save(&self.session)?;
        self.renderer.render(&self.session);
        Ok(())
    }

    /// Re-run generation for the turn at `index` with its content
    /// unchanged, discarding everything after it.
    pub async fn regenerate(&mut self, index: usize) -> Result<(), EngineError> {
        self.require_idle()?;
        self.require_editable(index)?;
        let text = self.session.messages[index].content.clone();
        self.editing = Some(index);
        self.submit(&text).await
    }

    /// Submit user input and drive the resulting generation to
    /// completion, applying updates to the pending reply as they
    /// arrive.
    pub async fn submit(&mut self, text: &str) -> Result<(), EngineError> {
        self.require_idle()?;

        let user_index = match self.editing {
            Some(index) => {
                // Truncate-and-regenerate: the edited turn keeps its
                // position, everything after it is discarded.
                let message = &mut self.session.messages[index];
                message.content = text.to_string();
                message.tokens = Some(self.backend.token_count(text));
                self.session.messages.truncate(index + 1);
                index
            }
            None => {
                self.session.messages.push(Message::with_tokens(
                    Role::User,
                    text,
                    self.backend.token_count(text),
                ));
                self.session.messages.len() - 1
            }
        };

        self.store.save(&self.session)?;
        self.renderer.render(&self.session);

        // Reserve the reply slot before the stream starts so the UI
        // shows the in-flight turn.
        self.session.messages.push(Message::pending());
        self.renderer.render(&self.session);

        self.status = Status::Generating;
        tracing::info!(
            session = %self.session.id,
            history_len = user_index + 1,
            "generation started"
        );

        let mut stream = self
            .backend
            .query(&self.session.messages[..=user_index])
            .await;

        let mut interrupted = false;
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            match stream.next().await {
                Some(update) => self.apply(update),
                None => break,
            }
        }

        if interrupted {
            tracing::info!(session = %self.session.id, "generation interrupted");
            stream.cancel();
            // Consume to closure so the worker is drained and joined;
            // content arriving after the interrupt is discarded.
            stream.drain().await;
        }

        self.complete()
    }

    /// Apply one update to the pending reply and notify the renderer.
    fn apply(&mut self, update: Update) {
        let reply = self
            .session
            .messages
            .last_mut()
            .expect("pending reply exists while generating");
        if let Some(role) = update.role {
            reply.role = Some(role);
        }
        if let Some(content) = &update.content {
            reply.content.push_str(content);
        }
        if let Some(reason) = &update.finish_reason {
            tracing::debug!(session = %self.session.id, reason = %reason, "finish reason");
        }
        self.renderer.render(&self.session);
    }

    /// Finalize the reply: token accounting, persistence, back to idle.
    fn complete(&mut self) -> Result<(), EngineError> {
        let reply = self
            .session
            .messages
            .last_mut()
            .expect("pending reply exists while generating");
        reply.tokens = Some(self.backend.token_count(&reply.content));

        self.status = Status::Idle;
        self.editing = None;
        self.interrupt.store(false, Ordering::SeqCst);

        let saved = self.store.save(&self.session);
        self.renderer.render(&self.session);
        tracing::info!(
            session = %self.session.id,
            messages = self.session.messages.len(),
            "generation complete"
        );
        saved.map_err(EngineError::from)
    }

    fn require_idle(&self) -> Result<(), EngineError> {
        match self.status {
            Status::Idle => Ok(()),
            Status::Generating => Err(EngineError::Busy),
        }
    }

    fn require_editable(&self, index: usize) -> Result<(), EngineError> {
        let message = self
            .session
            .messages
            .get(index)
            .ok_or(EngineError::OutOfBounds { index })?;
        if message.role.is_some_and(Role::is_editable) {
            Ok(())
        } else {
            Err(EngineError::NotEditable { index })
        }
    }
}
