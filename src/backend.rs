//! Generation backend abstraction
//!
//! A backend is a pluggable generation provider: given the visible
//! conversation history it produces a lazy, cancellable stream of
//! [`Update`]s, and it can count tokens in a piece of text. Failure
//! never escapes `query` — a rejected request surfaces as exactly one
//! terminal error-role update, so the conversation engine handles all
//! backends uniformly.

mod error;
pub mod local;
pub mod openai;
mod registry;

pub use error::{BackendError, BackendErrorKind};
pub use local::{LocalBackend, TokenGenerator};
pub use openai::OpenAiBackend;
pub use registry::{BackendCache, BackendCtor};

use crate::bridge::UpdateStream;
use crate::session::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Common interface for generation backends.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start a fresh generation over `history` (the full visible
    /// conversation up to and including the newest user turn). The
    /// stream is finite and not restartable; it ends with a
    /// finish-reason update or by closure. How each role is rendered
    /// into the backend's prompt form is backend-internal.
    async fn query(&self, history: &[Message]) -> UpdateStream;

    /// Deterministic token count for `text` under this backend's
    /// tokenizer. Pure: repeated calls return the same value.
    fn token_count(&self, text: &str) -> usize;
}

/// Logging wrapper for backends.
pub struct LoggingBackend {
    inner: Arc<dyn ModelBackend>,
    name: String,
}

impl LoggingBackend {
    pub fn new(name: impl Into<String>, inner: Arc<dyn ModelBackend>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for LoggingBackend {
    async fn query(&self, history: &[Message]) -> UpdateStream {
        let start = Instant::now();
        let stream = self.inner.query(history).await;
        tracing::info!(
            backend = %self.name,
            history_len = history.len(),
            setup_ms = %start.elapsed().as_millis(),
            "generation started"
        );
        stream
    }

    fn token_count(&self, text: &str) -> usize {
        self.inner.token_count(text)
    }
}
