//! Local inference backend
//!
//! Wraps an in-process, blocking token generator behind the streaming
//! bridge: each query renders the history into a plain-text prompt,
//! then a dedicated worker thread drives the generator's token loop and
//! republishes coalesced updates to the controller. Model loading and
//! tokenization live behind [`TokenGenerator`]; this module only owns
//! prompt formatting and the bridge wiring.

use super::ModelBackend;
use crate::bridge::UpdateStream;
use crate::config::ModelConfig;
use crate::session::{Message, Role, Update};
use async_trait::async_trait;
use std::sync::Arc;

/// Opaque in-process generation capability. Implementations own the
/// loaded model; creating one is expensive, which is why backend
/// instances are cached per configuration.
pub trait TokenGenerator: Send + Sync {
    /// Blocking token loop: yields detokenized text fragments until the
    /// generation ends or an item is an error. Not restartable.
    fn generate(
        &self,
        prompt: &str,
    ) -> Box<dyn Iterator<Item = Result<String, super::BackendError>> + Send + '_>;

    /// Tokenize `text` and return the token count. Pure.
    fn count_tokens(&self, text: &str) -> usize;
}

/// Backend over a blocking [`TokenGenerator`].
pub struct LocalBackend {
    generator: Arc<dyn TokenGenerator>,
    config: ModelConfig,
}

impl LocalBackend {
    pub fn new(config: &ModelConfig, generator: Arc<dyn TokenGenerator>) -> Arc<dyn ModelBackend> {
        Arc::new(Self {
            generator,
            config: config.clone(),
        })
    }

    /// Render the visible history into the generator's prompt form: the
    /// configured system message is prepended to the first turn, and
    /// optional `prefix`/`suffix` params wrap each user or system turn.
    fn render_prompt(&self, history: &[Message]) -> String {
        let prefix = self.config.str_param("prefix");
        let suffix = self.config.str_param("suffix");

        let mut turns: Vec<String> = Vec::with_capacity(history.len());
        for (i, message) in history.iter().enumerate() {
            match message.role {
                Some(Role::User) | Some(Role::System) => {
                    let mut content = message.content.clone();
                    if i == 0 {
                        if let Some(system) = &self.config.system_message {
                            content = format!("{system} {content}");
                        }
                    }
                    if let Some(p) = prefix {
                        content = format!("{p} {content}");
                    }
                    if let Some(s) = suffix {
                        content = format!("{content} {s}");
                    }
                    turns.push(content);
                }
                Some(Role::Assistant) => turns.push(message.content.clone()),
                // Error turns and the pending placeholder are invisible
                // to the model.
                Some(Role::Error) | None => {}
            }
        }
        turns.join("\n")
    }
}

#[async_trait]
impl ModelBackend for LocalBackend {
    async fn query(&self, history: &[Message]) -> UpdateStream {
        let prompt = self.render_prompt(history);
        let generator = Arc::clone(&self.generator);

        UpdateStream::bridge(move |worker| {
            if worker.send(Update::role(Role::Assistant)).is_err() {
                return Ok(());
            }
            for token in generator.generate(&prompt) {
                // Stop flag checked once per token: cancellation costs
                // at most one extra unit of generation.
                if worker.stopped() {
                    break;
                }
                let token = token?;
                if worker.push(&token).is_err() {
                    break;
                }
            }
            Ok(())
        })
    }

    fn token_count(&self, text: &str) -> usize {
        self.generator.count_tokens(text)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::BackendError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted generator: yields a fixed token sequence, optionally
    /// ending in an error, and counts how many tokens it produced.
    pub struct ScriptedGenerator {
        pub tokens: Vec<Result<String, BackendError>>,
        pub produced: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub fn ok(tokens: &[&str]) -> Self {
            Self {
                tokens: tokens.iter().map(|t| Ok((*t).to_string())).collect(),
                produced: AtomicUsize::new(0),
            }
        }
    }

    impl TokenGenerator for ScriptedGenerator {
        fn generate(
            &self,
            _prompt: &str,
        ) -> Box<dyn Iterator<Item = Result<String, BackendError>> + Send + '_> {
            let cloned: Vec<_> = self
                .tokens
                .iter()
                .map(|t| match t {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(BackendError::new(e.kind, e.message.clone())),
                })
                .collect();
            let counter = &self.produced;
            Box::new(cloned.into_iter().inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        }

        fn count_tokens(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }
}
