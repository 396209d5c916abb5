//! Streaming generation engine for multi-turn chat
//!
//! Drives conversations against interchangeable generation backends —
//! networked OpenAI-style endpoints and in-process local inference —
//! behind one abstraction. A [`backend::ModelBackend`] turns the
//! visible history into a cancellable stream of [`session::Update`]s;
//! the [`bridge`] moves those updates from blocking generation threads
//! onto the async controller with coalescing and backpressure; the
//! [`engine::ChatEngine`] applies them to the session under the
//! submit/edit/delete/regenerate/interrupt transitions.
//!
//! Rendering, persistence, and configuration loading are collaborator
//! seams ([`engine::Renderer`], [`engine::SessionStore`], the TOML
//! tables in [`config`]) owned by the embedding application.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod session;

pub use backend::{BackendCache, BackendError, BackendErrorKind, ModelBackend};
pub use bridge::{UpdateSender, UpdateStream, Worker};
pub use config::{BackendKind, Config, ModelConfig, ParamValue};
pub use engine::{ChatEngine, EngineError, InterruptHandle, Renderer, SessionStore, Status};
pub use session::{Message, Role, Session, Update};
