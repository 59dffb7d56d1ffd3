//! # pairchat-core
//!
//! Matchmaking and connection-lifecycle engine for anonymous one-to-one chat
//! over a direct peer transport.
//!
//! Every participant runs the same [`Engine`] against a shared presence
//! snapshot. There is no coordinator: candidates are picked at random,
//! dials are jittered and time-boxed, and crossed dials are resolved by
//! comparing addresses. Besides the single primary session the engine
//! keeps a set of secondary (friend) links over the same transport.
//!
//! The engine itself is synchronous and owns its ports; [`runtime`] drives
//! it from a tokio task.

pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod friends;
pub mod matchmaker;
pub mod runtime;
pub mod scheduler;
pub mod session;

mod handler;

pub use conversation::Conversation;
pub use engine::{snapshot_of, Engine, Ports, PrimaryLink, SecondaryLink};
pub use error::{EngineError, Result};
pub use events::{ConversationKey, EngineEvent, Indicator};
pub use friends::FriendBook;
pub use matchmaker::Matchmaker;
pub use runtime::{init_tracing, spawn_engine, EngineCommand, EngineHandle, EngineInputs};
pub use scheduler::{ManualScheduler, Scheduler, Timer, TimerHandle, TokioScheduler};
pub use session::{DisconnectReason, Session, SessionState};
