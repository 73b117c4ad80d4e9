//! Client-side synchronization engine for relayed terminal sessions.
//!
//! [`Mirror::start`] primes state from the [`store`], then subscribes to the
//! relay through a reconnecting [`transport`] and keeps a per-session
//! transcript that is flushed back to the log in deltas.

pub mod buffer;
pub mod cli;
pub mod config;
pub mod input;
pub mod mirror;
pub mod normalize;
pub mod scope;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use buffer::{FlushReport, OutputBuffer};
pub use config::{MirrorConfig, TransportKind};
pub use mirror::{Mirror, MirrorError, MirrorHandle};
pub use normalize::NormalizeMode;
pub use session::{OutputChunk, RegistrySnapshot, Session, SessionStatus};
pub use store::{InMemoryLogStore, LogStore, SqliteLogStore};
