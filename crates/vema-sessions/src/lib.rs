//! Per-user session management: durable conversation history, session
//! metadata, and the per-user registry. Each session owns its router (and
//! through it, its memory); turns on one session are serialized by the
//! async mutex the manager hands out.

pub mod error;
pub mod manager;
pub mod registry;
pub mod types;

pub use error::SessionError;
pub use manager::{RouterFactory, Session, SessionManager};
pub use registry::SessionRegistry;
pub use types::{HistoryEntry, SessionMeta};
