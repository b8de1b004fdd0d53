//! Three-layer conversation memory, one instance per session.
//!
//! Working memory holds recent complete turns; fact memory holds structured
//! key facts (vehicle, pollutants, year, active file); compressed memory is a
//! free-form summary of turns that aged out. Persisted as one JSON file per
//! session.

pub mod error;
pub mod manager;
pub mod types;

pub use error::MemoryError;
pub use manager::SessionMemory;
pub use types::{FactMemory, ToolCallRecord, Turn, WorkingTurn};
