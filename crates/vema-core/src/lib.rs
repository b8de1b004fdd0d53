//! Core types shared across the VEMA workspace: configuration,
//! standardization mappings, prompt bundle, and the common error type.

pub mod config;
pub mod error;
pub mod mappings;
pub mod prompts;

pub use error::{Result, VemaError};
