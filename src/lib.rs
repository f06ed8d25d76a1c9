pub mod censor;
pub mod config;
pub mod conversation;
pub mod error;
pub mod handshake;
pub mod llm;
pub mod orchestrator;
pub mod search;
pub mod store;

pub use error::{ParleyError, Result};
