//! Spam pipeline — resolves addresses, fetches their messages, and ranks spam verdicts.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod services;
