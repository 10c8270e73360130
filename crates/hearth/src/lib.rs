//! Hearth backend library
//!
//! Chat turns over hosted LLM providers: request reconciliation, a per-user
//! generation quota, durable history and streamed answers.

pub mod api;
pub mod auth;
pub mod chat;
pub mod db;
pub mod llm;
pub mod quota;
pub mod settings;
pub mod turn;
pub mod user;
