#![deny(unsafe_code)]

/// Terminal front-end: argument parsing, commands and the streaming display.
pub mod app;
/// Transcript types, the conversation store and export.
pub mod chat;
pub mod config;
/// Per-session context tying the transcript, metrics and provider together.
pub mod session;
/// Settings persistence.
pub mod settings;
pub mod stream;
