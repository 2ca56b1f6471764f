#![deny(unsafe_code)]

/// Terminal front-end and command handling.
pub mod app;
/// Sessions, message grouping and the send/retry pipeline.
pub mod chat;
/// Layered settings persistence.
pub mod settings;
pub mod theme;
