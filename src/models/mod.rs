//! Wire-facing data structures.
//!
//! - `chat`: the inbound OpenAI-compatible Chat Completions surface.
//! - `upstream`: payloads for the private conversational web API we drive.

pub mod chat;
pub mod upstream;
