//! Financial document insight pipeline.
//!
//! An uploaded statement or bill is stored by content hash, its text is
//! extracted, a language model summarizes or simplifies it in the reader's
//! language, and the result can be narrated. See [`pipeline::Orchestrator`].

pub mod cache;
pub mod config;
pub mod error;
pub mod gcp_auth;
pub mod insight;
pub mod language;
pub mod ocr;
pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod schema;
pub mod speech;
pub mod store;
