//! OpenAI-compatible HTTP proxy for a local Ollama server.
//!
//! Requests arrive in the OpenAI wire shape, are translated to Ollama's
//! native shape, forwarded, and the response (buffered or streamed) is
//! translated back. The server itself is started and stopped by the
//! supervisor in `llamalink-runtime`; [`serve`] runs on a pre-bound listener
//! until its cancellation token fires.

#![deny(unsafe_code)]

pub mod error;
pub mod models;
pub mod ollama_models;
mod ollama_stream;
pub mod server;
pub mod translate;
pub mod upstream;

pub use error::ProxyError;
pub use server::serve;
