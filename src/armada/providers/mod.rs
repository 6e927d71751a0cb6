//! Concrete [`Provider`](crate::armada::provider::Provider)
//! implementations.
//!
//! Vendor-exact adapters live outside the engine; what ships here is the
//! one wire format the whole ecosystem speaks: OpenAI-compatible chat
//! completions with SSE streaming, which also fronts Gemini's and many
//! proxies' compatibility endpoints.

pub mod openai_compat;

pub use openai_compat::{registry_from_config, OpenAiCompatProvider};
