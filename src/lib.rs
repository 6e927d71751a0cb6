// src/lib.rs

// Import the top-level `armada` module.
pub mod armada;

// Re-exporting key items for easier external access.
pub use armada::agent::{Agent, ChatResult};
pub use armada::config::MissionConfig;
pub use armada::provider::{Message, Provider, ProviderRegistry, Role};
pub use armada::runner::{MissionReport, MissionRunner};
pub use armada::session::Session;
pub use armada::supervisor::Supervisor;
