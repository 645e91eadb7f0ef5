pub mod collaborators;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod memory;
pub mod tracking;
pub mod types;

pub use config::AppConfig;
pub use error::{CollaboratorError, EngineError, EngineResult, ValidationError};
