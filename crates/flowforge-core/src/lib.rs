pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::CoreError;
pub use types::*;
