pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod killswitch;
pub mod monitoring;
pub mod orchestrator;
pub mod sandbox;
pub mod storage;
pub mod supervisor;
pub mod types;
pub mod validation;

pub use config::Config;
pub use error::WardenError;
pub use orchestrator::Orchestrator;
pub use types::*;
