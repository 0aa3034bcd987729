pub mod analysis;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod export;
pub mod generator;
pub mod history;
pub mod perf;

pub use config::EngineConfig;
pub use db::{ConnectionDescriptor, DatabaseType, TabularResult};
pub use engine::{BatchOptions, QueryEngine, QueryOptions, QueryOutcome};
pub use error::{EngineError, Result};
