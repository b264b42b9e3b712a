// Core modules
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod risk;
pub mod shutdown;
pub mod strategy;

// Re-export commonly used types
pub use models::*;
pub use strategy::Strategy;
