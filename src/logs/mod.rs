//! Logging configuration for the orchestrator.

pub mod logger;

pub use logger::configure_logger;
