//! Data models and domain types for the corral orchestrator.
//!
//! This module contains the core data structures used throughout the
//! orchestrator: fleet entries, error types, and the typed configuration
//! sections. These models provide type safety, serialization support, and
//! validation logic for the orchestrator's operation.
//!
//! # Module Organization
//!
//! - [`backend`] - Fleet entries, capability flags, and endpoint kinds
//! - [`error`] - Orchestrator error types and upstream failure shapes
//! - [`settings`] - Configuration sections with defaults and validation
//!
//! # Design Principles
//!
//! - **Type Safety**: Leverage Rust's type system to prevent runtime errors
//! - **Validation**: Every configurable struct exposes `validate()`
//! - **Serialization**: JSON via serde for config and persisted snapshots

pub mod backend;
pub mod error;
pub mod settings;
