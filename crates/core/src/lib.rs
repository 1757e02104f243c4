//! Core library for Agent Relay
//!
//! This crate contains the domain model shared by the runner and the server:
//! - Agent definitions and the agent registry
//! - Pipeline specifications
//! - The food catalog exposed as callable tools

pub mod agent;
pub mod catalog;
pub mod error;
pub mod pipeline;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
