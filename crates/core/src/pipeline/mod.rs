//! Pipeline module
//!
//! Declarative descriptions of multi-agent pipelines.

mod model;

pub use model::*;
