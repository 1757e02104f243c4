//! Agent module
//!
//! Agent definitions, the tools they may call, and the registry that
//! resolves them by name.

mod model;
mod registry;

pub use model::*;
pub use registry::AgentRegistry;
