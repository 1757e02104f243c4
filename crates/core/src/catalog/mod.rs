//! Catalog module
//!
//! The food catalog whose operations are exposed to agents as tools.

mod file_store;
mod model;
mod repository;

pub use file_store::FileFoodStore;
pub use model::*;
pub use repository::FoodRepository;
