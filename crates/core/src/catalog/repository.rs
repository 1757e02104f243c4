//! Catalog repository trait
//!
//! Defines the interface for food catalog storage operations.

use async_trait::async_trait;

use super::model::{FoodItem, NewFoodItem};
use crate::Result;

/// Repository interface for the food catalog
#[async_trait]
pub trait FoodRepository: Send + Sync {
    /// All items, ordered by id
    async fn list(&self) -> Result<Vec<FoodItem>>;

    /// Items whose name, code or description contains the term
    async fn search(&self, term: &str) -> Result<Vec<FoodItem>>;

    /// Get an item by id
    async fn get(&self, id: i64) -> Result<Option<FoodItem>>;

    /// Store a new item and assign its id
    async fn add(&self, item: NewFoodItem) -> Result<FoodItem>;

    /// Add `amount` (may be negative) to the stock level
    async fn update_stock(&self, id: i64, amount: i32) -> Result<Option<FoodItem>>;

    /// Remove an item, returning it if it existed
    async fn remove(&self, id: i64) -> Result<Option<FoodItem>>;
}
