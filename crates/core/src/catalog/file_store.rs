//! File-based catalog storage implementation
//!
//! Stores food items as JSON in a file on disk.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::info;

use super::model::{FoodItem, NewFoodItem};
use super::repository::FoodRepository;
use crate::{Error, Result};

/// File-based food store using JSON
pub struct FileFoodStore {
    /// Path to the JSON file
    path: PathBuf,
    /// In-memory cache of items, ordered by id
    cache: RwLock<BTreeMap<i64, FoodItem>>,
}

impl FileFoodStore {
    /// Create a new FileFoodStore
    ///
    /// If the file doesn't exist, it will be created on first write.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let items: Vec<FoodItem> = serde_json::from_str(&content)?;
            items.into_iter().map(|item| (item.id, item)).collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    /// Persist the cache to disk
    async fn persist(&self, cache: &BTreeMap<i64, FoodItem>) -> Result<()> {
        let items: Vec<&FoodItem> = cache.values().collect();
        let content = serde_json::to_string_pretty(&items)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl FoodRepository for FileFoodStore {
    async fn list(&self) -> Result<Vec<FoodItem>> {
        let cache = self.cache.read().await;
        Ok(cache.values().cloned().collect())
    }

    async fn search(&self, term: &str) -> Result<Vec<FoodItem>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let cache = self.cache.read().await;
        Ok(cache
            .values()
            .filter(|item| item.matches(term))
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<FoodItem>> {
        let cache = self.cache.read().await;
        Ok(cache.get(&id).cloned())
    }

    async fn add(&self, item: NewFoodItem) -> Result<FoodItem> {
        let mut cache = self.cache.write().await;
        let id = cache.keys().next_back().map_or(1, |last| last + 1);
        let item = item.into_item(id);
        cache.insert(id, item.clone());
        if let Err(e) = self.persist(&cache).await {
            cache.remove(&id);
            return Err(e);
        }
        info!("Added food item {} (ID {})", item.name, item.id);
        Ok(item)
    }

    async fn update_stock(&self, id: i64, amount: i32) -> Result<Option<FoodItem>> {
        let mut cache = self.cache.write().await;
        let Some(item) = cache.get_mut(&id) else {
            return Ok(None);
        };
        let previous = item.in_stock;
        let Some(in_stock) = previous.checked_add(amount) else {
            return Err(Error::InvalidInput(format!(
                "Stock for '{}' cannot change by {} from {}.",
                item.name, amount, previous
            )));
        };
        item.in_stock = in_stock;
        let updated = item.clone();

        if let Err(e) = self.persist(&cache).await {
            if let Some(item) = cache.get_mut(&id) {
                item.in_stock = previous;
            }
            return Err(e);
        }
        info!(
            "Updated stock for {} (ID {}) by {}. New stock: {}",
            updated.name, updated.id, amount, updated.in_stock
        );
        Ok(Some(updated))
    }

    async fn remove(&self, id: i64) -> Result<Option<FoodItem>> {
        let mut cache = self.cache.write().await;
        let Some(item) = cache.remove(&id) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&cache).await {
            cache.insert(id, item);
            return Err(e);
        }
        info!("Removed food item {} (ID {})", item.name, item.id);
        Ok(Some(item))
    }
}
