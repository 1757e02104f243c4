//! Catalog model definitions

use serde::{Deserialize, Serialize};

/// A food item in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodItem {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: String,
    pub price: f64,
    pub in_stock: i32,
    pub min_stock: i32,
    pub picture_url: String,
}

impl FoodItem {
    /// Substring match on name, code or description
    pub fn matches(&self, term: &str) -> bool {
        self.name.contains(term) || self.code.contains(term) || self.description.contains(term)
    }
}

/// Fields for a food item that has not been stored yet
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFoodItem {
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub in_stock: i32,
    #[serde(default)]
    pub min_stock: i32,
    #[serde(default)]
    pub picture_url: Option<String>,
}

impl NewFoodItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    pub fn with_stock(mut self, in_stock: i32, min_stock: i32) -> Self {
        self.in_stock = in_stock;
        self.min_stock = min_stock;
        self
    }

    /// Assign an id; text fields are trimmed and missing ones become empty
    pub fn into_item(self, id: i64) -> FoodItem {
        fn clean(value: Option<String>) -> String {
            value.map(|v| v.trim().to_string()).unwrap_or_default()
        }

        FoodItem {
            id,
            name: self.name.trim().to_string(),
            code: clean(self.code),
            description: clean(self.description),
            price: self.price,
            in_stock: self.in_stock,
            min_stock: self.min_stock,
            picture_url: clean(self.picture_url),
        }
    }
}

/// Collection wrapper returned by the list and search tools
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoodItemCollection {
    pub items: Vec<FoodItem>,
}

impl From<Vec<FoodItem>> for FoodItemCollection {
    fn from(items: Vec<FoodItem>) -> Self {
        Self { items }
    }
}
