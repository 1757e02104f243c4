//! Catalog operations exposed as tools
//!
//! The same five tools are served to external clients over `POST /mcp` and
//! to agents through function tools whose target is `catalog`.

use std::sync::Arc;

use agent_runner::{RunnerError, ToolInvoker};
use async_trait::async_trait;
use relay_core::agent::FunctionTool;
use relay_core::catalog::{FoodItem, FoodItemCollection, FoodRepository, NewFoodItem};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Target name for catalog function tools
pub const CATALOG_TARGET: &str = "catalog";

#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error(transparent)]
    Store(#[from] relay_core::Error),
}

/// Output of a tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Text handed back to the caller
    pub text: String,
    /// Machine-readable form, for tools returning collections
    pub structured: Option<Value>,
}

impl ToolResult {
    fn text(text: String) -> Self {
        Self {
            text,
            structured: None,
        }
    }

    fn collection(items: Vec<FoodItem>) -> Result<Self, ToolCallError> {
        let value = serde_json::to_value(FoodItemCollection::from(items))
            .map_err(relay_core::Error::from)?;
        Ok(Self {
            text: value.to_string(),
            structured: Some(value),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchArgs {
    search_term: String,
}

#[derive(Deserialize)]
struct UpdateStockArgs {
    id: i64,
    amount: i32,
}

#[derive(Deserialize)]
struct RemoveArgs {
    id: i64,
}

fn not_found(id: i64) -> String {
    format!("Food item with id {} not found.", id)
}

pub struct CatalogTools {
    store: Arc<dyn FoodRepository>,
}

impl CatalogTools {
    pub fn new(store: Arc<dyn FoodRepository>) -> Self {
        Self { store }
    }

    /// Tool definitions, as function tools targeting the catalog
    pub fn definitions() -> Vec<FunctionTool> {
        let id_schema = |description: &str| json!({ "type": "integer", "description": description });
        vec![
            FunctionTool::new("ListFood", CATALOG_TARGET)
                .with_description("Lists all food items in the catalog."),
            FunctionTool::new("SearchFood", CATALOG_TARGET)
                .with_description("Searches food items by name, code or description substring.")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "searchTerm": {
                            "type": "string",
                            "description": "Term to match against name, code or description"
                        }
                    },
                    "required": ["searchTerm"]
                })),
            FunctionTool::new("AddFood", CATALOG_TARGET)
                .with_description("Adds a new food item to the catalog")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Display name of the food item" },
                        "code": { "type": "string", "description": "Unique short code (optional)" },
                        "description": { "type": "string", "description": "Marketing description (optional)" },
                        "price": { "type": "number", "description": "Unit price" },
                        "inStock": { "type": "integer", "description": "Initial stock quantity" },
                        "minStock": { "type": "integer", "description": "Minimum stock for alerts" },
                        "pictureUrl": { "type": "string", "description": "Picture URL (optional)" }
                    },
                    "required": ["name"]
                })),
            FunctionTool::new("UpdateStock", CATALOG_TARGET)
                .with_description("Updates the stock level for a food item")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "id": id_schema("Existing food item id"),
                        "amount": { "type": "integer", "description": "Amount to add (can be negative)" }
                    },
                    "required": ["id", "amount"]
                })),
            FunctionTool::new("RemoveFood", CATALOG_TARGET)
                .with_description("Removes a food item by id")
                .with_parameters(json!({
                    "type": "object",
                    "properties": { "id": id_schema("Food item id to remove") },
                    "required": ["id"]
                })),
        ]
    }

    /// Call a tool by name
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<ToolResult, ToolCallError> {
        debug!(tool = %name, "Calling catalog tool");
        match name {
            "ListFood" => ToolResult::collection(self.store.list().await?),
            "SearchFood" => {
                let args: SearchArgs = parse_args(name, arguments)?;
                ToolResult::collection(self.store.search(&args.search_term).await?)
            }
            "AddFood" => {
                let item: NewFoodItem = parse_args(name, arguments)?;
                let added = self.store.add(item).await?;
                Ok(ToolResult::text(format!(
                    "Added food item '{}' with id {}.",
                    added.name, added.id
                )))
            }
            "UpdateStock" => {
                let args: UpdateStockArgs = parse_args(name, arguments)?;
                let updated = self
                    .store
                    .update_stock(args.id, args.amount)
                    .await
                    .map_err(|e| match e {
                        relay_core::Error::InvalidInput(message) => ToolCallError::InvalidArguments {
                            tool: name.to_string(),
                            message,
                        },
                        other => ToolCallError::Store(other),
                    })?;
                let text = match updated {
                    Some(item) => format!("Updated stock for '{}' to {}.", item.name, item.in_stock),
                    None => not_found(args.id),
                };
                Ok(ToolResult::text(text))
            }
            "RemoveFood" => {
                let args: RemoveArgs = parse_args(name, arguments)?;
                let text = match self.store.remove(args.id).await? {
                    Some(item) => format!("Removed food item '{}'.", item.name),
                    None => not_found(args.id),
                };
                Ok(ToolResult::text(text))
            }
            other => Err(ToolCallError::UnknownTool(other.to_string())),
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T, ToolCallError> {
    let arguments = match arguments {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(arguments).map_err(|e| ToolCallError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ToolInvoker for CatalogTools {
    async fn invoke(&self, tool: &FunctionTool, arguments: &Value) -> agent_runner::Result<String> {
        self.call(&tool.name, arguments)
            .await
            .map(|result| result.text)
            .map_err(|e| RunnerError::tool_failed(&tool.name, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::catalog::FileFoodStore;
    use tempfile::TempDir;

    async fn create_test_tools() -> (CatalogTools, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileFoodStore::new(temp_dir.path().join("catalog.json"))
            .await
            .unwrap();
        (CatalogTools::new(Arc::new(store)), temp_dir)
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let (tools, _temp) = create_test_tools().await;

        let added = tools
            .call(
                "AddFood",
                &json!({ "name": "  Pizza Margherita ", "price": 9.5, "inStock": 4 }),
            )
            .await
            .unwrap();
        assert_eq!(added.text, "Added food item 'Pizza Margherita' with id 1.");

        let listed = tools.call("ListFood", &Value::Null).await.unwrap();
        let structured = listed.structured.unwrap();
        assert_eq!(structured["items"][0]["name"], "Pizza Margherita");
        assert_eq!(structured["items"][0]["code"], "");
        assert_eq!(structured["items"][0]["inStock"], 4);
    }

    #[tokio::test]
    async fn test_update_stock_and_remove() {
        let (tools, _temp) = create_test_tools().await;
        tools
            .call("AddFood", &json!({ "name": "Soup", "inStock": 10 }))
            .await
            .unwrap();

        let updated = tools
            .call("UpdateStock", &json!({ "id": 1, "amount": -3 }))
            .await
            .unwrap();
        assert_eq!(updated.text, "Updated stock for 'Soup' to 7.");

        let removed = tools.call("RemoveFood", &json!({ "id": 1 })).await.unwrap();
        assert_eq!(removed.text, "Removed food item 'Soup'.");

        let missing = tools.call("RemoveFood", &json!({ "id": 1 })).await.unwrap();
        assert_eq!(missing.text, "Food item with id 1 not found.");
    }

    #[tokio::test]
    async fn test_stock_overflow_is_invalid_arguments() {
        let (tools, _temp) = create_test_tools().await;
        tools
            .call("AddFood", &json!({ "name": "Rice", "inStock": i32::MAX }))
            .await
            .unwrap();

        let err = tools
            .call("UpdateStock", &json!({ "id": 1, "amount": 1 }))
            .await
            .unwrap_err();
        match err {
            ToolCallError::InvalidArguments { tool, message } => {
                assert_eq!(tool, "UpdateStock");
                assert!(message.contains("Rice"));
            }
            e => panic!("Expected InvalidArguments, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_blank_search_returns_nothing() {
        let (tools, _temp) = create_test_tools().await;
        tools.call("AddFood", &json!({ "name": "Soup" })).await.unwrap();

        let result = tools
            .call("SearchFood", &json!({ "searchTerm": "  " }))
            .await
            .unwrap();
        assert_eq!(result.structured.unwrap()["items"], json!([]));

        let result = tools
            .call("SearchFood", &json!({ "searchTerm": "ou" }))
            .await
            .unwrap();
        assert_eq!(result.structured.unwrap()["items"][0]["name"], "Soup");
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (tools, _temp) = create_test_tools().await;

        let err = tools.call("UpdateStock", &json!({ "id": "one" })).await.unwrap_err();
        assert!(matches!(err, ToolCallError::InvalidArguments { .. }));

        let err = tools.call("DropTables", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolCallError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_invoker_returns_text() {
        let (tools, _temp) = create_test_tools().await;
        let tool = FunctionTool::new("AddFood", CATALOG_TARGET);

        let text = tools.invoke(&tool, &json!({ "name": "Bread" })).await.unwrap();
        assert_eq!(text, "Added food item 'Bread' with id 1.");

        let tool = FunctionTool::new("AddFood", CATALOG_TARGET);
        let err = tools.invoke(&tool, &json!({})).await.unwrap_err();
        assert!(matches!(err, RunnerError::ToolFailed { .. }));
    }

    #[test]
    fn test_definitions_target_catalog() {
        let names: Vec<String> = CatalogTools::definitions()
            .into_iter()
            .inspect(|tool| assert_eq!(tool.target, CATALOG_TARGET))
            .map(|tool| tool.name)
            .collect();
        assert_eq!(
            names,
            vec!["ListFood", "SearchFood", "AddFood", "UpdateStock", "RemoveFood"]
        );
    }
}
