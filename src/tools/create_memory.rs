//! MCP `create_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `create_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateMemoryParams {
    /// Parent URI (e.g. `core://agent`; use `core://` for the domain root).
    #[schemars(description = "Parent URI, e.g. 'core://agent'. Use 'core://' for the domain root.")]
    pub parent_uri: String,

    /// Memory content.
    #[schemars(description = "The content of the new memory")]
    pub content: String,

    /// Retrieval priority (lower = higher priority, minimum 0).
    #[schemars(description = "Retrieval priority: lower = higher priority, minimum 0")]
    pub priority: i64,

    /// Optional title (`[a-z0-9_-]+`). Auto-assigns a numeric token if omitted.
    #[schemars(description = "Optional title matching [a-z0-9_-]+; a numeric token is assigned if omitted")]
    pub title: Option<String>,

    /// Short trigger condition describing when to read this memory.
    #[schemars(description = "When should this memory be recalled? A short trigger condition.")]
    pub disclosure: Option<String>,
}
