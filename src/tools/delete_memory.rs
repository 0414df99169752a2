//! MCP `delete_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `delete_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DeleteMemoryParams {
    /// The URI to delete. Only the path is removed; the memory survives under
    /// any other alias and is deprecated when the last path goes away.
    #[schemars(description = "URI to delete, e.g. 'core://agent/old_note'")]
    pub uri: String,
}
