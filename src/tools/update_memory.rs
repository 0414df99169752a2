//! MCP `update_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `update_memory` MCP tool.
///
/// Exactly one editing mode applies per call: patch (`old_string` +
/// `new_string`), append, or metadata-only (`priority` / `disclosure`).
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UpdateMemoryParams {
    /// URI to update.
    #[schemars(description = "URI to update, e.g. 'core://agent/notes'")]
    pub uri: String,

    /// Patch mode: text to find (must match exactly once).
    #[schemars(description = "Patch mode: text to find in the existing content (must be unique)")]
    pub old_string: Option<String>,

    /// Patch mode: replacement text ("" deletes the matched section).
    #[schemars(description = "Patch mode: replacement text; use \"\" to delete the matched section")]
    pub new_string: Option<String>,

    /// Append mode: text added to the end of the content.
    #[schemars(description = "Append mode: text appended to the end of the existing content")]
    pub append: Option<String>,

    /// New priority (metadata-only when no content mode is used).
    #[schemars(description = "New retrieval priority (lower = higher priority)")]
    pub priority: Option<i64>,

    /// New disclosure trigger.
    #[schemars(description = "New disclosure trigger condition")]
    pub disclosure: Option<String>,
}
