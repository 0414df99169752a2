//! MCP `add_alias` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `add_alias` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AddAliasParams {
    /// New URI to create (the alias). May cross domains.
    #[schemars(description = "New alias URI to create")]
    pub new_uri: String,

    /// Existing URI whose memory the alias should point at.
    #[schemars(description = "Existing target URI to alias")]
    pub target_uri: String,

    /// Retrieval priority for this alias context.
    #[schemars(description = "Retrieval priority for this alias (lower = higher priority)")]
    pub priority: Option<i64>,

    /// Disclosure condition for this alias context.
    #[schemars(description = "Disclosure condition for this specific alias")]
    pub disclosure: Option<String>,
}
