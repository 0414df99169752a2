//! MCP `read_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `read_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReadMemoryParams {
    /// The memory URI (e.g. `core://agent`, `system://boot`).
    #[schemars(description = "Memory URI, e.g. 'core://agent'. System views: system://boot, system://index, system://recent[/N]")]
    pub uri: String,

    /// Optional chunk index for partial reads (0-based). Mutually exclusive
    /// with `range` and `max_chars`.
    #[schemars(description = "Optional 0-based chunk index for partial reads")]
    pub chunk_id: Option<i64>,

    /// Optional character range `start:end`.
    #[schemars(description = "Optional character range 'start:end' (e.g. '0:500')")]
    pub range: Option<String>,

    /// Optional hard cap on returned characters.
    #[schemars(description = "Optional hard cap on returned characters (>= 1)")]
    pub max_chars: Option<i64>,
}
