//! MCP `compact_context` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `compact_context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CompactContextParams {
    /// Reason label recorded on the flush.
    #[schemars(description = "Reason label for this compaction flush")]
    pub reason: Option<String>,

    /// Flush even when the volume threshold has not been reached.
    #[schemars(description = "Flush even when the threshold is not reached")]
    pub force: Option<bool>,

    /// Maximum trace lines included in the summary (>= 3).
    #[schemars(description = "Maximum event lines to include in the summary (>= 3)")]
    pub max_lines: Option<usize>,
}
