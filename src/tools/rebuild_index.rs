//! MCP `rebuild_index` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `rebuild_index` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RebuildIndexParams {
    /// Target memory id; rebuilds everything when omitted. Mutually exclusive
    /// with `sleep_consolidation`.
    #[schemars(description = "Optional target memory id; omit to rebuild all active memories")]
    pub memory_id: Option<i64>,

    /// Audit label for the job.
    #[schemars(description = "Audit label for this task")]
    pub reason: Option<String>,

    /// Block until the job finishes (or the timeout expires).
    #[schemars(description = "Wait for job completion before returning")]
    pub wait: Option<bool>,

    /// Wait timeout in seconds.
    #[schemars(description = "Wait timeout in seconds when wait=true")]
    pub timeout_seconds: Option<u64>,

    /// Enqueue a sleep-consolidation scan instead of an index rebuild.
    #[schemars(description = "Enqueue a sleep-time consolidation task instead")]
    pub sleep_consolidation: Option<bool>,
}
