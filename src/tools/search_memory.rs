//! MCP `search_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Optional search filters.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SearchMemoryFilters {
    /// Restrict to one domain.
    pub domain: Option<String>,
    /// Restrict to paths with this prefix (a full URI is accepted).
    pub path_prefix: Option<String>,
    /// Keep results with priority <= max_priority.
    pub max_priority: Option<i64>,
    /// ISO-8601 lower bound on updated_at (e.g. 2026-01-31T12:00:00Z).
    pub updated_after: Option<String>,
}

/// Parameters for the `search_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchMemoryParams {
    /// Search query text.
    #[schemars(description = "Search query text")]
    pub query: String,

    /// Retrieval mode: keyword, semantic, or hybrid.
    #[schemars(description = "Retrieval mode: 'keyword', 'semantic', or 'hybrid'")]
    pub mode: Option<String>,

    /// Final number of returned items (1..50).
    #[schemars(description = "Maximum results to return (1..50)")]
    pub max_results: Option<usize>,

    /// Candidate pool multiplier before the final top-k (1..20).
    #[schemars(description = "Candidate pool multiplier before the final cut (1..20)")]
    pub candidate_multiplier: Option<usize>,

    /// Merge recent session memories ahead of global results.
    #[schemars(description = "Include recent session memories as seeded candidates")]
    pub include_session: Option<bool>,

    /// Optional filters: domain, path_prefix, max_priority, updated_after.
    pub filters: Option<SearchMemoryFilters>,
}
