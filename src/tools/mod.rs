pub mod add_alias;
pub mod compact_context;
pub mod create_memory;
pub mod delete_memory;
pub mod index_status;
pub mod read_memory;
pub mod rebuild_index;
pub mod search_memory;
pub mod update_memory;

use rmcp::handler::server::tool::Parameters;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

use add_alias::AddAliasParams;
use compact_context::CompactContextParams;
use create_memory::CreateMemoryParams;
use delete_memory::DeleteMemoryParams;
use index_status::IndexStatusParams;
use read_memory::ReadMemoryParams;
use rebuild_index::RebuildIndexParams;
use search_memory::SearchMemoryParams;
use update_memory::UpdateMemoryParams;

use crate::core::PalaceCore;
use crate::errors::PalaceError;
use crate::retrieval::{search::SearchFilters, SearchRequest};

/// The Memory Palace MCP tool handler. Holds the composition root and exposes
/// the nine tools via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct PalaceTools {
    tool_router: ToolRouter<Self>,
    core: Arc<PalaceCore>,
}

/// Serialize a core result to the MCP string payload. Typed errors become
/// `ok=false` payloads carrying the machine-readable kind; they are tool
/// results, not protocol failures.
fn to_tool_result(result: crate::errors::Result<serde_json::Value>) -> Result<String, String> {
    let payload = match result {
        Ok(value) => value,
        Err(e) => error_payload(&e),
    };
    serde_json::to_string(&payload).map_err(|e| format!("serialization failed: {e}"))
}

fn error_payload(e: &PalaceError) -> serde_json::Value {
    json!({
        "ok": false,
        "error": e.kind(),
        "message": e.to_string(),
    })
}

#[tool_router]
impl PalaceTools {
    pub fn new(core: Arc<PalaceCore>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            core,
        }
    }

    #[tool(
        description = "Read a memory by URI. System views: system://boot (core bundle), system://index (full index), system://recent[/N]. Partial reads via chunk_id, range, or max_chars (mutually exclusive)."
    )]
    async fn read_memory(
        &self,
        Parameters(params): Parameters<ReadMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(uri = %params.uri, "read_memory called");
        to_tool_result(
            self.core
                .read_memory(
                    &params.uri,
                    params.chunk_id,
                    params.range.as_deref(),
                    params.max_chars,
                )
                .await,
        )
    }

    #[tool(
        description = "Create a new memory under a parent URI. The write guard pre-screens content against existing memories; near-duplicates return created=false with the guard verdict."
    )]
    async fn create_memory(
        &self,
        Parameters(params): Parameters<CreateMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(
            parent = %params.parent_uri,
            content_len = params.content.len(),
            "create_memory called"
        );
        to_tool_result(
            self.core
                .create_memory(
                    &params.parent_uri,
                    &params.content,
                    params.priority,
                    params.title.as_deref(),
                    params.disclosure.as_deref(),
                )
                .await,
        )
    }

    #[tool(
        description = "Update a memory: patch mode (old_string/new_string, old must match exactly once), append mode, or metadata-only (priority/disclosure). Content updates version the memory; rollback is available per session."
    )]
    async fn update_memory(
        &self,
        Parameters(params): Parameters<UpdateMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(uri = %params.uri, "update_memory called");
        to_tool_result(
            self.core
                .update_memory(
                    &params.uri,
                    params.old_string.as_deref(),
                    params.new_string.as_deref(),
                    params.append.as_deref(),
                    params.priority,
                    params.disclosure.as_deref(),
                )
                .await,
        )
    }

    #[tool(
        description = "Delete a memory path. Other aliases keep the memory reachable; deleting the last path deprecates the memory (recoverable via review)."
    )]
    async fn delete_memory(
        &self,
        Parameters(params): Parameters<DeleteMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(uri = %params.uri, "delete_memory called");
        to_tool_result(self.core.delete_memory(&params.uri).await)
    }

    #[tool(
        description = "Create an alias URI pointing at the same memory as target_uri. Aliases may cross domains."
    )]
    async fn add_alias(
        &self,
        Parameters(params): Parameters<AddAliasParams>,
    ) -> Result<String, String> {
        tracing::info!(new = %params.new_uri, target = %params.target_uri, "add_alias called");
        to_tool_result(
            self.core
                .add_alias(
                    &params.new_uri,
                    &params.target_uri,
                    params.priority.unwrap_or(0),
                    params.disclosure.as_deref(),
                )
                .await,
        )
    }

    #[tool(
        description = "Search memories with keyword/semantic/hybrid retrieval, intent routing, and graceful degradation. Filters: domain, path_prefix, max_priority, updated_after."
    )]
    async fn search_memory(
        &self,
        Parameters(params): Parameters<SearchMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(query = %params.query, "search_memory called");
        let filters = params.filters.unwrap_or_default();
        let (domain, path_prefix) = split_prefix_filter(filters.domain, filters.path_prefix);
        let request = SearchRequest {
            query: params.query,
            mode: params.mode,
            max_results: params.max_results,
            candidate_multiplier: params.candidate_multiplier,
            include_session: params.include_session,
            filters: SearchFilters {
                domain,
                path_prefix,
                max_priority: filters.max_priority,
                updated_after: filters.updated_after,
            },
        };
        to_tool_result(self.core.search_memory(&request).await)
    }

    #[tool(
        description = "Compact the current session context into a durable gist + trace memory. Flushes when the activity threshold is reached, or always with force=true."
    )]
    async fn compact_context(
        &self,
        Parameters(params): Parameters<CompactContextParams>,
    ) -> Result<String, String> {
        let reason = params.reason.as_deref().unwrap_or("manual");
        tracing::info!(reason, "compact_context called");
        to_tool_result(
            self.core
                .compact_context(reason, params.force.unwrap_or(false), params.max_lines.unwrap_or(12))
                .await,
        )
    }

    #[tool(
        description = "Enqueue retrieval index jobs: full rebuild, a single memory reindex, or a sleep-consolidation scan. wait=true blocks up to timeout_seconds."
    )]
    async fn rebuild_index(
        &self,
        Parameters(params): Parameters<RebuildIndexParams>,
    ) -> Result<String, String> {
        tracing::info!(memory_id = ?params.memory_id, "rebuild_index called");
        to_tool_result(
            self.core
                .rebuild_index(
                    params.memory_id,
                    params.reason.as_deref().unwrap_or("manual"),
                    params.wait.unwrap_or(false),
                    params.timeout_seconds.unwrap_or(30),
                    params.sleep_consolidation.unwrap_or(false),
                )
                .await,
        )
    }

    #[tool(
        description = "Index and runtime status: queue depth, active job, recent jobs ring, write-lane counters, gist and vitality stats."
    )]
    async fn index_status(
        &self,
        Parameters(_params): Parameters<IndexStatusParams>,
    ) -> Result<String, String> {
        to_tool_result(self.core.index_status().await)
    }
}

/// A `path_prefix` filter may carry a full URI; split the domain out of it.
fn split_prefix_filter(
    domain: Option<String>,
    path_prefix: Option<String>,
) -> (Option<String>, Option<String>) {
    match path_prefix {
        Some(prefix) if prefix.contains("://") => {
            let (prefix_domain, prefix_path) = prefix.split_once("://").unwrap_or(("", ""));
            (
                domain.or_else(|| Some(prefix_domain.to_lowercase())),
                Some(prefix_path.trim_matches('/').to_string()).filter(|p| !p.is_empty()),
            )
        }
        Some(prefix) => (domain, Some(prefix.trim_matches('/').to_string())),
        None => (domain, None),
    }
}

#[tool_handler]
impl ServerHandler for PalaceTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Memory Palace is a persistent memory server. Start with read_memory(\"system://boot\"), \
                 search with search_memory, write with create_memory/update_memory, and prune with \
                 delete_memory. All writes are snapshotted per session for review and rollback."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_filter_splits_full_uris() {
        let (domain, prefix) = split_prefix_filter(None, Some("writer://chapter_1".into()));
        assert_eq!(domain.as_deref(), Some("writer"));
        assert_eq!(prefix.as_deref(), Some("chapter_1"));

        let (domain, prefix) =
            split_prefix_filter(Some("core".into()), Some("agent/notes".into()));
        assert_eq!(domain.as_deref(), Some("core"));
        assert_eq!(prefix.as_deref(), Some("agent/notes"));

        let (domain, prefix) = split_prefix_filter(None, None);
        assert!(domain.is_none() && prefix.is_none());
    }

    #[test]
    fn error_payloads_carry_kind() {
        let payload = error_payload(&PalaceError::PatchNotFound("core://x".into()));
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["error"], "patch_not_found");
    }
}
